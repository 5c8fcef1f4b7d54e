//! HTTP surface.
//!
//! `POST /upscale?width=W&height=H` takes a raw RGB body of exactly
//! `W*H*3` bytes and answers with the raw upscaled image.
//!
//! Response start policy: the status line is withheld until the pipeline
//! has produced its first tile, so failures up to that point are clean
//! 500s. A failure after that point aborts the chunked body; since the
//! response carries the exact `Content-Length`, clients see a truncated
//! transfer rather than a short body that looks complete. With
//! `pipeline.buffer_response` the whole output is assembled first and
//! every failure is a 500, at the cost of holding the output in memory.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use futures_util::{stream, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::inference::TileInference;
use crate::pipeline::UpscalePipeline;
use crate::tile::{TileGeometry, CHANNELS};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Arc<dyn TileInference>,
    pipeline: PipelineConfig,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Default)]
struct Metrics {
    requests_total: AtomicU64,
    rejected_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    cancelled_total: AtomicU64,
    bytes_in_total: AtomicU64,
    bytes_out_total: AtomicU64,
}

impl Metrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricsResponse {
        MetricsResponse {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
            bytes_in_total: self.bytes_in_total.load(Ordering::Relaxed),
            bytes_out_total: self.bytes_out_total.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    pub fn new(engine: Arc<dyn TileInference>, pipeline: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                engine,
                pipeline,
                metrics: Arc::new(Metrics::default()),
            }),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsResponse {
    pub requests_total: u64,
    pub rejected_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub cancelled_total: u64,
    pub bytes_in_total: u64,
    pub bytes_out_total: u64,
}

/// Raw query values; parsed by hand so bad input gets a precise message.
#[derive(Debug, Deserialize)]
pub struct UpscaleQuery {
    pub width: Option<String>,
    pub height: Option<String>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/upscale", post(upscale))
        .route("/api/v1/upscale", post(upscale))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(state.inner.metrics.snapshot())
}

fn parse_dimension(name: &'static str, raw: Option<&str>) -> Result<usize, PipelineError> {
    let raw = raw.ok_or_else(|| PipelineError::invalid_parameter(name, "is required"))?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(PipelineError::invalid_parameter(
            name,
            format!("must be a positive integer, got '{raw}'"),
        )),
    }
}

/// Validated request dimensions and the byte counts they imply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImagePlan {
    width: usize,
    height: usize,
    input_len: u64,
    output_len: u64,
}

fn plan_image(
    width: usize,
    height: usize,
    scale: usize,
    max_image_pixels: usize,
) -> Result<ImagePlan, PipelineError> {
    let too_large = || {
        PipelineError::invalid_parameter(
            "width",
            format!("{width}x{height} exceeds the {max_image_pixels} pixel limit"),
        )
    };
    let pixels = width
        .checked_mul(height)
        .filter(|pixels| *pixels <= max_image_pixels)
        .ok_or_else(too_large)?;
    let input_len = (pixels as u64)
        .checked_mul(CHANNELS as u64)
        .ok_or_else(too_large)?;
    let output_len = (scale as u64)
        .checked_mul(scale as u64)
        .and_then(|factor| input_len.checked_mul(factor))
        .ok_or_else(too_large)?;

    Ok(ImagePlan {
        width,
        height,
        input_len,
        output_len,
    })
}

fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

async fn upscale(
    State(state): State<AppState>,
    Query(query): Query<UpscaleQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("upscale", %request_id);
    handle_upscale(state, query, headers, body)
        .instrument(span)
        .await
}

async fn handle_upscale(
    state: AppState,
    query: UpscaleQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let inner = &state.inner;
    let metrics = inner.metrics.clone();
    Metrics::bump(&metrics.requests_total);

    let scale = inner.engine.scale();
    let plan = parse_dimension("width", query.width.as_deref()).and_then(|width| {
        let height = parse_dimension("height", query.height.as_deref())?;
        plan_image(width, height, scale, inner.pipeline.max_image_pixels)
    });
    let ImagePlan {
        width,
        height,
        input_len: expected_len,
        output_len,
    } = match plan {
        Ok(plan) => plan,
        Err(err) => {
            Metrics::bump(&metrics.rejected_total);
            info!(error = %err, "Rejected upscale request");
            return Err(err.into());
        }
    };

    if let Some(declared) = declared_content_length(&headers) {
        if declared != expected_len {
            Metrics::bump(&metrics.failed_total);
            let err = PipelineError::MalformedInput(format!(
                "content-length is {declared} bytes, a {width}x{height} image needs {expected_len}"
            ));
            warn!(error = %err, "Rejected upscale body");
            return Err(err.into());
        }
    }

    let geometry = TileGeometry::strip(width, height, inner.pipeline.max_tile_pixels);
    let pipeline = UpscalePipeline::new(
        inner.engine.clone(),
        geometry,
        inner.pipeline.options(Some(expected_len)),
    )?;
    info!(
        width,
        height,
        scale,
        tile = %geometry,
        "Upscale request accepted"
    );

    let counted = metrics.clone();
    let upstream = body.into_data_stream().inspect_ok(move |chunk| {
        counted
            .bytes_in_total
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    });
    let subscription = pipeline.spawn(upstream);
    let mut tiles = Box::pin(subscription.into_stream());

    if inner.pipeline.buffer_response {
        let mut output = BytesMut::with_capacity(output_len as usize);
        while let Some(tile) = tiles.next().await {
            match tile {
                Ok(bytes) => output.extend_from_slice(&bytes),
                Err(err) => {
                    Metrics::bump(&metrics.failed_total);
                    return Err(err.into());
                }
            }
        }
        Metrics::bump(&metrics.completed_total);
        metrics
            .bytes_out_total
            .fetch_add(output.len() as u64, Ordering::Relaxed);
        return raw_response(output_len, Body::from(output.freeze()));
    }

    let first = match tiles.next().await {
        Some(Ok(first)) => first,
        Some(Err(err)) => {
            Metrics::bump(&metrics.failed_total);
            return Err(err.into());
        }
        None => Bytes::new(),
    };

    let rest: TileStream = Box::pin(stream::once(async move { Ok(first) }).chain(tiles));
    let tracked = TrackedBody {
        inner: rest,
        metrics,
        finished: false,
    };
    raw_response(output_len, Body::from_stream(tracked))
}

fn raw_response(content_length: u64, body: Body) -> Result<Response, AppError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, content_length)
        .body(body)
        .map_err(|err| AppError::Internal(format!("failed to build response: {err}")))
}

type TileStream = Pin<Box<dyn Stream<Item = Result<Bytes, PipelineError>> + Send>>;

/// Response body that records how the transfer ended.
///
/// Dropped before the end means the client went away; the subscription is
/// dropped with it, which cancels the pipeline.
struct TrackedBody {
    inner: TileStream,
    metrics: Arc<Metrics>,
    finished: bool,
}

impl Stream for TrackedBody {
    type Item = Result<Bytes, PipelineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(bytes))) => {
                this.metrics
                    .bytes_out_total
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                Metrics::bump(&this.metrics.failed_total);
                warn!(error = %err, "Upscale failed after the response started; aborting body");
            }
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    Metrics::bump(&this.metrics.completed_total);
                }
            }
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        if !self.finished {
            Metrics::bump(&self.metrics.cancelled_total);
            info!("Client disconnected before the upscale finished");
        }
    }
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        if err.is_client_error() {
            AppError::BadRequest(err.to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{nearest_upscale, BlockingInference, NearestUpscaler};
    use crate::tile::Tensor;
    use axum::http::Request;
    use tower::{Service, ServiceExt};

    fn nearest_router(scale: usize, pipeline: PipelineConfig) -> (AppState, Router) {
        let state = AppState::new(Arc::new(NearestUpscaler::new(scale)), pipeline);
        (state.clone(), app_router(state))
    }

    /// Fails, after a short delay, on any tile whose first sample is white.
    fn failing_on_white_router(pipeline: PipelineConfig) -> (AppState, Router) {
        let engine = BlockingInference::new(2, |tile: Tensor| {
            if tile[[0, 0, 0]] > 0.99 {
                std::thread::sleep(std::time::Duration::from_millis(100));
                anyhow::bail!("white tile rejected");
            }
            Ok(nearest_upscale(&tile, 2))
        });
        let state = AppState::new(Arc::new(engine), pipeline);
        (state.clone(), app_router(state))
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    fn upscale_request(path: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .body(Body::from(body))
            .unwrap()
    }

    async fn error_message(resp: Response) -> String {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["error"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_, mut app) = nearest_router(4, PipelineConfig::default());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_upscale_blank_image_has_scaled_size() {
        let (_, mut app) = nearest_router(4, PipelineConfig::default());
        let (width, height) = (128, 128);
        let req = upscale_request(
            &format!("/upscale?width={width}&height={height}"),
            vec![0; width * height * 3],
        );

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), width * 4 * height * 4 * 3);
        assert!(body.iter().all(|byte| *byte == 0));
    }

    #[tokio::test]
    async fn test_versioned_route_streams_strips_in_order() {
        let pipeline = PipelineConfig {
            max_tile_pixels: 3,
            ..PipelineConfig::default()
        };
        let (_, mut app) = nearest_router(2, pipeline);
        // 3x4 image, one value per row so strip order is visible.
        let mut input = Vec::new();
        for row in 0..4u8 {
            input.extend(std::iter::repeat(row * 10).take(3 * 3));
        }

        let resp = send_request(&mut app, upscale_request("/api/v1/upscale?width=3&height=4", input))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();

        let out_row_len = 6 * 3;
        assert_eq!(body.len(), out_row_len * 8);
        for (out_row, chunk) in body.chunks(out_row_len).enumerate() {
            let expected = (out_row / 2) as u8 * 10;
            assert!(chunk.iter().all(|byte| *byte == expected), "row {out_row}");
        }
    }

    #[tokio::test]
    async fn test_invalid_dimensions_are_rejected_with_400() {
        let (state, mut app) = nearest_router(4, PipelineConfig::default());
        for query in [
            "/upscale?height=4",
            "/upscale?width=4",
            "/upscale?width=0&height=4",
            "/upscale?width=abc&height=4",
            "/upscale?width=4&height=-2",
        ] {
            let resp = send_request(&mut app, upscale_request(query, vec![0; 48])).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{query}");
            assert!(error_message(resp).await.contains("invalid parameter"));
        }

        let snapshot = state.inner.metrics.snapshot();
        assert_eq!(snapshot.requests_total, 5);
        assert_eq!(snapshot.rejected_total, 5);
    }

    #[tokio::test]
    async fn test_oversized_dimensions_are_400_without_chunked_body() {
        let (state, mut app) = nearest_router(4, PipelineConfig::default());
        for query in [
            "/upscale?width=1073741824&height=1073741824",
            "/upscale?width=1099511627776&height=1",
            "/upscale?width=18446744073709551615&height=2",
            "/upscale?width=4097&height=4096",
        ] {
            // A streamed body carries no Content-Length, so only the query guards it.
            let chunks = futures_util::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(
                &[0, 0, 0],
            ))]);
            let req = Request::builder()
                .method("POST")
                .uri(query)
                .body(Body::from_stream(chunks))
                .unwrap();

            let resp = send_request(&mut app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{query}");
            assert!(error_message(resp).await.contains("pixel limit"), "{query}");
        }

        let snapshot = state.inner.metrics.snapshot();
        assert_eq!(snapshot.rejected_total, 4);
        assert_eq!(snapshot.bytes_in_total, 0);
    }

    #[tokio::test]
    async fn test_image_limit_is_configurable() {
        let pipeline = PipelineConfig {
            max_image_pixels: 16,
            ..PipelineConfig::default()
        };
        let (_, mut app) = nearest_router(2, pipeline);

        let resp = send_request(&mut app, upscale_request("/upscale?width=4&height=4", vec![0; 48]))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send_request(&mut app, upscale_request("/upscale?width=5&height=4", vec![0; 60]))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_plan_image_rejects_overflowing_output() {
        assert!(plan_image(usize::MAX, 1, 1, usize::MAX).is_err());
        assert!(plan_image(1 << 40, 1, 1 << 20, usize::MAX).is_err());

        let plan = plan_image(128, 64, 4, 128 * 64).expect("fits");
        assert_eq!(plan.input_len, 128 * 64 * 3);
        assert_eq!(plan.output_len, 128 * 64 * 3 * 16);
    }

    #[tokio::test]
    async fn test_short_body_is_500() {
        let (_, mut app) = nearest_router(4, PipelineConfig::default());
        let req = upscale_request("/upscale?width=4&height=4", vec![0; 4 * 4 * 3 - 1]);

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error_message(resp).await.contains("malformed input"));
    }

    #[tokio::test]
    async fn test_body_with_alpha_channel_is_500() {
        let (_, mut app) = nearest_router(4, PipelineConfig::default());
        let (width, height) = (128, 128);
        let req = upscale_request(
            &format!("/upscale?width={width}&height={height}"),
            vec![0; width * height * 4],
        );

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_content_length_mismatch_is_500_without_pipeline() {
        let (state, mut app) = nearest_router(4, PipelineConfig::default());
        let req = Request::builder()
            .method("POST")
            .uri("/upscale?width=2&height=2")
            .header(header::CONTENT_LENGTH, "11")
            .body(Body::from(vec![0u8; 11]))
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error_message(resp).await.contains("content-length is 11"));
        assert_eq!(state.inner.metrics.snapshot().bytes_in_total, 0);
    }

    #[tokio::test]
    async fn test_failure_before_first_tile_is_clean_500() {
        let (state, mut app) = failing_on_white_router(PipelineConfig::default());
        let req = upscale_request("/upscale?width=2&height=2", vec![255; 12]);

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error_message(resp).await.contains("white tile rejected"));
        assert_eq!(state.inner.metrics.snapshot().failed_total, 1);
    }

    #[tokio::test]
    async fn test_late_failure_aborts_streamed_body() {
        let pipeline = PipelineConfig {
            max_tile_pixels: 2,
            ..PipelineConfig::default()
        };
        let (state, mut app) = failing_on_white_router(pipeline);
        let mut input = vec![0u8; 2 * 3 * 3];
        input.extend([255u8; 2 * 3]);

        let resp = send_request(&mut app, upscale_request("/upscale?width=2&height=4", input)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "96");

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await;
        assert!(body.is_err(), "body must not complete");
        assert_eq!(state.inner.metrics.snapshot().failed_total, 1);
    }

    #[tokio::test]
    async fn test_buffered_mode_turns_late_failure_into_500() {
        let pipeline = PipelineConfig {
            max_tile_pixels: 2,
            buffer_response: true,
            ..PipelineConfig::default()
        };
        let (_, mut app) = failing_on_white_router(pipeline);
        let mut input = vec![0u8; 2 * 3 * 3];
        input.extend([255u8; 2 * 3]);

        let resp = send_request(&mut app, upscale_request("/upscale?width=2&height=4", input)).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_metrics_count_completed_requests() {
        let (_, mut app) = nearest_router(4, PipelineConfig::default());
        let resp = send_request(
            &mut app,
            upscale_request("/upscale?width=4&height=4", vec![9; 48]),
        )
        .await;
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 768);

        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: MetricsResponse = serde_json::from_slice(&body).unwrap();

        assert_eq!(
            snapshot,
            MetricsResponse {
                requests_total: 1,
                rejected_total: 0,
                completed_total: 1,
                failed_total: 0,
                cancelled_total: 0,
                bytes_in_total: 48,
                bytes_out_total: 768,
            }
        );
    }
}
