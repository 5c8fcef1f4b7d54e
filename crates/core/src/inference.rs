//! The inference contract the pipeline calls against, plus engines that need
//! no model file.
//!
//! An engine receives one `(3, H, W)` tile tensor and must produce the
//! `(3, H·k, W·k)` upscaled tensor. Whether the work is asynchronous or a
//! blocking call is up to the engine; the pipeline only awaits the returned
//! future on a spawned task, never on the ingestion path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::Array3;

use crate::tile::Tensor;

pub type InferenceFuture = Pin<Box<dyn Future<Output = Result<Tensor>> + Send + 'static>>;

pub trait TileInference: Send + Sync + 'static {
    /// Fixed enlargement factor `k` applied to both tile dimensions.
    fn scale(&self) -> usize;

    fn upscale(&self, tile: Tensor) -> InferenceFuture;

    fn name(&self) -> &str {
        "TileInference"
    }
}

/// Adapts a synchronous upscale function by running each call on tokio's
/// blocking pool.
pub struct BlockingInference<F> {
    scale: usize,
    run: Arc<F>,
}

impl<F> BlockingInference<F>
where
    F: Fn(Tensor) -> Result<Tensor> + Send + Sync + 'static,
{
    pub fn new(scale: usize, run: F) -> Self {
        Self {
            scale,
            run: Arc::new(run),
        }
    }
}

impl<F> TileInference for BlockingInference<F>
where
    F: Fn(Tensor) -> Result<Tensor> + Send + Sync + 'static,
{
    fn scale(&self) -> usize {
        self.scale
    }

    fn upscale(&self, tile: Tensor) -> InferenceFuture {
        let run = self.run.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || run(tile))
                .await
                .map_err(|join_error| anyhow!("blocking inference task failed: {join_error}"))?
        })
    }

    fn name(&self) -> &str {
        "BlockingInference"
    }
}

/// Pixel replication by an integer factor. Model-free, used for smoke runs.
#[derive(Debug, Clone, Copy)]
pub struct NearestUpscaler {
    scale: usize,
}

impl NearestUpscaler {
    pub fn new(scale: usize) -> Self {
        Self {
            scale: scale.max(1),
        }
    }
}

pub fn nearest_upscale(tile: &Tensor, scale: usize) -> Tensor {
    let (channels, height, width) = tile.dim();
    Array3::from_shape_fn(
        (channels, height * scale, width * scale),
        |(channel, y, x)| tile[[channel, y / scale, x / scale]],
    )
}

impl TileInference for NearestUpscaler {
    fn scale(&self) -> usize {
        self.scale
    }

    fn upscale(&self, tile: Tensor) -> InferenceFuture {
        let scale = self.scale;
        Box::pin(async move { Ok(nearest_upscale(&tile, scale)) })
    }

    fn name(&self) -> &str {
        "NearestUpscaler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn test_nearest_upscale_replicates_pixels() {
        let mut tile = Tensor::zeros((3, 1, 2));
        tile[[0, 0, 0]] = 0.25;
        tile[[2, 0, 1]] = 0.75;

        let out = nearest_upscale(&tile, 2);
        assert_eq!(out.shape(), &[3, 2, 4]);
        assert_eq!(out[[0, 0, 0]], 0.25);
        assert_eq!(out[[0, 1, 1]], 0.25);
        assert_eq!(out[[0, 0, 2]], 0.0);
        assert_eq!(out[[2, 1, 3]], 0.75);
    }

    #[tokio::test]
    async fn test_nearest_upscaler_reports_scale() {
        let engine = NearestUpscaler::new(4);
        assert_eq!(engine.scale(), 4);
        let out = engine
            .upscale(Tensor::zeros((3, 2, 3)))
            .await
            .expect("upscale");
        assert_eq!(out.shape(), &[3, 8, 12]);
    }

    #[tokio::test]
    async fn test_blocking_inference_runs_closure() {
        let engine = BlockingInference::new(2, |tile: Tensor| Ok(nearest_upscale(&tile, 2)));
        let out = engine
            .upscale(Tensor::ones((3, 1, 1)))
            .await
            .expect("upscale");
        assert_eq!(out.shape(), &[3, 2, 2]);
        assert!(out.iter().all(|v| *v == 1.0));
    }

    #[tokio::test]
    async fn test_blocking_inference_propagates_errors() {
        let engine = BlockingInference::new(2, |_tile: Tensor| -> Result<Tensor> {
            bail!("device lost")
        });
        let err = engine
            .upscale(Tensor::zeros((3, 1, 1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("device lost"));
    }
}
