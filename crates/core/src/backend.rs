//! ONNX Runtime inference backend.
//!
//! [`build_session`] creates an `ort::Session` with the execution providers
//! for the selected [`InferenceBackend`]; [`OrtUpscaler`] wraps that session
//! as a [`TileInference`] engine.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use ndarray::{ArrayD, Axis, Ix3};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor as OrtTensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::inference::{InferenceFuture, NearestUpscaler, TileInference};
use crate::tile::Tensor;

/// Inference backend selection.
///
/// `Tensorrt` needs the TensorRT runtime libraries; when they are missing
/// the session falls back to the CUDA EP, and from there to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    #[serde(alias = "trt")]
    Tensorrt,
    /// Model-free pixel replication.
    Nearest,
}

impl FromStr for InferenceBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::Tensorrt),
            "nearest" => Ok(Self::Nearest),
            other => bail!("unknown backend '{other}' (expected cpu, cuda, tensorrt or nearest)"),
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Nearest => write!(f, "nearest"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("Failed to load ONNX model: {}", config.model_path.display());

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );
            let started = Instant::now();
            let session = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?;
            info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                "TensorRT session ready"
            );
            session
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");
            builder
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
        InferenceBackend::Nearest => bail!("the nearest backend does not use an ONNX session"),
    };

    Ok(session)
}

#[derive(Debug, Clone)]
struct ModelIo {
    input_name: String,
    output_name: String,
    fp16: bool,
}

/// Super-resolution model run through ONNX Runtime, one tile per call.
///
/// The model takes `(1, 3, H, W)` and must return `(1, 3, H·k, W·k)`.
pub struct OrtUpscaler {
    session: Arc<Mutex<Session>>,
    io: Arc<ModelIo>,
    scale: usize,
}

impl OrtUpscaler {
    pub fn load(config: &SessionConfig<'_>, scale: usize) -> Result<Self> {
        let session = build_session(config)?;

        let io = detect_io(&session)?;
        debug!(
            input_name = %io.input_name,
            output_name = %io.output_name,
            fp16 = io.fp16,
            "Detected model IO"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            io: Arc::new(io),
            scale,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.io.fp16
    }
}

fn detect_io(session: &Session) -> Result<ModelIo> {
    let input = session.inputs().first().context("model has no inputs")?;
    let output = session.outputs().first().context("model has no outputs")?;
    let fp16 = matches!(
        input.dtype(),
        ort::value::ValueType::Tensor { ty, .. } if *ty == ort::tensor::TensorElementType::Float16
    );

    Ok(ModelIo {
        input_name: input.name().to_string(),
        output_name: output.name().to_string(),
        fp16,
    })
}

impl TileInference for OrtUpscaler {
    fn scale(&self) -> usize {
        self.scale
    }

    fn upscale(&self, tile: Tensor) -> InferenceFuture {
        let session = self.session.clone();
        let io = self.io.clone();
        let scale = self.scale;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || run_model(&session, &io, tile, scale))
                .await
                .map_err(|join_error| anyhow!("inference task failed: {join_error}"))?
        })
    }

    fn name(&self) -> &str {
        "OrtUpscaler"
    }
}

fn run_model(session: &Mutex<Session>, io: &ModelIo, tile: Tensor, scale: usize) -> Result<Tensor> {
    let (channels, height, width) = tile.dim();
    let batch = tile.insert_axis(Axis(0));

    let output: ArrayD<f32> = {
        let mut session = session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
        if io.fp16 {
            let input = OrtTensor::from_array(batch.mapv(f16::from_f32))?;
            let outputs = session.run(ort::inputs![io.input_name.as_str() => &input])?;
            let view = outputs[io.output_name.as_str()].try_extract_array::<f16>()?;
            view.mapv(f16::to_f32)
        } else {
            let input = OrtTensor::from_array(batch)?;
            let outputs = session.run(ort::inputs![io.input_name.as_str() => &input])?;
            let view = outputs[io.output_name.as_str()].try_extract_array::<f32>()?;
            view.to_owned()
        }
    };

    let expected = [1, channels, height * scale, width * scale];
    if output.shape() != &expected[..] {
        bail!(
            "model returned shape {:?}, expected {:?}",
            output.shape(),
            expected
        );
    }
    output
        .index_axis_move(Axis(0), 0)
        .into_dimensionality::<Ix3>()
        .context("model output is not a 3-channel image")
}

/// Build the engine named by the model configuration.
pub fn load_upscaler(config: &ModelConfig) -> Result<Arc<dyn TileInference>> {
    if config.scale == 0 {
        bail!("model scale must be at least 1");
    }

    if config.backend == InferenceBackend::Nearest {
        info!(scale = config.scale, "Using nearest-neighbour upscaler");
        return Ok(Arc::new(NearestUpscaler::new(config.scale)));
    }

    info!(
        model = %config.path.display(),
        backend = %config.backend,
        scale = config.scale,
        "Loading ONNX super-resolution model"
    );
    let session_config = SessionConfig {
        model_path: &config.path,
        backend: config.backend,
        trt_cache_dir: Some(config.trt_cache_dir.as_path()),
    };
    let upscaler = OrtUpscaler::load(&session_config, config.scale)?;
    Ok(Arc::new(upscaler))
}
