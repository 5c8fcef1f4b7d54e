//! Streaming upscale pipeline.
//!
//! One pipeline serves one request. Upstream chunks are cut into tiles,
//! each tile is upscaled concurrently, and encoded results are delivered
//! downstream strictly in input order and only against explicit demand.
//!
//! ```text
//! upstream ──► FlowController ──► SequencedDispatcher ──► tokio tasks
//!                  ▲    │                ▲                    │
//!    commands ─────┘    ▼                └──── completions ◄──┘
//!                   Outlet ──► signals ──► TileSubscription
//! ```

mod controller;
mod dispatcher;
mod outlet;
mod subscription;

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use futures_util::Stream;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

pub use controller::FlowState;
pub use dispatcher::{Completion, ReorderBuffer, SequencedDispatcher};
pub use outlet::{DemandCounter, Outlet, ReadyQueue};
pub use subscription::{Signal, TileSubscription};

use controller::FlowController;

use crate::error::PipelineError;
use crate::inference::TileInference;
use crate::tile::{TileBuffer, TileEncoder, TileGeometry};

/// Position of a tile in the input stream, assigned when the tile fills.
pub type SequenceToken = u64;

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Upper bound on simultaneous inference calls. `None` is unbounded.
    pub max_in_flight: Option<usize>,
    /// Per-call deadline; an expired call fails the pipeline.
    pub inference_timeout: Option<Duration>,
    /// Exact number of input bytes the upstream must deliver.
    pub expected_len: Option<u64>,
}

pub struct UpscalePipeline {
    engine: Arc<dyn TileInference>,
    geometry: TileGeometry,
    options: PipelineOptions,
}

impl UpscalePipeline {
    /// Rejects a zero-area tile and an engine whose scale is zero.
    pub fn new(
        engine: Arc<dyn TileInference>,
        geometry: TileGeometry,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        if geometry.pixels() == 0 {
            return Err(PipelineError::invalid_parameter(
                "tile",
                format!("{geometry} has no pixels"),
            ));
        }
        if engine.scale() == 0 {
            return Err(PipelineError::invalid_parameter(
                "scale",
                format!("{} reports a scale of 0", engine.name()),
            ));
        }
        Ok(Self {
            engine,
            geometry,
            options,
        })
    }

    pub fn geometry(&self) -> TileGeometry {
        self.geometry
    }

    pub fn output_geometry(&self) -> TileGeometry {
        self.geometry.scaled(self.engine.scale())
    }

    /// Start the controller task and hand back the downstream handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, B, E>(self, upstream: S) -> TileSubscription
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: Buf + Send + 'static,
        E: Display + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(FlowState::AwaitingUpstream);

        let encoder = TileEncoder::new(self.geometry, self.engine.scale());
        tracing::debug!(
            engine = self.engine.name(),
            tile = %self.geometry,
            output_tile = %encoder.output_geometry(),
            max_in_flight = ?self.options.max_in_flight,
            "Starting upscale pipeline"
        );

        let dispatcher = SequencedDispatcher::new(
            self.engine,
            encoder,
            self.options.max_in_flight,
            self.options.inference_timeout,
        );
        let controller = FlowController::new(
            upstream,
            TileBuffer::new(self.geometry),
            dispatcher,
            self.options.expected_len,
            commands_rx,
            signals_tx,
            state_tx,
        );
        tokio::spawn(controller.run().instrument(tracing::Span::current()));

        TileSubscription::new(commands_tx, signals_rx, state_rx)
    }
}
