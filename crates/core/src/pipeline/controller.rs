use std::fmt::Display;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};

use super::dispatcher::{Completion, SequencedDispatcher};
use super::outlet::Outlet;
use super::subscription::{Command, Signal};
use crate::error::PipelineError;
use crate::tile::TileBuffer;

/// Lifecycle of one pipeline. Dispatching is not a state: inference runs
/// concurrently with `Accumulating` and `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    AwaitingUpstream,
    Accumulating,
    Draining,
    Completed,
    Failed,
    Cancelled,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AwaitingUpstream => "awaiting_upstream",
            Self::Accumulating => "accumulating",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct FlowStats {
    bytes_in: u64,
    bytes_out: u64,
    tiles_delivered: u64,
    completed_calls: u64,
    total_inference: Duration,
}

/// Owns all ingestion state for one pipeline and reacts to upstream chunks,
/// inference completions and downstream commands, one message at a time.
pub(crate) struct FlowController<S> {
    upstream: Pin<Box<S>>,
    upstream_done: bool,
    tile: TileBuffer,
    dispatcher: SequencedDispatcher,
    outlet: Outlet,
    expected_len: Option<u64>,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedSender<Signal>,
    state: FlowState,
    state_tx: watch::Sender<FlowState>,
    stats: FlowStats,
}

impl<S, B, E> FlowController<S>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Buf + Send + 'static,
    E: Display + Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        upstream: S,
        tile: TileBuffer,
        dispatcher: SequencedDispatcher,
        expected_len: Option<u64>,
        commands: mpsc::UnboundedReceiver<Command>,
        signals: mpsc::UnboundedSender<Signal>,
        state_tx: watch::Sender<FlowState>,
    ) -> Self {
        Self {
            upstream: Box::pin(upstream),
            upstream_done: false,
            tile,
            dispatcher,
            outlet: Outlet::new(),
            expected_len,
            commands,
            signals,
            state: FlowState::AwaitingUpstream,
            state_tx,
            stats: FlowStats::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        let started = Instant::now();

        while !self.state.is_terminal() {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Request(n)) => self.on_request(n),
                    // A dropped subscription withdraws interest like an explicit cancel.
                    Some(Command::Cancel) | None => self.on_cancel(),
                },
                Some(completion) = self.dispatcher.next_completion(), if self.dispatcher.in_flight() > 0 => {
                    self.on_completion(completion);
                }
                chunk = self.upstream.next(), if !self.upstream_done => self.on_chunk(chunk),
            }
        }

        self.log_summary(started.elapsed());
    }

    fn on_chunk(&mut self, chunk: Option<Result<B, E>>) {
        let mut chunk = match chunk {
            None => return self.on_upstream_end(),
            Some(Err(err)) => return self.fail(PipelineError::Upstream(err.to_string())),
            Some(Ok(chunk)) => chunk,
        };

        if self.state == FlowState::AwaitingUpstream {
            self.set_state(FlowState::Accumulating);
        }

        self.stats.bytes_in += chunk.remaining() as u64;
        if let Some(expected) = self.expected_len {
            if self.stats.bytes_in > expected {
                return self.fail(PipelineError::MalformedInput(format!(
                    "received more than the expected {expected} bytes"
                )));
            }
        }

        // `append` yields once per filled tile and `None` once the chunk is spent.
        while let Some(tensor) = self.tile.append(&mut chunk) {
            let token = self.dispatcher.submit(tensor);
            tracing::trace!(token, "Tile submitted");
        }
    }

    fn on_upstream_end(&mut self) {
        self.upstream_done = true;
        self.set_state(FlowState::Draining);

        if !self.tile.is_empty() {
            let geometry = self.tile.geometry();
            return self.fail(PipelineError::MalformedInput(format!(
                "stream ended inside a tile: {} of {} bytes for a {geometry} tile",
                self.tile.filled(),
                geometry.byte_len()
            )));
        }
        if let Some(expected) = self.expected_len {
            if self.stats.bytes_in != expected {
                return self.fail(PipelineError::MalformedInput(format!(
                    "received {} bytes, expected {expected}",
                    self.stats.bytes_in
                )));
            }
        }

        tracing::debug!(
            tiles = self.dispatcher.submitted(),
            in_flight = self.dispatcher.in_flight(),
            "Upstream finished, draining"
        );
        self.complete_if_drained();
    }

    fn on_completion(&mut self, completion: Completion) {
        let Completion {
            token,
            result,
            latency,
        } = completion;
        self.stats.completed_calls += 1;
        self.stats.total_inference += latency;

        match self.dispatcher.on_complete(token, result) {
            Ok(released) => {
                for item in released {
                    self.offer(item);
                }
                self.complete_if_drained();
            }
            Err(err) => self.fail(err),
        }
    }

    fn on_request(&mut self, n: u64) {
        for item in self.outlet.request(n) {
            self.deliver(item);
        }
        self.complete_if_drained();
    }

    fn on_cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::debug!(
            in_flight = self.dispatcher.in_flight(),
            "Pipeline cancelled by downstream"
        );
        self.dispatcher.abort_all();
        self.outlet.clear();
        self.set_state(FlowState::Cancelled);
    }

    fn fail(&mut self, err: PipelineError) {
        if self.state.is_terminal() {
            return;
        }
        tracing::warn!(error = %err, state = %self.state, "Pipeline failed");
        self.dispatcher.abort_all();
        self.outlet.clear();
        let _ = self.signals.send(Signal::Error(err));
        self.set_state(FlowState::Failed);
    }

    fn offer(&mut self, item: Bytes) {
        if let Some(item) = self.outlet.offer(item) {
            self.deliver(item);
        }
    }

    fn deliver(&mut self, item: Bytes) {
        self.stats.bytes_out += item.len() as u64;
        self.stats.tiles_delivered += 1;
        let _ = self.signals.send(Signal::Next(item));
    }

    fn complete_if_drained(&mut self) {
        if self.upstream_done
            && !self.state.is_terminal()
            && self.dispatcher.is_idle()
            && self.outlet.is_drained()
        {
            let _ = self.signals.send(Signal::Complete);
            self.set_state(FlowState::Completed);
        }
    }

    fn set_state(&mut self, state: FlowState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn log_summary(&self, elapsed: Duration) {
        let avg_inference_ms = if self.stats.completed_calls > 0 {
            self.stats.total_inference.as_secs_f64() * 1000.0 / self.stats.completed_calls as f64
        } else {
            0.0
        };
        tracing::info!(
            state = %self.state,
            tiles = self.stats.tiles_delivered,
            submitted = self.dispatcher.submitted(),
            bytes_in = self.stats.bytes_in,
            bytes_out = self.stats.bytes_out,
            avg_inference_ms = format!("{:.1}", avg_inference_ms),
            total_ms = format!("{:.0}", elapsed.as_secs_f64() * 1000.0),
            "Pipeline summary"
        );
    }
}
