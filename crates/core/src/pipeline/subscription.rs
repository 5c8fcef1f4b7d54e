use bytes::Bytes;
use futures_util::stream::{self, Stream};
use tokio::sync::{mpsc, watch};

use super::controller::FlowState;
use crate::error::PipelineError;

#[derive(Debug)]
pub(crate) enum Command {
    Request(u64),
    Cancel,
}

/// What the pipeline delivers downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Next(Bytes),
    Error(PipelineError),
    Complete,
}

/// Downstream handle for one pipeline: demand in, signals out.
///
/// Dropping the subscription cancels the pipeline.
#[derive(Debug)]
pub struct TileSubscription {
    commands: mpsc::UnboundedSender<Command>,
    signals: mpsc::UnboundedReceiver<Signal>,
    state: watch::Receiver<FlowState>,
    cancelled: bool,
}

impl TileSubscription {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        signals: mpsc::UnboundedReceiver<Signal>,
        state: watch::Receiver<FlowState>,
    ) -> Self {
        Self {
            commands,
            signals,
            state,
            cancelled: false,
        }
    }

    /// Declare willingness to receive `n` more tiles.
    ///
    /// A non-positive `n` is rejected here and leaves the pipeline running.
    pub fn request(&self, n: i64) -> Result<(), PipelineError> {
        if n <= 0 {
            return Err(PipelineError::ProtocolViolation { requested: n });
        }
        if !self.cancelled {
            // Closed only once the pipeline has already finished.
            let _ = self.commands.send(Command::Request(n as u64));
        }
        Ok(())
    }

    /// Withdraw interest. Safe to call more than once; nothing is delivered
    /// afterwards.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        let _ = self.commands.send(Command::Cancel);
        self.signals.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Next signal, or `None` once the pipeline has finished or this
    /// subscription was cancelled.
    pub async fn next_signal(&mut self) -> Option<Signal> {
        if self.cancelled {
            return None;
        }
        self.signals.recv().await
    }

    pub fn state(&self) -> FlowState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<FlowState> {
        self.state.clone()
    }

    /// Wait until the pipeline reaches a terminal state.
    pub async fn finished(&self) -> FlowState {
        let mut state = self.state.clone();
        let terminal = state.wait_for(|state| state.is_terminal()).await.map(|state| *state);
        match terminal {
            Ok(state) => state,
            // The controller is gone; report the last state it published.
            Err(_) => *state.borrow(),
        }
    }

    /// Pull-based adapter: each poll requests exactly one tile.
    ///
    /// Yields `Err` once on failure and ends on completion.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, PipelineError>> + Send {
        stream::unfold(Some(self), |subscription| async move {
            let mut subscription = subscription?;
            subscription.request(1).ok()?;
            match subscription.next_signal().await? {
                Signal::Next(bytes) => Some((Ok(bytes), Some(subscription))),
                Signal::Error(err) => Some((Err(err), None)),
                Signal::Complete => None,
            }
        })
    }
}
