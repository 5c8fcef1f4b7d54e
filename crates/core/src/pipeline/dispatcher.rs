//! Concurrent inference with in-order release.
//!
//! Every completed tile gets the next [`SequenceToken`] and its inference
//! runs on its own tokio task. Tasks finish in whatever order the engine
//! allows; the [`ReorderBuffer`] holds early finishers until every lower
//! token has been released.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;

use super::SequenceToken;
use crate::error::PipelineError;
use crate::inference::TileInference;
use crate::tile::{Tensor, TileEncoder};

/// Holds out-of-order results until the next expected token arrives.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: SequenceToken,
    pending: BTreeMap<SequenceToken, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: SequenceToken, item: T) {
        debug_assert!(token >= self.next, "token {token} already released");
        self.pending.insert(token, item);
    }

    /// Pop the contiguous run starting at the next expected token.
    pub fn release(&mut self) -> Vec<T> {
        let mut released = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            released.push(item);
            self.next += 1;
        }
        released
    }

    pub fn next_token(&self) -> SequenceToken {
        self.next
    }

    pub fn held(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug)]
pub struct Completion {
    pub token: SequenceToken,
    pub result: Result<Bytes, PipelineError>,
    pub latency: Duration,
}

pub struct SequencedDispatcher {
    engine: Arc<dyn TileInference>,
    encoder: TileEncoder,
    limiter: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
    next_token: SequenceToken,
    in_flight: BTreeMap<SequenceToken, AbortHandle>,
    reorder: ReorderBuffer<Bytes>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl SequencedDispatcher {
    pub fn new(
        engine: Arc<dyn TileInference>,
        encoder: TileEncoder,
        max_in_flight: Option<usize>,
        timeout: Option<Duration>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            encoder,
            limiter: max_in_flight.map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
            timeout,
            next_token: 0,
            in_flight: BTreeMap::new(),
            reorder: ReorderBuffer::new(),
            completions_tx,
            completions_rx,
        }
    }

    /// Assign the next token and schedule inference for `tensor`.
    ///
    /// Must be called from within a tokio runtime. Never waits: admission
    /// limiting happens inside the spawned task.
    pub fn submit(&mut self, tensor: Tensor) -> SequenceToken {
        let token = self.next_token;
        self.next_token += 1;

        let engine = self.engine.clone();
        let encoder = self.encoder;
        let limiter = self.limiter.clone();
        let timeout = self.timeout;
        let completions = self.completions_tx.clone();

        let handle = tokio::spawn(async move {
            let (result, latency) =
                run_tile(engine, encoder, limiter, timeout, tensor, token).await;
            let _ = completions.send(Completion {
                token,
                result,
                latency,
            });
        });
        self.in_flight.insert(token, handle.abort_handle());
        token
    }

    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.completions_rx.recv().await
    }

    /// Record a finished call and return every result now releasable in
    /// token order. A failed call is returned as the error.
    pub fn on_complete(
        &mut self,
        token: SequenceToken,
        result: Result<Bytes, PipelineError>,
    ) -> Result<Vec<Bytes>, PipelineError> {
        if self.in_flight.remove(&token).is_none() {
            // Aborted before its completion was observed.
            return Ok(Vec::new());
        }
        self.reorder.insert(token, result?);
        Ok(self.reorder.release())
    }

    pub fn submitted(&self) -> u64 {
        self.next_token
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// No call is running and nothing is held for reordering.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.reorder.held() == 0
    }

    /// Abort every outstanding call and forget held results.
    pub fn abort_all(&mut self) {
        for handle in self.in_flight.values() {
            handle.abort();
        }
        self.in_flight.clear();
        self.reorder.clear();
    }
}

impl Drop for SequencedDispatcher {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn run_tile(
    engine: Arc<dyn TileInference>,
    encoder: TileEncoder,
    limiter: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
    tensor: Tensor,
    token: SequenceToken,
) -> (Result<Bytes, PipelineError>, Duration) {
    let _permit = match limiter {
        Some(semaphore) => match semaphore.acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                return (
                    Err(PipelineError::Internal("admission limiter closed".into())),
                    Duration::ZERO,
                )
            }
        },
        None => None,
    };

    let started = Instant::now();
    let call = AssertUnwindSafe(async move { engine.upscale(tensor).await }).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return (
                    Err(inference_failure(
                        token,
                        format!("no result within {}ms", limit.as_millis()),
                    )),
                    started.elapsed(),
                )
            }
        },
        None => call.await,
    };
    let latency = started.elapsed();

    let result = match outcome {
        Err(_) => Err(inference_failure(token, "inference call panicked")),
        Ok(Err(err)) => Err(inference_failure(token, format!("{err:#}"))),
        Ok(Ok(upscaled)) => encoder
            .encode(&upscaled)
            .map_err(|err| inference_failure(token, format!("{err:#}"))),
    };
    (result, latency)
}

fn inference_failure(token: SequenceToken, message: impl Into<String>) -> PipelineError {
    PipelineError::InferenceFailure {
        token,
        message: message.into(),
    }
}
