use thiserror::Error;

use crate::pipeline::SequenceToken;

/// Failure kinds surfaced by an upscale pipeline.
///
/// `InvalidParameter` never reaches a running pipeline: it is raised at the
/// request boundary before one is created. `ProtocolViolation` is returned
/// only to the downstream caller that issued the bad demand.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("inference failed for tile {token}: {message}")]
    InferenceFailure {
        token: SequenceToken,
        message: String,
    },

    #[error("invalid demand: requested {requested} items, must be positive")]
    ProtocolViolation { requested: i64 },

    #[error("upstream failed: {0}")]
    Upstream(String),

    #[error("internal pipeline error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// Request-shape errors map to a client error; everything else is a
    /// server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidParameter { .. })
    }
}
