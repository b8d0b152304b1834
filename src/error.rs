//! Error types for the courier messaging core.

use thiserror::Error;

/// Errors surfaced by the messaging core.
///
/// Only `start`/`stop` propagate these to callers; the delivery facade
/// converts every variant into a safe default (`false`, `0`, cached value)
/// at its boundary.
#[derive(Debug, Error)]
pub enum CourierError {
    /// The worker process could not be launched.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// The channel to the worker closed before the frame could be written.
    #[error("worker channel closed before send completed")]
    ChannelClosed,

    /// The worker process exited while the request was outstanding.
    #[error("worker exited (code {code:?}, signal {signal:?})")]
    WorkerExited {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// No response arrived within the per-request timeout. The worker-side
    /// effect, if any, is not cancelled.
    #[error("request '{action}' timed out after {timeout_ms} ms")]
    RequestTimeout { action: String, timeout_ms: u64 },

    /// The worker answered `ok: false`.
    #[error("worker error ({code}): {message}")]
    Worker { code: String, message: String },

    /// No live worker exists and none is desired.
    #[error("worker is not running")]
    NotRunning,

    /// A wire frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CourierError {
    /// Build a `Worker` error from a response, defaulting the code when the
    /// worker did not supply one.
    pub fn worker(code: Option<String>, message: impl Into<String>) -> Self {
        Self::Worker {
            code: code.unwrap_or_else(|| crate::protocol::codes::WORKER_ERROR.to_string()),
            message: message.into(),
        }
    }

    /// Stable code for logging and for worker-bound error frames.
    pub fn code(&self) -> &str {
        match self {
            Self::Spawn(_) => "SPAWN_FAILED",
            Self::ChannelClosed => "CHANNEL_CLOSED",
            Self::WorkerExited { .. } => "WORKER_EXITED",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::Worker { code, .. } => code,
            Self::NotRunning => "NOT_RUNNING",
            Self::Codec(_) => "BAD_FRAME",
        }
    }

    /// True when the error means the process side of the channel is gone and
    /// a restart (rather than a retry of the same request) is the remedy.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::WorkerExited { .. })
    }
}

/// Result alias for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;
