//! Coordinator-wide error taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Bad magic, unknown type, unexpected type, undersized payload.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Read/write error or EOF mid-frame.
    #[error("transport failed: {0}")]
    TransportFailed(#[source] std::io::Error),

    /// Listener bind/listen failed at startup.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Expected message not received within the configured window.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Model config JSON missing a field or carrying a bad `type` value.
    #[error("invalid config at line {line:?}: {reason}")]
    ConfigInvalid {
        line: Option<usize>,
        reason: String,
    },

    /// Residual buffer shape does not match the current feature map.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A worker reported an ERROR message.
    #[error("worker {worker_id} reported error {code}: {description}")]
    WorkerError {
        worker_id: u8,
        code: u8,
        description: String,
    },

    /// Engine-level wrapper carrying the cause and the layer at which an
    /// inference aborted.
    #[error("inference aborted at layer {layer_idx}: {cause}")]
    InferenceAborted { layer_idx: u32, cause: String },

    #[error(transparent)]
    Protocol(#[from] coordinator_protocol::ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON caught before field-level validation runs.
    #[error("malformed model config json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Wrap this error as the cause of an `InferenceAborted` at `layer_idx`.
    pub fn into_aborted(self, layer_idx: u32) -> Self {
        CoordinatorError::InferenceAborted {
            layer_idx,
            cause: self.to_string(),
        }
    }
}
