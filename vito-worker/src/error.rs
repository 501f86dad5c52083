use thiserror::Error;

/// Error types for worker operations.
/// The `InstanceNotFound` and `MethodNotFound` messages are part of the RPC
/// surface: callers match on them.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Vitest instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("execution context for '{id}' failed to construct: {detail}")]
    ConstructionFailed { id: String, detail: String },

    #[error("invalid worker state transition: cannot go from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
