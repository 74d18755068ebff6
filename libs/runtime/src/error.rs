//! Runtime error types

use thiserror::Error;
use types::FiberId;

/// Main runtime error type.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("fiber {0} not found")]
    FiberNotFound(FiberId),

    #[error("fiber {0} is disposed")]
    FiberDisposed(FiberId),

    #[error("fiber id space exhausted")]
    FiberIdsExhausted,

    /// The other side of a pending operation went away before completing.
    #[error("operation canceled: {0}")]
    Canceled(&'static str),

    #[error("fiber initialization failed: {0}")]
    InitFailed(String),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
