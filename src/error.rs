use thiserror::Error;

pub type Result<T> = std::result::Result<T, BerthError>;

#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Path escapes its root: {0}")]
    OutsideRoot(String),

    #[error("Archive size limit exceeded: reached {reached} bytes, limit is {limit}")]
    SizeLimitExceeded { limit: u64, reached: u64 },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("{failed} of {total} sub-operations failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BerthError {
    /// Stable category string surfaced in API error bodies.
    pub fn category(&self) -> &'static str {
        match self {
            BerthError::Validation(_) => "validation",
            BerthError::NotFound(_) => "not_found",
            BerthError::OutsideRoot(_) => "outside_root",
            BerthError::SizeLimitExceeded { .. } => "size_limit_exceeded",
            BerthError::Timeout(_) => "timeout",
            BerthError::PartialFailure { .. } => "partial_failure",
            BerthError::Runtime(_)
            | BerthError::Io(_)
            | BerthError::Http(_)
            | BerthError::Serialization(_) => "fatal",
        }
    }
}
