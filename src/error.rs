use thiserror::Error;

/// Failures the reporter distinguishes. Only `Configuration` is fatal; the
/// others are recovered per object and surface as counters in `RunStats`.
#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("retrieval of {key} failed after {attempts} attempt(s): {source}")]
    Retrieval { key: String, attempts: u32, source: StoreError },
    #[error("decompression of {key} failed: {source}")]
    Decompression { key: String, source: std::io::Error },
}

impl ReporterError {
    pub fn config(msg: impl Into<String>) -> Self { ReporterError::Configuration(msg.into()) }
}

/// Errors raised by an `ObjectStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("attempt timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Missing objects and permission failures will not change on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::NotFound(_) | StoreError::AccessDenied(_))
    }
}

pub type Result<T, E = ReporterError> = std::result::Result<T, E>;
