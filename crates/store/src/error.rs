use loom_core::error::CoreError;

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A domain-level error from `loom_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A store location that is neither a local path nor `s3://bucket[/prefix]`.
    #[error("Invalid store URI: {0}")]
    InvalidUri(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An S3 request failed.
    #[error("S3 {operation} failed: {message}")]
    S3 {
        operation: &'static str,
        message: String,
    },

    /// The ledger lock could not be acquired in time.
    #[error("Timed out waiting for lock {0}")]
    LockTimeout(String),
}

/// Convenience alias for storage results.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn s3<E>(operation: &'static str, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::S3 {
            operation,
            message: aws_sdk_s3::error::DisplayErrorContext(err).to_string(),
        }
    }
}
