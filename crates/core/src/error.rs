//! Error types for the market pipeline.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the market pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error. Fatal at run start.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure that may succeed on retry.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// An upstream page did not match the expected schema.
    #[error("Malformed page: {0}")]
    MalformedPage(String),

    /// A single record could not be normalized.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Upstream kept failing after the local retry budget was spent.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// A stage's required input batch was never published.
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// The persistent store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Feed sequence discontinuity. Triggers a resubscribe, never surfaces
    /// as a stage failure.
    #[error("Sequence gap on {token_id}: expected {expected}, got {got}")]
    SequenceGap {
        token_id: String,
        expected: u64,
        got: u64,
    },

    /// Operation ran past its wall-clock budget.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Another run holds the environment lock.
    #[error("Run in progress: {0}")]
    RunInProgress(String),

    /// A staging batch on disk is truncated or has an unexpected kind.
    #[error("Corrupt batch: {0}")]
    CorruptBatch(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a transient network error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::TransientNetwork(msg.into())
    }

    /// Create a malformed page error.
    pub fn malformed_page(msg: impl Into<String>) -> Self {
        Error::MalformedPage(msg.into())
    }

    /// Create a malformed record error.
    pub fn malformed_record(msg: impl Into<String>) -> Self {
        Error::MalformedRecord(msg.into())
    }

    /// Create an upstream error.
    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    /// Create a missing input error.
    pub fn missing_input(msg: impl Into<String>) -> Self {
        Error::MissingInput(msg.into())
    }

    /// Create a store unavailable error.
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Error::StoreUnavailable(msg.into())
    }

    /// Create a deadline exceeded error.
    pub fn deadline(msg: impl Into<String>) -> Self {
        Error::DeadlineExceeded(msg.into())
    }

    /// Create a corrupt batch error.
    pub fn corrupt_batch(msg: impl Into<String>) -> Self {
        Error::CorruptBatch(msg.into())
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }

    /// Whether the failure is worth retrying at the point of occurrence
    /// (page fetch, reconnect, store write).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientNetwork(_)
                | Error::MalformedPage(_)
                | Error::StoreUnavailable(_)
                | Error::SequenceGap { .. }
        )
    }

    /// Whether the orchestrator should retry a stage that failed with this
    /// error. Retrying cannot fix a missing predecessor or a bad config.
    pub fn is_stage_retryable(&self) -> bool {
        !matches!(
            self,
            Error::MissingInput(_) | Error::Config(_) | Error::RunInProgress(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::transient("reset").is_transient());
        assert!(Error::malformed_page("no data").is_transient());
        assert!(Error::store_unavailable("busy").is_transient());
        assert!(!Error::missing_input("raw").is_transient());
        assert!(!Error::upstream("gave up").is_transient());
        assert!(!Error::malformed_record("no id").is_transient());
    }

    #[test]
    fn test_stage_retry_classification() {
        assert!(!Error::missing_input("catalog").is_stage_retryable());
        assert!(!Error::config("bad env").is_stage_retryable());
        assert!(Error::upstream("page 3").is_stage_retryable());
        assert!(Error::store_unavailable("locked").is_stage_retryable());
    }

    #[test]
    fn test_sequence_gap_display() {
        let err = Error::SequenceGap {
            token_id: "123".to_string(),
            expected: 5,
            got: 7,
        };
        assert_eq!(err.to_string(), "Sequence gap on 123: expected 5, got 7");
    }
}
