use thiserror::Error;

/// Pipeline error kinds. Per-record failures (`MalformedRecord`) are caught,
/// logged, and counted by the orchestrator; everything else escalates and
/// terminates the run with prior chunks left committed.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The input side failed: unreadable directory, network failure, or a
    /// non-success response from the remote store listing endpoint.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A record's payload failed validation. Never aborts a run.
    #[error("malformed record {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    /// A destination statement or chunk failed to apply.
    #[error("destination write failed: {0}")]
    DestinationWrite(#[from] sqlx::Error),

    /// Operator-requested cancellation, honored between chunks and pages.
    #[error("interrupted by operator")]
    Interrupted,
}

impl IngestError {
    pub fn source_unavailable(err: impl std::fmt::Display) -> Self {
        IngestError::SourceUnavailable(err.to_string())
    }
}
