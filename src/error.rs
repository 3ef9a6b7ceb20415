//! Crate-wide error taxonomy (spec §7): configuration errors and backend
//! errors abort detector construction; data errors are logged and the
//! offending event is skipped; not-implemented signals an unsupported
//! ingest channel.

use derive_more::From;

/// The four error classes a detector can produce.
#[derive(Debug, thiserror::Error, From)]
pub enum CoreError {
    /// Missing required option, illegal option combination, or a rule that
    /// fails its own internal consistency check at construction time.
    #[error("configuration error: {0}")]
    #[from(ignore)]
    Configuration(String),

    /// The injected `BackendClient` failed (NewTerms backfill, AdvanceSearch
    /// query). Construction fails with the backend error chained.
    #[error("backend error: {0}")]
    Backend(anyhow::Error),

    /// A malformed field value (e.g. a non-numeric `field_value`). The
    /// event is skipped and evaluation continues.
    #[error("data error: {0}")]
    #[from(ignore)]
    Data(String),

    /// The detector does not support this ingest channel.
    #[error("{channel} is not supported by this detector")]
    #[from(ignore)]
    NotImplemented { channel: &'static str },
}

impl CoreError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        CoreError::Configuration(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        CoreError::Data(msg.into())
    }

    pub fn not_implemented(channel: &'static str) -> Self {
        CoreError::NotImplemented { channel }
    }

    /// Stable numeric code, for callers that prefer to branch on an integer
    /// rather than match the enum (e.g. a scheduler logging error metrics).
    pub fn code(&self) -> i32 {
        match self {
            CoreError::Configuration(_) => 1001,
            CoreError::Backend(_) => 1002,
            CoreError::Data(_) => 1003,
            CoreError::NotImplemented { .. } => 1004,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
