//! Error taxonomy for the index layer.
//!
//! Three failure classes cross the public API:
//! - [`IndexError::MalformedRecord`] — a primary-store record cannot be
//!   materialized into a document. Fails single-record indexing; skipped
//!   and counted during bulk backfill.
//! - [`IndexError::InvalidQueryOptions`] — caller-supplied pagination or
//!   sort is structurally invalid. Never retried.
//! - [`IndexError::IndexUnavailable`] — transient engine failure. All
//!   write operations are idempotent, so retrying is always safe; the
//!   retry policy itself belongs to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    /// A record is missing a required field or carries the wrong scalar
    /// kind for it.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Negative offset/limit or an unknown sort field.
    #[error("invalid query options: {0}")]
    InvalidQueryOptions(String),

    /// The underlying index engine cannot be reached.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),
}

impl IndexError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        IndexError::MalformedRecord(msg.into())
    }

    pub fn invalid_options(msg: impl Into<String>) -> Self {
        IndexError::InvalidQueryOptions(msg.into())
    }

    /// Whether a retry with the same arguments can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::IndexUnavailable(_))
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        IndexError::IndexUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
