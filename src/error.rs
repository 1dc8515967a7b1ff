//! Error types shared across the queue backend.

use thiserror::Error;

/// Convenience alias used by every fallible operation in this crate.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Errors surfaced by queue operations.
///
/// Precondition failures are not errors: a stale `finish_job`, a `retry_job`
/// whose row has advanced, or a lock at its limit all report `false` from the
/// operation itself. This type covers store failures and invalid input.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying store failed or rejected an operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored payload could not be encoded or decoded as JSON.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A note key contained one of the reserved characters `.`, `[` or `]`.
    #[error("invalid note key: {0:?}")]
    InvalidNoteKey(String),

    /// A stored timestamp did not match the canonical text format.
    #[error("malformed timestamp in database: {0:?}")]
    Timestamp(String),

    /// A stored job state was not one of the four lifecycle states.
    #[error("malformed job state in database: {0}")]
    State(String),

    /// A schema migration step could not be applied.
    #[error("schema migration step {version} failed: {source}")]
    Migration {
        /// Version of the step that failed.
        version: i64,
        /// Error reported by the store.
        #[source]
        source: sqlx::Error,
    },

    /// A schema version was requested that no migration step defines.
    #[error("unknown schema version {0}")]
    UnknownVersion(i64),
}
