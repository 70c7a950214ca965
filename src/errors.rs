use std::time::Duration;

use thiserror::Error;

/// Rejection of caller-supplied input before it reaches the document store.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("record ids must be non-empty strings")]
    EmptyRecordId,

    #[error("record data must be a map at the root, record {id:?} is not")]
    RootNotAMap { id: String },

    #[error("field names must not begin with an underscore, found {field:?} in record {id:?}")]
    ReservedField { id: String, field: String },

    #[error("keyword length must be between 1 and 32766, got {0}")]
    KeywordLength(usize),

    #[error("float format {0:?} is not a \"{{0:.<digits>g}}\" style template")]
    FloatFormat(String),

    #[error("latitude field {0:?} is referenced by more than one geo hint")]
    DuplicateGeoHint(String),

    #[error("geo hint segments must be at least 3, got {0}")]
    GeoHintSegments(u16),
}

/// Failures talking to the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("stored document is malformed: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Failures talking to the search engine.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search engine unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),

    #[error("search request failed with status {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("search response is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl SearchError {
    /// Transient failures are worth retrying with backoff; anything else is
    /// permanent and must be reported instead.
    pub fn is_transient(&self) -> bool {
        match self {
            SearchError::Unavailable(err) => err.is_timeout() || err.is_connect(),
            SearchError::Status { status, .. } => {
                matches!(status, 429 | 502 | 503 | 504)
            }
            SearchError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock {id:?} within {waited:?}")]
    Timeout { id: String, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised on the ingest/commit path. These propagate immediately, the
/// caller decides whether to retry.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("the commit lock for {database:?} is held elsewhere")]
    CommitConflict { database: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while projecting the document store into the search engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync for {database:?} is already running")]
    Busy { database: String },

    #[error("sync was cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("sync worker failed: {0}")]
    Worker(#[from] anyhow::Error),
}

/// A diff could not be applied to the given tree. Round-tripping diffs
/// produced by [`crate::diff::diff`] never hits this; it guards against
/// corrupted or mismatched history.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch path {path:?} does not exist in the target tree")]
    MissingPath { path: String },

    #[error("patch path {path:?} addresses a {found} where a {expected} was expected")]
    WrongShape {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
}
