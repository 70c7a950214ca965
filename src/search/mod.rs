//! The search engine seam: the derived, searchable projection of the store.

pub mod elastic;
pub mod queries;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::SearchError;

/// One bulk operation against the search engine.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    Index {
        index: String,
        id: String,
        document: Value,
    },
    Delete {
        index: String,
        id: String,
    },
}

impl BulkOp {
    pub fn kind(&self) -> &'static str {
        match self {
            BulkOp::Index { .. } => "index",
            BulkOp::Delete { .. } => "delete",
        }
    }
}

/// Per-item outcome of a bulk request, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub status: u16,
    /// Failure type reported by the engine, e.g. a mapping conflict.
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status < 300
    }

    /// Item failures worth re-submitting: queue rejections and overload.
    pub fn is_transient(&self) -> bool {
        matches!(self.status, 429 | 502 | 503 | 504)
    }
}

/// The contract the sync engine consumes from the search engine.
#[async_trait]
pub trait SearchEngine: Send + Sync + 'static {
    /// Creates or replaces an index template.
    async fn put_template(&self, name: &str, body: &Value) -> Result<(), SearchError>;

    /// Creates an index if it does not already exist.
    async fn ensure_index(&self, index: &str) -> Result<(), SearchError>;

    async fn update_settings(&self, indices: &[String], settings: &Value)
        -> Result<(), SearchError>;

    async fn refresh(&self, indices: &[String]) -> Result<(), SearchError>;

    /// Submits operations in order, returning one result per operation.
    async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<BulkItemResult>, SearchError>;

    /// Deletes every document matching `query`. Returns the deleted count.
    async fn delete_by_query(&self, indices: &[String], query: &Value)
        -> Result<u64, SearchError>;

    async fn count(&self, indices: &[String], query: &Value) -> Result<u64, SearchError>;

    /// Runs a full search request body, returning the raw response.
    async fn search(&self, indices: &[String], body: &Value) -> Result<Value, SearchError>;
}
