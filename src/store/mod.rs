//! The document store: the authoritative home of versioned records.
//!
//! The core consumes a narrow contract — record get/stage/commit, a status
//! document per database, a lock registry, and an options changelog. The
//! production backend is Postgres; the in-process memory backend implements
//! the same contract for embedded use and tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StoreError;
use crate::parser::options::ParsingOptions;
use crate::record::{StoredRecord, Version};

/// One status document per database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStatus {
    pub database: String,

    /// The database's monotonic clock: the version of the newest commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_version: Option<Version>,

    /// The sync engine's checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_indexed_version: Option<Version>,

    /// The version at which the current parsing options became active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options_version: Option<Version>,

    #[serde(default = "ParsingOptions::default")]
    pub parsing_options: ParsingOptions,
}

impl DatabaseStatus {
    pub fn new(database: impl Into<String>) -> Self {
        DatabaseStatus {
            database: database.into(),
            committed_version: None,
            last_indexed_version: None,
            options_version: None,
            parsing_options: ParsingOptions::default(),
        }
    }
}

/// A document in the lock registry. Lock ids are `{database}:{purpose}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDoc {
    pub id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

pub type RecordStream = BoxStream<'static, Result<StoredRecord, StoreError>>;

/// The contract the core consumes from the document store.
///
/// Writes within a single call are atomic. `stream_changed` yields records
/// in id order so a resumed sync walks the same sequence.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get_record(
        &self,
        database: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    async fn get_records(
        &self,
        database: &str,
        ids: &[String],
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Inserts or fully replaces record documents.
    async fn upsert_records(
        &self,
        database: &str,
        records: Vec<StoredRecord>,
    ) -> Result<(), StoreError>;

    async fn count_staged(&self, database: &str) -> Result<u64, StoreError>;

    /// Commit phase one: reserves `version` on every staged record by
    /// stamping its `next_version`.
    async fn reserve_staged(&self, database: &str, version: Version) -> Result<u64, StoreError>;

    /// Commit phase two: folds pending data into the committed state under
    /// `version`, recording backwards diffs. Returns the number of records
    /// committed.
    async fn commit_staged(&self, database: &str, version: Version) -> Result<u64, StoreError>;

    /// Drops all pending data. Records that were never committed disappear
    /// entirely. Returns the number of records touched.
    async fn rollback_staged(&self, database: &str) -> Result<u64, StoreError>;

    /// All records with at least one committed version after `since`,
    /// ordered by id.
    fn stream_changed(&self, database: &str, since: Option<Version>) -> RecordStream;

    async fn get_status(&self, database: &str) -> Result<Option<DatabaseStatus>, StoreError>;

    async fn put_status(&self, status: &DatabaseStatus) -> Result<(), StoreError>;

    /// Atomically registers a lock. Returns false if the id is taken.
    async fn insert_lock(&self, lock: &LockDoc) -> Result<bool, StoreError>;

    async fn get_lock(&self, id: &str) -> Result<Option<LockDoc>, StoreError>;

    /// Replaces a lock only while it is still owned by `expected_owner`.
    async fn replace_lock(&self, expected_owner: &str, lock: &LockDoc) -> Result<bool, StoreError>;

    /// Refreshes the heartbeat on a held lock.
    async fn refresh_lock(
        &self,
        id: &str,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Releases a lock if still owned by `owner`.
    async fn delete_lock(&self, id: &str, owner: &str) -> Result<bool, StoreError>;

    async fn append_options_history(
        &self,
        database: &str,
        version: Version,
        options: &ParsingOptions,
    ) -> Result<(), StoreError>;
}
