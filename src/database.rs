//! The client and the per-database handle: ingest, commit, historical
//! reads, options, sync, and search passthroughs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::diff::{diff, PathSeg};
use crate::errors::{IngestError, LockError, SearchError, StoreError, SyncError};
use crate::indexing::names;
use crate::indexing::sync::{sync, SyncOptions, SyncResult};
use crate::locks::{LockManager, LockPurpose};
use crate::parser::options::ParsingOptions;
use crate::record::{Record, RecordVersions, StoredRecord, Version};
use crate::search::elastic::ElasticEngine;
use crate::search::queries::version_query;
use crate::search::SearchEngine;
use crate::shutdown::Shutdown;
use crate::store::postgres::PostgresStore;
use crate::store::{DatabaseStatus, DocumentStore};

/// How many existing records are read per round while diffing an ingest
/// batch.
const INGEST_CHUNK: usize = 500;

/// The entry point: a document store plus a search engine.
pub struct Splitgill {
    store: Arc<dyn DocumentStore>,
    search: Arc<dyn SearchEngine>,
    config: Config,
    shutdown: Shutdown,
}

impl Splitgill {
    /// Builds a client over any pair of backends.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        search: Arc<dyn SearchEngine>,
        config: Config,
    ) -> Self {
        Splitgill {
            store,
            search,
            config,
            shutdown: Shutdown::new(),
        }
    }

    /// Connects the production backends: Postgres for documents,
    /// Elasticsearch for search.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let store = PostgresStore::connect(&config.store).await?;
        let search = ElasticEngine::new(&config.search)?;
        Ok(Splitgill::new(Arc::new(store), Arc::new(search), config))
    }

    /// A handle onto one named database.
    pub fn database(&self, name: impl Into<String>) -> SplitgillDatabase {
        SplitgillDatabase {
            name: name.into(),
            store: self.store.clone(),
            search: self.search.clone(),
            locks: LockManager::new(self.store.clone(), self.config.locks.clone()),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// The signal that cancels in-flight syncs at their next safe point.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Commit the batch immediately after staging it.
    pub commit: bool,

    /// A top-level field whose changes alone do not make a record worth a
    /// new version (volatile metadata like a retrieval timestamp).
    pub modified_field: Option<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            commit: true,
            modified_field: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestResult {
    /// Records seen for the first time.
    pub upserted: u64,
    /// Existing records with real changes staged.
    pub modified: u64,
    /// Records whose data matched what we already have.
    pub same: u64,
    /// The version assigned, when committing and anything changed.
    pub version: Option<Version>,
}

pub struct SplitgillDatabase {
    name: String,
    store: Arc<dyn DocumentStore>,
    search: Arc<dyn SearchEngine>,
    locks: LockManager,
    config: Config,
    shutdown: Shutdown,
}

impl SplitgillDatabase {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages a batch of records, committing it unless told otherwise. Each
    /// incoming record is reduced to a diff against its current state; only
    /// real changes are staged. When the same id appears multiple times in
    /// one batch, the last occurrence wins.
    #[instrument(skip_all, fields(database = %self.name))]
    pub async fn ingest<I>(
        &self,
        records: I,
        options: IngestOptions,
    ) -> Result<IngestResult, IngestError>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut batch: BTreeMap<String, Record> = BTreeMap::new();
        for record in records {
            record.validate()?;
            batch.insert(record.id.clone(), record);
        }

        let mut result = IngestResult::default();
        let ids: Vec<String> = batch.keys().cloned().collect();
        for chunk in ids.chunks(INGEST_CHUNK) {
            let mut existing: BTreeMap<String, StoredRecord> = self
                .store
                .get_records(&self.name, chunk)
                .await?
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect();

            let mut updates = Vec::new();
            for id in chunk {
                let incoming = batch.remove(id).expect("ids come from the batch");
                match existing.remove(id) {
                    None => {
                        result.upserted += 1;
                        updates.push(StoredRecord::staged(id, incoming.data));
                    }
                    Some(mut stored) => {
                        let ops = diff(stored.effective_data(), &incoming.data);
                        if ops.is_empty() {
                            result.same += 1;
                            continue;
                        }
                        if let Some(field) = &options.modified_field {
                            let confined = ops.iter().all(|op| {
                                matches!(op.path().first(), Some(PathSeg::Key(key)) if key == field)
                            });
                            if confined {
                                result.same += 1;
                                continue;
                            }
                        }
                        if stored.version.is_some() && incoming.data == stored.data {
                            // circled back to the committed state: drop the
                            // pending change rather than spend a version
                            stored.rollback_staged();
                            result.same += 1;
                        } else {
                            stored.next = Some(incoming.data);
                            stored.next_version = None;
                            result.modified += 1;
                        }
                        updates.push(stored);
                    }
                }
            }
            if !updates.is_empty() {
                self.store.upsert_records(&self.name, updates).await?;
            }
        }

        if options.commit {
            result.version = self.commit().await?;
        }
        Ok(result)
    }

    /// Promotes all staged changes into a single new committed version,
    /// strictly greater than every version before it. Serialised by the
    /// commit lock; returns `None` when there was nothing to commit.
    #[instrument(skip(self), fields(database = %self.name))]
    pub async fn commit(&self) -> Result<Option<Version>, IngestError> {
        if self.store.count_staged(&self.name).await? == 0 {
            return Ok(None);
        }

        let guard = self
            .locks
            .acquire(&self.name, LockPurpose::Commit)
            .await
            .map_err(|err| match err {
                LockError::Timeout { .. } => IngestError::CommitConflict {
                    database: self.name.clone(),
                },
                LockError::Store(err) => IngestError::Store(err),
            })?;

        let outcome = self.commit_locked().await;

        if let Err(err) = guard.release().await {
            warn!(database = %self.name, error = ?err, "Failed to release commit lock");
        }
        outcome
    }

    async fn commit_locked(&self) -> Result<Option<Version>, IngestError> {
        let mut status = self.status().await?;
        let version = next_version(status.committed_version);

        // two phases: reserve the version on every staged record, then fold
        self.store.reserve_staged(&self.name, version).await?;
        let committed = self.store.commit_staged(&self.name, version).await?;
        if committed == 0 {
            return Ok(None);
        }

        status.committed_version = Some(version);
        self.store.put_status(&status).await?;
        info!(database = %self.name, version, records = committed, "Committed");
        Ok(Some(version))
    }

    /// The record's current committed data.
    pub async fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self
            .store
            .get_record(&self.name, id)
            .await?
            .filter(|stored| stored.version.is_some())
            .map(|stored| Record::new(stored.id.clone(), stored.data)))
    }

    /// The record's data as it was at `version`, reconstructed from the
    /// diff chain. `None` if the record did not exist yet.
    pub async fn get_at(&self, id: &str, version: Version) -> Result<Option<Record>, StoreError> {
        Ok(self
            .store
            .get_record(&self.name, id)
            .await?
            .and_then(|stored| stored.data_at(version))
            .map(|data| Record::new(id, data)))
    }

    /// The changed records between two versions: each item carries the
    /// ordered versions in `(since, until]` at which that record changed.
    /// Ordered by record id, restartable from any checkpoint.
    pub fn iter_records(
        &self,
        since: Option<Version>,
        until: Version,
    ) -> BoxStream<'static, Result<RecordVersions, StoreError>> {
        self.store
            .stream_changed(&self.name, since)
            .filter_map(move |result| async move {
                match result {
                    Ok(record) => {
                        let versions: Vec<Version> = record
                            .versions()
                            .into_iter()
                            .filter(|version| {
                                since.map_or(true, |since| *version > since) && *version <= until
                            })
                            .collect();
                        (!versions.is_empty()).then(|| {
                            Ok(RecordVersions {
                                id: record.id,
                                versions,
                            })
                        })
                    }
                    Err(err) => Some(Err(err)),
                }
            })
            .boxed()
    }

    pub async fn committed_version(&self) -> Result<Option<Version>, StoreError> {
        Ok(self
            .store
            .get_status(&self.name)
            .await?
            .and_then(|status| status.committed_version))
    }

    /// The version the next commit would assign, or `None` when nothing is
    /// staged.
    pub async fn uncommitted_version(&self) -> Result<Option<Version>, StoreError> {
        if self.store.count_staged(&self.name).await? == 0 {
            return Ok(None);
        }
        let committed = self.committed_version().await?;
        Ok(Some(next_version(committed)))
    }

    /// Discards all staged changes. Returns how many records were touched.
    #[instrument(skip(self), fields(database = %self.name))]
    pub async fn rollback_uncommitted(&self) -> Result<u64, StoreError> {
        self.store.rollback_staged(&self.name).await
    }

    /// The parsing options currently in force.
    pub async fn options(&self) -> Result<ParsingOptions, StoreError> {
        Ok(self
            .store
            .get_status(&self.name)
            .await?
            .map(|status| status.parsing_options)
            .unwrap_or_default())
    }

    /// Replaces the parsing options. Options are versioned with the same
    /// clock as data and logged to the options history; the next sync
    /// notices and rebuilds the projection. Returns `None` when the options
    /// did not change.
    #[instrument(skip(self, options), fields(database = %self.name))]
    pub async fn update_options(
        &self,
        options: ParsingOptions,
    ) -> Result<Option<Version>, IngestError> {
        let guard = self
            .locks
            .acquire(&self.name, LockPurpose::Commit)
            .await
            .map_err(|err| match err {
                LockError::Timeout { .. } => IngestError::CommitConflict {
                    database: self.name.clone(),
                },
                LockError::Store(err) => IngestError::Store(err),
            })?;

        let outcome = self.update_options_locked(options).await;

        if let Err(err) = guard.release().await {
            warn!(database = %self.name, error = ?err, "Failed to release commit lock");
        }
        outcome
    }

    async fn update_options_locked(
        &self,
        options: ParsingOptions,
    ) -> Result<Option<Version>, IngestError> {
        let mut status = self.status().await?;
        if status.options_version.is_some() && status.parsing_options == options {
            return Ok(None);
        }

        let version = next_version(status.committed_version);
        status.parsing_options = options.clone();
        status.options_version = Some(version);
        status.committed_version = Some(version);
        self.store
            .append_options_history(&self.name, version, &options)
            .await?;
        self.store.put_status(&status).await?;
        info!(database = %self.name, version, "Parsing options updated");
        Ok(Some(version))
    }

    /// Projects everything committed since the last sync into the search
    /// engine.
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncResult, SyncError> {
        sync(
            &self.name,
            self.store.clone(),
            self.search.clone(),
            &self.locks,
            &self.config.sync,
            self.config.search.replicas,
            options,
            &self.shutdown,
        )
        .await
    }

    pub fn latest_index(&self) -> String {
        names::latest_index(&self.name)
    }

    pub fn arc_index(&self, record_id: &str) -> String {
        names::arc_index(&self.name, record_id)
    }

    /// Runs `query` against the current state of the records, or against
    /// the state at `version` across the whole history.
    pub async fn search(
        &self,
        query: &Value,
        version: Option<Version>,
    ) -> Result<Value, SearchError> {
        let (indices, query) = self.scoped(query, version);
        self.search.search(&indices, &json!({ "query": query })).await
    }

    /// Counts matches the same way [`SplitgillDatabase::search`] matches.
    pub async fn count(
        &self,
        query: &Value,
        version: Option<Version>,
    ) -> Result<u64, SearchError> {
        let (indices, query) = self.scoped(query, version);
        self.search.count(&indices, &query).await
    }

    /// Current-state queries hit only the latest index; versioned queries
    /// hit everything and filter on the `versions` range.
    fn scoped(&self, query: &Value, version: Option<Version>) -> (Vec<String>, Value) {
        match version {
            None => (vec![names::latest_index(&self.name)], query.clone()),
            Some(version) => (
                names::all_indices(&self.name),
                json!({"bool": {"filter": [query.clone(), version_query(version)]}}),
            ),
        }
    }

    async fn status(&self) -> Result<DatabaseStatus, StoreError> {
        Ok(self
            .store
            .get_status(&self.name)
            .await?
            .unwrap_or_else(|| DatabaseStatus::new(&self.name)))
    }
}

/// Server time in millis, bumped to stay strictly above the previous
/// version even under clock skew.
fn next_version(committed: Option<Version>) -> Version {
    let now = Utc::now().timestamp_millis();
    committed.map_or(now, |previous| now.max(previous + 1))
}
