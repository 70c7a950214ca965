//! An in-process document store. Implements the full contract over plain
//! maps, making embedded use and tests possible without a running database.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;

use super::{DatabaseStatus, DocumentStore, LockDoc, RecordStream};
use crate::errors::StoreError;
use crate::parser::options::ParsingOptions;
use crate::record::{StoredRecord, Version};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, BTreeMap<String, StoredRecord>>,
    status: BTreeMap<String, DatabaseStatus>,
    locks: BTreeMap<String, LockDoc>,
    options_history: Vec<(String, Version, ParsingOptions)>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded options changes for a database, oldest first.
    pub async fn options_history(&self, database: &str) -> Vec<(Version, ParsingOptions)> {
        let inner = self.inner.lock().await;
        inner
            .options_history
            .iter()
            .filter(|(db, _, _)| db == database)
            .map(|(_, version, options)| (*version, options.clone()))
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_record(
        &self,
        database: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(database)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn get_records(
        &self,
        database: &str,
        ids: &[String],
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(records) = inner.records.get(database) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id))
            .cloned()
            .collect())
    }

    async fn upsert_records(
        &self,
        database: &str,
        records: Vec<StoredRecord>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = inner.records.entry(database.to_owned()).or_default();
        for record in records {
            stored.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn count_staged(&self, database: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(database)
            .map(|records| records.values().filter(|r| r.has_uncommitted()).count() as u64)
            .unwrap_or(0))
    }

    async fn reserve_staged(&self, database: &str, version: Version) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(records) = inner.records.get_mut(database) else {
            return Ok(0);
        };
        let mut reserved = 0;
        for record in records.values_mut() {
            if record.has_uncommitted() {
                record.next_version = Some(version);
                reserved += 1;
            }
        }
        Ok(reserved)
    }

    async fn commit_staged(&self, database: &str, version: Version) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(records) = inner.records.get_mut(database) else {
            return Ok(0);
        };
        let mut committed = 0;
        for record in records.values_mut() {
            if record.fold_staged(version) {
                committed += 1;
            }
        }
        Ok(committed)
    }

    async fn rollback_staged(&self, database: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(records) = inner.records.get_mut(database) else {
            return Ok(0);
        };
        let mut rolled_back = 0;
        records.retain(|_, record| {
            if !record.has_uncommitted() {
                return true;
            }
            rolled_back += 1;
            record.rollback_staged();
            // a record that never committed leaves nothing behind
            record.version.is_some()
        });
        Ok(rolled_back)
    }

    fn stream_changed(&self, database: &str, since: Option<Version>) -> RecordStream {
        let inner = self.inner.clone();
        let database = database.to_owned();
        let stream = async_stream::stream! {
            let snapshot: Vec<StoredRecord> = {
                let inner = inner.lock().await;
                inner
                    .records
                    .get(&database)
                    .map(|records| {
                        records
                            .values()
                            .filter(|record| match (record.version, since) {
                                (None, _) => false,
                                (Some(version), Some(since)) => version > since,
                                (Some(_), None) => true,
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for record in snapshot {
                yield Ok(record);
            }
        };
        stream.boxed()
    }

    async fn get_status(&self, database: &str) -> Result<Option<DatabaseStatus>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.status.get(database).cloned())
    }

    async fn put_status(&self, status: &DatabaseStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .status
            .insert(status.database.clone(), status.clone());
        Ok(())
    }

    async fn insert_lock(&self, lock: &LockDoc) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.locks.contains_key(&lock.id) {
            return Ok(false);
        }
        inner.locks.insert(lock.id.clone(), lock.clone());
        Ok(true)
    }

    async fn get_lock(&self, id: &str) -> Result<Option<LockDoc>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.locks.get(id).cloned())
    }

    async fn replace_lock(&self, expected_owner: &str, lock: &LockDoc) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.locks.get_mut(&lock.id) {
            Some(existing) if existing.owner == expected_owner => {
                *existing = lock.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refresh_lock(
        &self,
        id: &str,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.locks.get_mut(id) {
            Some(existing) if existing.owner == owner => {
                existing.acquired_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_lock(&self, id: &str, owner: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.locks.get(id) {
            Some(existing) if existing.owner == owner => {
                inner.locks.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_options_history(
        &self,
        database: &str,
        version: Version,
        options: &ParsingOptions,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .options_history
            .push((database.to_owned(), version, options.clone()));
        Ok(())
    }
}
