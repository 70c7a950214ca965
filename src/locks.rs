//! Machine-independent mutual exclusion over the document store's lock
//! registry.
//!
//! A lock is a document keyed `{database}:{purpose}` holding a random owner
//! token and a heartbeat timestamp. Acquisition inserts the document, or
//! takes over a stale one whose heartbeat has gone past the TTL via a
//! compare-and-swap on the owner token. A background task refreshes the
//! heartbeat while the lock is held.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::LockConfig;
use crate::errors::LockError;
use crate::store::{DocumentStore, LockDoc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPurpose {
    Commit,
    Sync,
}

impl fmt::Display for LockPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockPurpose::Commit => f.write_str("commit"),
            LockPurpose::Sync => f.write_str("sync"),
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn DocumentStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn DocumentStore>, config: LockConfig) -> Self {
        LockManager { store, config }
    }

    /// Acquires the lock for `database`/`purpose`, waiting with jittered
    /// retries until the configured deadline.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(
        &self,
        database: &str,
        purpose: LockPurpose,
    ) -> Result<LockGuard, LockError> {
        let id = format!("{database}:{purpose}");
        let owner = random_token();
        let started = Instant::now();
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        loop {
            let lock = LockDoc {
                id: id.clone(),
                owner: owner.clone(),
                acquired_at: Utc::now(),
                metadata: json!({"database": database, "purpose": purpose.to_string()}),
            };
            if self.store.insert_lock(&lock).await? {
                break;
            }

            if let Some(existing) = self.store.get_lock(&id).await? {
                let age = Utc::now().signed_duration_since(existing.acquired_at);
                if age > ttl {
                    warn!(lock = %id, stale_owner = %existing.owner, "Taking over stale lock");
                    if self.store.replace_lock(&existing.owner, &lock).await? {
                        break;
                    }
                }
            } else {
                // released between our insert and read, try again immediately
                continue;
            }

            if started.elapsed() >= self.config.acquire_timeout {
                return Err(LockError::Timeout {
                    id,
                    waited: started.elapsed(),
                });
            }
            let jitter = rand::thread_rng().gen_range(0..250);
            tokio::time::sleep(self.config.retry + std::time::Duration::from_millis(jitter)).await;
        }

        debug!(lock = %id, "Lock acquired");
        let heartbeat = self.spawn_heartbeat(id.clone(), owner.clone());
        Ok(LockGuard {
            store: self.store.clone(),
            id,
            owner,
            heartbeat,
            released: false,
        })
    }

    fn spawn_heartbeat(&self, id: String, owner: String) -> JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.heartbeat;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.refresh_lock(&id, &owner, Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(lock = %id, "Lock heartbeat found the lock gone");
                        return;
                    }
                    Err(err) => {
                        warn!(lock = %id, error = ?err, "Lock heartbeat failed");
                    }
                }
            }
        })
    }
}

/// A held lock. Call [`LockGuard::release`] when done; a guard dropped
/// without releasing stops heartbeating and deletes the lock best-effort,
/// with the TTL takeover as the backstop.
pub struct LockGuard {
    store: Arc<dyn DocumentStore>,
    id: String,
    owner: String,
    heartbeat: JoinHandle<()>,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<(), LockError> {
        self.heartbeat.abort();
        self.released = true;
        self.store.delete_lock(&self.id, &self.owner).await?;
        debug!(lock = %self.id, "Lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if !self.released {
            let store = self.store.clone();
            let id = std::mem::take(&mut self.id);
            let owner = std::mem::take(&mut self.owner);
            tokio::spawn(async move {
                if let Err(err) = store.delete_lock(&id, &owner).await {
                    warn!(lock = %id, error = ?err, "Failed to release dropped lock");
                }
            });
        }
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn manager(store: Arc<dyn DocumentStore>, timeout_ms: u64, ttl_ms: u64) -> LockManager {
        LockManager::new(
            store,
            LockConfig {
                acquire_timeout: Duration::from_millis(timeout_ms),
                ttl: Duration::from_millis(ttl_ms),
                heartbeat: Duration::from_millis(ttl_ms / 3),
                retry: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let locks = manager(store.clone(), 200, 60_000);

        let guard = locks.acquire("db", LockPurpose::Commit).await.unwrap();
        let blocked = locks.acquire("db", LockPurpose::Commit).await;
        assert!(matches!(blocked, Err(LockError::Timeout { .. })));

        // a different purpose is a different lock
        let sync_guard = locks.acquire("db", LockPurpose::Sync).await.unwrap();
        sync_guard.release().await.unwrap();

        guard.release().await.unwrap();
        let reacquired = locks.acquire("db", LockPurpose::Commit).await.unwrap();
        reacquired.release().await.unwrap();
    }

    #[tokio::test]
    async fn stale_locks_are_taken_over() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let stale = LockDoc {
            id: "db:commit".to_owned(),
            owner: "departed".to_owned(),
            acquired_at: Utc::now() - chrono::Duration::seconds(10),
            metadata: json!({}),
        };
        assert!(store.insert_lock(&stale).await.unwrap());

        let locks = manager(store.clone(), 500, 1_000);
        let guard = locks.acquire("db", LockPurpose::Commit).await.unwrap();
        let held = store.get_lock("db:commit").await.unwrap().unwrap();
        assert_ne!(held.owner, "departed");
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_guards_release_best_effort() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let locks = manager(store.clone(), 200, 60_000);

        let guard = locks.acquire("db", LockPurpose::Sync).await.unwrap();
        drop(guard);
        // the delete is spawned, give it a beat
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get_lock("db:sync").await.unwrap().is_none());
    }
}
