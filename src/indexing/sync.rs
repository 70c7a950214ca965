//! The sync engine: projects the document store's version history into the
//! search engine.
//!
//! One sync runs per database at a time, guarded by the sync lock. The only
//! persisted checkpoint is `last_indexed_version`; everything else is safe
//! to repeat because document ids are per (record, version) and every state
//! is deleted before it is re-indexed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use super::indexer::generate_index_ops;
use super::{names, templates};
use crate::config::SyncConfig;
use crate::errors::{LockError, SyncError};
use crate::locks::{LockManager, LockPurpose};
use crate::parser::options::ParsingOptions;
use crate::parser::Parser;
use crate::record::{StoredRecord, Version};
use crate::search::{BulkOp, SearchEngine};
use crate::shutdown::Shutdown;
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Rebuild the whole projection from scratch instead of resuming from
    /// the checkpoint.
    pub resync: bool,

    /// Run the configured worker pool; false means a single worker.
    pub parallel: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            resync: false,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub indexed: u64,
    pub deleted: u64,
    /// Permanent bulk failures, keyed `"{op}:{reason}"`.
    pub failed_by_reason: BTreeMap<String, u64>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Counts {
    indexed: u64,
    deleted: u64,
    failed: BTreeMap<String, u64>,
}

#[instrument(skip_all, fields(database = %database))]
pub(crate) async fn sync(
    database: &str,
    store: Arc<dyn DocumentStore>,
    search: Arc<dyn SearchEngine>,
    locks: &LockManager,
    config: &SyncConfig,
    replicas: u32,
    options: SyncOptions,
    shutdown: &Shutdown,
) -> Result<SyncResult, SyncError> {
    let started = Instant::now();

    let guard = locks
        .acquire(database, LockPurpose::Sync)
        .await
        .map_err(|err| match err {
            LockError::Timeout { .. } => SyncError::Busy {
                database: database.to_owned(),
            },
            LockError::Store(err) => SyncError::Store(err),
        })?;

    let result = run_locked(
        database, &store, &search, config, replicas, options, shutdown,
    )
    .await;

    // the TTL would reclaim it eventually, but do not make callers wait
    if let Err(err) = guard.release().await {
        warn!(database, error = ?err, "Failed to release sync lock");
    }

    let mut result = result?;
    result.elapsed = started.elapsed();
    info!(
        database,
        indexed = result.indexed,
        deleted = result.deleted,
        failed = result.failed_by_reason.values().sum::<u64>(),
        elapsed = ?result.elapsed,
        "Sync finished",
    );
    Ok(result)
}

async fn run_locked(
    database: &str,
    store: &Arc<dyn DocumentStore>,
    search: &Arc<dyn SearchEngine>,
    config: &SyncConfig,
    replicas: u32,
    options: SyncOptions,
    shutdown: &Shutdown,
) -> Result<SyncResult, SyncError> {
    let Some(mut status) = store.get_status(database).await? else {
        return Ok(SyncResult::default());
    };
    let Some(until) = status.committed_version else {
        return Ok(SyncResult::default());
    };

    // options committed after the last sync invalidate every parsed document
    let options_changed = matches!(
        (status.options_version, status.last_indexed_version),
        (Some(options_version), Some(last_indexed)) if options_version > last_indexed
    );
    let resync = options.resync || options_changed;
    let since = if resync {
        None
    } else {
        status.last_indexed_version
    };
    if !resync && since == Some(until) {
        debug!(database, "Search projection already up to date");
        return Ok(SyncResult::default());
    }

    search
        .put_template(
            &names::template_name(database),
            &templates::index_template(database, &status.parsing_options),
        )
        .await?;
    let indices = names::all_indices(database);
    for index in &indices {
        search.ensure_index(index).await?;
    }

    let mut result = SyncResult::default();
    if resync {
        // the latest documents get overwritten in place; the arcs have to be
        // purged or stale historical states would linger
        result.deleted += search
            .delete_by_query(&names::arc_indices(database), &json!({"match_all": {}}))
            .await?;
    }

    search
        .update_settings(&indices, &json!({"index": {"refresh_interval": "-1", "number_of_replicas": 0}}))
        .await?;

    let worker_count = if options.parallel {
        config.worker_count.max(1)
    } else {
        1
    };
    let pipeline = run_pipeline(
        database,
        store,
        search,
        since,
        until,
        status.parsing_options.clone(),
        config,
        worker_count,
        shutdown,
    )
    .await;

    // restore the tuning whatever happened to the pipeline
    let restored = search
        .update_settings(
            &indices,
            &json!({"index": {"refresh_interval": null, "number_of_replicas": replicas}}),
        )
        .await;

    let counts = pipeline?;
    restored?;
    result.indexed += counts.indexed;
    result.deleted += counts.deleted;
    for (reason, count) in counts.failed {
        *result.failed_by_reason.entry(reason).or_default() += count;
    }

    refresh_with_backoff(search, &indices, config).await?;

    status.last_indexed_version = Some(until);
    store.put_status(&status).await?;
    Ok(result)
}

/// Streams changed records through a worker pool into batched bulk
/// requests. Workers share the record channel (each holds its own parser
/// and leaf cache); a single submitter owns the counters.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    database: &str,
    store: &Arc<dyn DocumentStore>,
    search: &Arc<dyn SearchEngine>,
    since: Option<Version>,
    until: Version,
    parsing_options: ParsingOptions,
    config: &SyncConfig,
    worker_count: usize,
    shutdown: &Shutdown,
) -> Result<Counts, SyncError> {
    let (record_tx, record_rx) = mpsc::channel::<StoredRecord>(worker_count * 2);
    let record_rx = Arc::new(Mutex::new(record_rx));
    let (op_tx, op_rx) = mpsc::channel::<BulkOp>(config.bulk_size.max(1));

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let record_rx = record_rx.clone();
        let op_tx = op_tx.clone();
        let database = database.to_owned();
        let parsing_options = parsing_options.clone();
        workers.push(tokio::spawn(async move {
            let mut parser = Parser::new(parsing_options);
            loop {
                let record = { record_rx.lock().await.recv().await };
                let Some(record) = record else { break };
                for op in generate_index_ops(&database, &record, since, until, &mut parser) {
                    if op_tx.send(op).await.is_err() {
                        // the submitter is gone, nothing left to do
                        return;
                    }
                }
            }
        }));
    }
    drop(op_tx);

    let submitter = tokio::spawn(submit_loop(
        search.clone(),
        op_rx,
        config.clone(),
        shutdown.clone(),
    ));

    let mut stream = store.stream_changed(database, since);
    let mut stream_error = None;
    while let Some(record) = futures::StreamExt::next(&mut stream).await {
        match record {
            Ok(record) => {
                if record_tx.send(record).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                stream_error = Some(err);
                break;
            }
        }
    }
    drop(record_tx);
    drop(stream);

    for worker in workers {
        worker
            .await
            .map_err(|err| SyncError::Worker(anyhow::anyhow!(err)))?;
    }
    let counts = submitter
        .await
        .map_err(|err| SyncError::Worker(anyhow::anyhow!(err)))?;

    if let Some(err) = stream_error {
        return Err(err.into());
    }
    counts
}

/// Batches ops to the configured size and submits them, checking for
/// cancellation at every batch boundary.
async fn submit_loop(
    search: Arc<dyn SearchEngine>,
    mut op_rx: mpsc::Receiver<BulkOp>,
    config: SyncConfig,
    shutdown: Shutdown,
) -> Result<Counts, SyncError> {
    let mut counts = Counts::default();
    let mut batch = Vec::with_capacity(config.bulk_size);

    while let Some(op) = op_rx.recv().await {
        batch.push(op);
        if batch.len() >= config.bulk_size {
            if shutdown.is_shutting_down() {
                return Err(SyncError::Cancelled);
            }
            submit_batch(&search, std::mem::take(&mut batch), &config, &mut counts).await?;
        }
    }
    if !batch.is_empty() {
        if shutdown.is_shutting_down() {
            return Err(SyncError::Cancelled);
        }
        submit_batch(&search, batch, &config, &mut counts).await?;
    }
    Ok(counts)
}

/// One batch, with transient failures retried on an exponential backoff.
/// Request-level transient errors retry the whole batch; item-level
/// transient failures retry just those items. Permanent item failures are
/// counted by reason and never abort the sync.
async fn submit_batch(
    search: &Arc<dyn SearchEngine>,
    mut ops: Vec<BulkOp>,
    config: &SyncConfig,
    counts: &mut Counts,
) -> Result<(), SyncError> {
    let mut attempt: u32 = 0;
    loop {
        let results = match search.bulk(&ops).await {
            Ok(results) => results,
            Err(err) if err.is_transient() && attempt + 1 < config.bulk_attempts => {
                attempt += 1;
                warn!(attempt, error = %err, "Bulk request failed, retrying");
                tokio::time::sleep(backoff(config.bulk_backoff, attempt)).await;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let mut retry = Vec::new();
        for (op, result) in ops.drain(..).zip(results) {
            if result.is_success() {
                match op {
                    BulkOp::Index { .. } => counts.indexed += 1,
                    BulkOp::Delete { .. } => counts.deleted += 1,
                }
            } else if matches!(op, BulkOp::Delete { .. })
                && result.status == 404
                && result.error.is_none()
            {
                // deleting something already gone is a no-op, not a failure
            } else if result.is_transient() && attempt + 1 < config.bulk_attempts {
                retry.push(op);
            } else {
                let reason = result
                    .error
                    .unwrap_or_else(|| format!("status_{}", result.status));
                *counts.failed.entry(format!("{}:{reason}", op.kind())).or_default() += 1;
            }
        }

        if retry.is_empty() {
            return Ok(());
        }
        attempt += 1;
        warn!(attempt, retrying = retry.len(), "Bulk items rejected, retrying");
        tokio::time::sleep(backoff(config.bulk_backoff, attempt)).await;
        ops = retry;
    }
}

async fn refresh_with_backoff(
    search: &Arc<dyn SearchEngine>,
    indices: &[String],
    config: &SyncConfig,
) -> Result<(), SyncError> {
    let mut attempt: u32 = 0;
    loop {
        match search.refresh(indices).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt + 1 < config.refresh_attempts => {
                attempt += 1;
                warn!(attempt, error = %err, "Refresh failed, retrying");
                tokio::time::sleep(backoff(config.refresh_backoff, attempt)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Doubles the base delay per attempt, capped so retries never sleep
/// unboundedly long.
fn backoff(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1)).min(64)
}
