//! Shared test harness: a Splitgill client over the in-process document
//! store and a mock search engine that stores documents and evaluates the
//! small query subset the tests assert with.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use splitgill::config::{Config, LockConfig, SearchConfig, StoreConfig, SyncConfig};
use splitgill::errors::SearchError;
use splitgill::search::{BulkItemResult, BulkOp, SearchEngine};
use splitgill::store::memory::MemoryStore;
use splitgill::Splitgill;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct MockState {
    /// index name -> document id -> source
    pub indices: BTreeMap<String, BTreeMap<String, Value>>,
    pub templates: BTreeMap<String, Value>,
    /// every settings body applied, in order
    pub settings_applied: Vec<Value>,
    pub refreshes: u64,
    /// number of upcoming bulk requests to fail with a 503
    pub fail_bulk_times: u32,
}

#[derive(Debug, Default, Clone)]
pub struct MockSearchEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockSearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn docs_in(&self, index: &str) -> BTreeMap<String, Value> {
        let state = self.state.lock().await;
        state.indices.get(index).cloned().unwrap_or_default()
    }

    /// Every non-empty index and its documents, for whole-state snapshots.
    pub async fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        let state = self.state.lock().await;
        state
            .indices
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(index, docs)| (index.clone(), docs.clone()))
            .collect()
    }

    pub async fn settings_applied(&self) -> Vec<Value> {
        self.state.lock().await.settings_applied.clone()
    }

    pub async fn refreshes(&self) -> u64 {
        self.state.lock().await.refreshes
    }

    pub async fn template(&self, name: &str) -> Option<Value> {
        self.state.lock().await.templates.get(name).cloned()
    }

    pub async fn fail_next_bulks(&self, times: u32) {
        self.state.lock().await.fail_bulk_times = times;
    }
}

/// True when `doc` matches the mock's supported query subset: `match_all`,
/// `term` (including `versions` range containment), `match`, and `bool`
/// filters.
fn matches(doc: &Value, query: &Value) -> bool {
    if query.get("match_all").is_some() {
        return true;
    }
    if let Some(filters) = query
        .get("bool")
        .and_then(|b| b.get("filter"))
        .and_then(Value::as_array)
    {
        return filters.iter().all(|filter| matches(doc, filter));
    }
    if let Some(term) = query.get("term").and_then(Value::as_object) {
        return term
            .iter()
            .all(|(field, expected)| matches_term(doc, field, expected));
    }
    if let Some(text) = query.get("match").and_then(Value::as_object) {
        return text.iter().all(|(field, expected)| {
            lookup(doc, field)
                .iter()
                .any(|found| match (found.as_str(), expected.as_str()) {
                    (Some(found), Some(expected)) => found.contains(expected),
                    _ => *found == expected,
                })
        });
    }
    false
}

fn matches_term(doc: &Value, field: &str, expected: &Value) -> bool {
    if field == "versions" {
        let Some(at) = expected.as_i64() else {
            return false;
        };
        let Some(gte) = doc.pointer("/versions/gte").and_then(Value::as_i64) else {
            return false;
        };
        let lt = doc.pointer("/versions/lt").and_then(Value::as_i64);
        return at >= gte && lt.map_or(true, |lt| at < lt);
    }
    lookup(doc, field)
        .iter()
        .any(|found| values_equal(found, expected))
}

/// Resolves a dotted field path, fanning out across arrays.
fn lookup<'a>(doc: &'a Value, field: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for part in field.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(found) = map.get(part) {
                        next.push(found);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(found) = item.get(part) {
                            next.push(found);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    // a terminal array matches any of its elements
    current
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}

fn values_equal(found: &Value, expected: &Value) -> bool {
    match (found.as_f64(), expected.as_f64()) {
        (Some(found), Some(expected)) => found == expected,
        _ => found == expected,
    }
}

#[async_trait]
impl SearchEngine for MockSearchEngine {
    async fn put_template(&self, name: &str, body: &Value) -> Result<(), SearchError> {
        let mut state = self.state.lock().await;
        state.templates.insert(name.to_owned(), body.clone());
        Ok(())
    }

    async fn ensure_index(&self, index: &str) -> Result<(), SearchError> {
        let mut state = self.state.lock().await;
        state.indices.entry(index.to_owned()).or_default();
        Ok(())
    }

    async fn update_settings(
        &self,
        _indices: &[String],
        settings: &Value,
    ) -> Result<(), SearchError> {
        let mut state = self.state.lock().await;
        state.settings_applied.push(settings.clone());
        Ok(())
    }

    async fn refresh(&self, _indices: &[String]) -> Result<(), SearchError> {
        let mut state = self.state.lock().await;
        state.refreshes += 1;
        Ok(())
    }

    async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<BulkItemResult>, SearchError> {
        let mut state = self.state.lock().await;
        if state.fail_bulk_times > 0 {
            state.fail_bulk_times -= 1;
            return Err(SearchError::Status {
                status: 503,
                reason: "mock unavailable".to_owned(),
            });
        }

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BulkOp::Index {
                    index,
                    id,
                    document,
                } => {
                    state
                        .indices
                        .entry(index.clone())
                        .or_default()
                        .insert(id.clone(), document.clone());
                    results.push(BulkItemResult {
                        status: 201,
                        error: None,
                    });
                }
                BulkOp::Delete { index, id } => {
                    let removed = state
                        .indices
                        .get_mut(index)
                        .and_then(|docs| docs.remove(id))
                        .is_some();
                    results.push(BulkItemResult {
                        status: if removed { 200 } else { 404 },
                        error: None,
                    });
                }
            }
        }
        Ok(results)
    }

    async fn delete_by_query(
        &self,
        indices: &[String],
        query: &Value,
    ) -> Result<u64, SearchError> {
        let mut state = self.state.lock().await;
        let mut deleted = 0;
        for index in indices {
            if let Some(docs) = state.indices.get_mut(index) {
                let before = docs.len();
                docs.retain(|_, doc| !matches(doc, query));
                deleted += (before - docs.len()) as u64;
            }
        }
        Ok(deleted)
    }

    async fn count(&self, indices: &[String], query: &Value) -> Result<u64, SearchError> {
        let state = self.state.lock().await;
        let mut count = 0;
        for index in indices {
            if let Some(docs) = state.indices.get(index) {
                count += docs.values().filter(|doc| matches(doc, query)).count() as u64;
            }
        }
        Ok(count)
    }

    async fn search(&self, indices: &[String], body: &Value) -> Result<Value, SearchError> {
        let query = body
            .get("query")
            .cloned()
            .unwrap_or(json!({"match_all": {}}));
        let state = self.state.lock().await;
        let mut hits = Vec::new();
        for index in indices {
            if let Some(docs) = state.indices.get(index) {
                for (id, doc) in docs {
                    if matches(doc, &query) {
                        hits.push(json!({
                            "_index": index,
                            "_id": id,
                            "_source": doc,
                        }));
                    }
                }
            }
        }
        Ok(json!({"hits": {"total": {"value": hits.len()}, "hits": hits}}))
    }
}

pub fn test_config() -> Config {
    Config {
        store: StoreConfig {
            database: "postgres://unused".to_owned(),
            max_connections: 1,
            migrate: false,
        },
        search: SearchConfig {
            url: "http://unused".to_owned(),
            timeout: Duration::from_secs(1),
            replicas: 1,
        },
        sync: SyncConfig {
            worker_count: 2,
            bulk_size: 4,
            bulk_attempts: 3,
            bulk_backoff: Duration::from_millis(10),
            refresh_attempts: 3,
            refresh_backoff: Duration::from_millis(10),
        },
        locks: LockConfig {
            acquire_timeout: Duration::from_millis(250),
            ttl: Duration::from_secs(60),
            heartbeat: Duration::from_secs(20),
            retry: Duration::from_millis(10),
        },
    }
}

pub struct Harness {
    pub client: Splitgill,
    pub store: Arc<MemoryStore>,
    pub search: MockSearchEngine,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let search = MockSearchEngine::new();
    let client = Splitgill::new(store.clone(), Arc::new(search.clone()), test_config());
    Harness {
        client,
        store,
        search,
    }
}
