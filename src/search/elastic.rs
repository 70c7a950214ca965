//! An Elasticsearch-compatible implementation of the search engine contract
//! over its HTTP API.

use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::instrument;
use url::Url;

use super::{BulkItemResult, BulkOp, SearchEngine};
use crate::config::SearchConfig;
use crate::errors::SearchError;

#[derive(Clone, Debug)]
pub struct ElasticEngine {
    base_url: Url,
    client: reqwest::Client,
}

impl ElasticEngine {
    pub fn new(config: &SearchConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()?;

        Ok(ElasticEngine { base_url, client })
    }

    fn url(&self, path: &str) -> Result<Url, SearchError> {
        self.base_url.join(path).map_err(|err| SearchError::Status {
            status: 400,
            reason: format!("invalid request path {path:?}: {err}"),
        })
    }

    /// Reads the body of a non-success response into a status error.
    async fn check(response: reqwest::Response) -> Result<Value, SearchError> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }
        Err(SearchError::Status {
            status: status.as_u16(),
            reason: error_reason(&body)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_owned()),
        })
    }
}

fn error_reason(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    let reason = error
        .get("type")
        .and_then(Value::as_str)
        .or_else(|| error.get("reason").and_then(Value::as_str))?;
    Some(reason.to_owned())
}

/// Renders ops as the newline-delimited bulk body.
fn bulk_body(ops: &[BulkOp]) -> String {
    let mut body = String::new();
    for op in ops {
        match op {
            BulkOp::Index {
                index,
                id,
                document,
            } => {
                body.push_str(&json!({"index": {"_index": index, "_id": id}}).to_string());
                body.push('\n');
                body.push_str(&document.to_string());
                body.push('\n');
            }
            BulkOp::Delete { index, id } => {
                body.push_str(&json!({"delete": {"_index": index, "_id": id}}).to_string());
                body.push('\n');
            }
        }
    }
    body
}

#[async_trait::async_trait]
impl SearchEngine for ElasticEngine {
    #[instrument(skip(self, body))]
    async fn put_template(&self, name: &str, body: &Value) -> Result<(), SearchError> {
        let response = self
            .client
            .put(self.url(&format!("_index_template/{name}"))?)
            .json(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ensure_index(&self, index: &str) -> Result<(), SearchError> {
        let response = self.client.put(self.url(index)?).send().await?;
        match Self::check(response).await {
            Ok(_) => Ok(()),
            Err(SearchError::Status { reason, .. })
                if reason == "resource_already_exists_exception" =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self, settings))]
    async fn update_settings(
        &self,
        indices: &[String],
        settings: &Value,
    ) -> Result<(), SearchError> {
        let response = self
            .client
            .put(self.url(&format!("{}/_settings", indices.join(",")))?)
            .json(settings)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn refresh(&self, indices: &[String]) -> Result<(), SearchError> {
        let response = self
            .client
            .post(self.url(&format!("{}/_refresh", indices.join(",")))?)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(ops = ops.len()))]
    async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<BulkItemResult>, SearchError> {
        let response = self
            .client
            .post(self.url("_bulk")?)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(ops))
            .send()
            .await?;
        let body = Self::check(response).await?;

        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| SearchError::Status {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                reason: "bulk response missing items".to_owned(),
            })?;

        Ok(items
            .iter()
            .map(|item| {
                // each item is wrapped in its op type, e.g. {"index": {...}}
                let inner = item
                    .get("index")
                    .or_else(|| item.get("delete"))
                    .unwrap_or(item);
                BulkItemResult {
                    status: inner.get("status").and_then(Value::as_u64).unwrap_or(0) as u16,
                    error: inner
                        .get("error")
                        .and_then(|error| error.get("type"))
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                }
            })
            .collect())
    }

    #[instrument(skip(self, query))]
    async fn delete_by_query(
        &self,
        indices: &[String],
        query: &Value,
    ) -> Result<u64, SearchError> {
        let response = self
            .client
            .post(self.url(&format!(
                "{}/_delete_by_query?conflicts=proceed",
                indices.join(",")
            ))?)
            .json(&json!({ "query": query }))
            .send()
            .await?;
        let body = Self::check(response).await?;
        Ok(body.get("deleted").and_then(Value::as_u64).unwrap_or(0))
    }

    #[instrument(skip(self, query))]
    async fn count(&self, indices: &[String], query: &Value) -> Result<u64, SearchError> {
        let response = self
            .client
            .post(self.url(&format!("{}/_count", indices.join(",")))?)
            .json(&json!({ "query": query }))
            .send()
            .await?;
        let body = Self::check(response).await?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    #[instrument(skip(self, body))]
    async fn search(&self, indices: &[String], body: &Value) -> Result<Value, SearchError> {
        let response = self
            .client
            .post(self.url(&format!("{}/_search", indices.join(",")))?)
            .json(body)
            .send()
            .await?;
        Self::check(response).await
    }
}
