//! Bulk Indexer.
//!
//! Submits an ordered batch of actions to an Elasticsearch-style bulk
//! API and reports per-item success/failure so the coordinator can
//! retry only what actually failed. Grouping by root `_id` (keeping
//! only the latest action per `_id`, in order) is explicitly the
//! coordinator's job, not this layer's — this module submits exactly
//! the batch it's handed.

use serde_json::Value;

use crate::document::{Action, BulkOp};
use crate::error::SyncError;

/// Outcome of one item in a bulk submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub id: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Result of one `bulk` call: per-item outcomes in submission order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkResult {
    pub items: Vec<ItemResult>,
}

impl BulkResult {
    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|i| i.ok)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|i| !i.ok)
    }
}

/// Submits bulk actions over HTTP to an Elasticsearch-compatible
/// `_bulk` endpoint.
pub struct BulkIndexer {
    client: reqwest::Client,
    endpoint: String,
}

impl BulkIndexer {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self { client, endpoint: endpoint.into() }
    }

    /// `bulk(index, actions)`: one HTTP round trip carrying the whole
    /// batch, encoded as newline-delimited JSON action/document pairs
    /// per the bulk API convention.
    pub async fn bulk(&self, index: &str, actions: &[BulkOp]) -> Result<BulkResult, SyncError> {
        if actions.is_empty() {
            return Ok(BulkResult::default());
        }

        let body = encode_bulk_body(index, actions);
        let url = format!("{}/_bulk", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("bulk request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Index(format!("bulk request rejected with {status}: {text}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Index(format!("bulk response was not valid JSON: {e}")))?;

        Ok(parse_bulk_response(actions, &body))
    }
}

fn encode_bulk_body(index: &str, actions: &[BulkOp]) -> String {
    let mut out = String::new();
    for action in actions {
        let header = match action.action {
            Action::Index => serde_json::json!({ "index": { "_index": index, "_id": action.id } }),
            Action::Delete => serde_json::json!({ "delete": { "_index": index, "_id": action.id } }),
        };
        out.push_str(&header.to_string());
        out.push('\n');
        if let Some(source) = &action.source {
            out.push_str(&source.to_string());
            out.push('\n');
        }
    }
    out
}

/// Parse the bulk API's `{"items": [...]}` response array, matching
/// each entry back to the submitted action by position.
fn parse_bulk_response(actions: &[BulkOp], body: &Value) -> BulkResult {
    let items = body.get("items").and_then(Value::as_array).cloned().unwrap_or_default();

    let results = actions
        .iter()
        .enumerate()
        .map(|(i, action)| match items.get(i).and_then(Value::as_object) {
            Some(entry) => {
                let inner = entry.values().next();
                let status_ok = inner
                    .and_then(|v| v.get("status"))
                    .and_then(Value::as_u64)
                    .map(|status| (200..300).contains(&status))
                    .unwrap_or(false);
                let error = inner
                    .and_then(|v| v.get("error"))
                    .map(|e| e.to_string());
                ItemResult { id: action.id.clone(), ok: status_ok && error.is_none(), error }
            }
            None => ItemResult { id: action.id.clone(), ok: false, error: Some("missing from bulk response".to_string()) },
        })
        .collect();

    BulkResult { items: results }
}
