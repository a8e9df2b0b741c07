//! Publish path.
//!
//! Accepts already-decoded payloads from an external queue and feeds the
//! document builder directly, bypassing the slot manager and decoder
//! entirely. The Redis-backed queue itself is an external collaborator
//! out of scope here; this module defines the trait it would implement
//! plus an in-memory double used by tests and by any collaborator that
//! wants to feed payloads without a real queue.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncError;
use crate::model::{Operation, RowEvent, Scalar, Tuple};

/// One externally-delivered row change: `{schema, tg_op, table, old,
/// new, xmin}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub schema: String,
    pub tg_op: String,
    pub table: String,
    pub old: serde_json::Map<String, Value>,
    pub new: serde_json::Map<String, Value>,
    pub xmin: i64,
}

impl Payload {
    pub fn into_row_event(self) -> Result<RowEvent, SyncError> {
        let operation = Operation::from_str(&self.tg_op)
            .ok_or_else(|| SyncError::Build(format!("unknown tg_op in published payload: {}", self.tg_op)))?;
        Ok(RowEvent {
            schema: self.schema,
            table: self.table,
            operation,
            old: map_to_tuple(self.old),
            new: map_to_tuple(self.new),
            xid: self.xmin,
        })
    }
}

fn map_to_tuple(map: serde_json::Map<String, Value>) -> Tuple {
    let mut tuple = Tuple::new();
    for (k, v) in map {
        tuple.push(k, json_to_scalar(v));
    }
    tuple
}

fn json_to_scalar(v: Value) -> Scalar {
    match v {
        Value::Null => Scalar::Null,
        Value::Bool(b) => Scalar::Boolean(b),
        Value::Number(n) => n.as_i64().map(Scalar::Integer).unwrap_or_else(|| Scalar::Numeric(n.to_string())),
        Value::String(s) => Scalar::Text(s),
        other => Scalar::Json(other),
    }
}

/// What the coordinator's subscriber task polls. An ancillary
/// Redis-backed queue, used for decoupling payload publication, would
/// implement this; it is not implemented here.
#[async_trait]
pub trait PublishSource: Send {
    /// Receive the next batch of payloads, or `None` when the source is
    /// permanently closed.
    async fn recv_batch(&mut self) -> Option<Vec<Payload>>;

    /// Total payloads ever seen and payloads still queued, for `_status`'s
    /// `Redis: [total = X pending = Y]` counters.
    fn counters(&self) -> (u64, u64) {
        (0, 0)
    }
}

/// In-memory [`PublishSource`] backed by a channel, used by tests and by
/// any in-process producer that doesn't need a real queue.
pub struct ChannelPublishSource {
    rx: tokio::sync::mpsc::Receiver<Vec<Payload>>,
    total: u64,
    pending: u64,
}

impl ChannelPublishSource {
    pub fn new(rx: tokio::sync::mpsc::Receiver<Vec<Payload>>) -> Self {
        Self { rx, total: 0, pending: 0 }
    }
}

#[async_trait]
impl PublishSource for ChannelPublishSource {
    async fn recv_batch(&mut self) -> Option<Vec<Payload>> {
        let batch = self.rx.recv().await?;
        self.total += batch.len() as u64;
        self.pending = self.rx.len() as u64;
        Some(batch)
    }

    fn counters(&self) -> (u64, u64) {
        (self.total, self.pending)
    }
}

/// Stub for a Redis-backed [`PublishSource`]. Left unimplemented
/// deliberately: the queue itself is an external collaborator out of
/// this crate's core scope. Kept as a named type so the CLI's `sync`
/// command has somewhere to wire a `redis_url` once a real client is
/// chosen.
#[cfg(feature = "redis")]
pub struct RedisPublishSource {
    _url: String,
}

#[cfg(feature = "redis")]
impl RedisPublishSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { _url: url.into() }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl PublishSource for RedisPublishSource {
    async fn recv_batch(&mut self) -> Option<Vec<Payload>> {
        unimplemented!("Redis-backed publish queue is an external collaborator, not implemented here")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_converts_to_row_event() {
        let mut new = serde_json::Map::new();
        new.insert("isbn".to_string(), json!("0001"));
        let payload = Payload {
            schema: "public".to_string(),
            tg_op: "INSERT".to_string(),
            table: "book".to_string(),
            old: serde_json::Map::new(),
            new,
            xmin: 1234,
        };
        let event = payload.into_row_event().unwrap();
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.new.get("isbn"), Some(&Scalar::Text("0001".to_string())));
        assert_eq!(event.xid, 1234);
    }

    #[test]
    fn unknown_tg_op_is_rejected() {
        let payload = Payload {
            schema: "public".to_string(),
            tg_op: "FROBNICATE".to_string(),
            table: "book".to_string(),
            old: serde_json::Map::new(),
            new: serde_json::Map::new(),
            xmin: 1,
        };
        assert!(payload.into_row_event().is_err());
    }

    #[tokio::test]
    async fn channel_publish_source_tracks_counters() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let mut source = ChannelPublishSource::new(rx);
        tx.send(vec![]).await.unwrap();
        tx.send(vec![]).await.unwrap();

        source.recv_batch().await;
        let (total, pending) = source.counters();
        assert_eq!(total, 0);
        assert_eq!(pending, 1);
    }
}
