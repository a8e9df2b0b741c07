//! Sync Coordinator.
//!
//! Orchestrates bootstrap, streaming pull, publish handling,
//! checkpointing, and status reporting. This is the only component that
//! knows about the other six (A–F) all at once; everything else in this
//! crate is a pure function or a thin I/O wrapper the coordinator calls.
//!
//! ## State machine
//!
//! ```text
//! INIT → VALIDATE → BOOTSTRAP(full-scan) → STREAM(loop) → STOP
//!                                     ↑        ↓
//!                                     └────RECOVER
//! ```
//!
//! [`Coordinator::run`] drives this machine end to end. `STREAM` itself
//! is three long-lived tasks: one reader task alternating
//! `pull`/slot-truncation, one subscriber task draining the publish
//! source, and one checkpointer task persisting the checkpoint on an
//! interval and on clean shutdown. A fatal error in the reader or
//! subscriber trips the shared cancellation token, which every task
//! observes at its next suspension point — cancellation is idempotent.
//!
//! A fourth conceptual task, the applier, is folded into `apply_events`
//! rather than run as an independent channel consumer: each
//! `pull`/`on_publish` cycle already assembles exactly one ordered batch
//! before calling the bulk indexer, which is what the literal bulk-call
//! scenarios require (exactly one bulk call per batch, preserving input
//! order). The hash-to-sub-queue partitioning a higher-throughput
//! deployment would want (so concurrent reader/subscriber output for
//! unrelated root ids can fan out while same-id output stays ordered) is
//! implemented as [`partition_by_id`] and exercised directly; see
//! DESIGN.md.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh64::xxh64;

use crate::builder::DocumentBuilder;
use crate::checkpoint::CheckpointStore;
use crate::decoder::{Decoded, Decoder, RawChange};
use crate::document::{Action, BulkOp};
use crate::error::{RetryPolicy, RetryState, SyncError};
use crate::indexer::BulkIndexer;
use crate::model::{RowEvent, TxWindow};
use crate::publish::{Payload, PublishSource};
use crate::schema::SchemaTree;
use crate::slot::SlotSource;
use crate::transform;

/// Counters surfaced by [`Coordinator::status`].
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub n_xlog: AtomicU64,
    pub n_db: AtomicU64,
    pub redis_total: AtomicU64,
    pub redis_pending: AtomicU64,
    pub n_indexed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub build_errors: AtomicU64,
}

/// Everything the coordinator needs to drive one sync descriptor end to
/// end: the schema tree, the slot it reads from, and the downstream
/// components it feeds.
pub struct Coordinator<S: SlotSource> {
    pub tree: SchemaTree,
    pub database: String,
    slot_name: String,
    slot: S,
    builder: DocumentBuilder,
    indexer: BulkIndexer,
    checkpoint_store: Arc<dyn CheckpointStore>,
    decoder: Mutex<Decoder>,
    checkpoint: AtomicI64,
    truncate_flag: AtomicBool,
    stats: CoordinatorStats,
    chunk_size: i64,
    batch_size: usize,
    poll_interval: Duration,
    checkpoint_interval: Duration,
    pool: deadpool_postgres::Pool,
    cancellation: CancellationToken,
    retry_policy: RetryPolicy,
    replication_retry: Mutex<RetryState>,
    index_retry: Mutex<RetryState>,
    started_at: Instant,
}

impl<S: SlotSource> Coordinator<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: SchemaTree,
        database: String,
        slot: S,
        builder: DocumentBuilder,
        indexer: BulkIndexer,
        checkpoint_store: Arc<dyn CheckpointStore>,
        pool: deadpool_postgres::Pool,
        chunk_size: i64,
        batch_size: usize,
        poll_interval: Duration,
        checkpoint_interval: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        let slot_name = crate::slot::SlotManager::slot_name(&database, &tree.index);
        Self {
            tree,
            database,
            slot_name,
            slot,
            builder,
            indexer,
            checkpoint_store,
            decoder: Mutex::new(Decoder::new()),
            checkpoint: AtomicI64::new(0),
            truncate_flag: AtomicBool::new(false),
            stats: CoordinatorStats::default(),
            chunk_size,
            batch_size,
            poll_interval,
            checkpoint_interval,
            pool,
            cancellation,
            retry_policy: RetryPolicy::default(),
            replication_retry: Mutex::new(RetryState::new()),
            index_retry: Mutex::new(RetryState::new()),
            started_at: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    pub fn checkpoint(&self) -> i64 {
        self.checkpoint.load(Ordering::SeqCst)
    }

    /// A child token of this coordinator's own cancellation signal, for a
    /// caller (the CLI's Ctrl-C handler) to trip from outside.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Force an out-of-band checkpoint write, for one-shot commands
    /// (`bootstrap`) that never run the checkpointer task.
    pub async fn persist_checkpoint_now(&self) {
        self.persist_checkpoint().await;
    }

    /// Resume from whatever was last persisted for (database, index).
    pub async fn load_checkpoint(&self) -> Result<(), SyncError> {
        if let Some(cp) = self.checkpoint_store.load(&self.database, &self.tree.index).await? {
            self.checkpoint.store(cp, Ordering::SeqCst);
        }
        Ok(())
    }

    // ── validate ────────────────────────────────────────────────────

    /// Checks managed-instance / GUC prerequisites for logical
    /// replication. Schema-tree shape validation happens earlier, at
    /// [`SchemaTree::from_document`] construction time (S6) — by the
    /// time a `Coordinator` exists the tree is already known-valid.
    pub async fn validate(&self) -> Result<(), SyncError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::Replication(format!("connection failed during validate: {e}")))?;

        let max_replication_slots = pg_setting_i32(&client, "max_replication_slots").await?;
        if max_replication_slots < 1 {
            return Err(SyncError::Replication(
                "Ensure there is at least one replication slot defined by setting max_replication_slots=1"
                    .to_string(),
            ));
        }

        let wal_level = pg_setting_text(&client, "wal_level").await?;
        if wal_level != "logical" {
            return Err(SyncError::Replication(
                "Enable logical decoding by setting wal_level=logical".to_string(),
            ));
        }

        if let Ok(rds_logical) = pg_setting_text(&client, "rds.logical_replication").await {
            if rds_logical != "on" {
                return Err(SyncError::Rds("rds.logical_replication is not enabled".to_string()));
            }
        }

        Ok(())
    }

    // ── bootstrap ───────────────────────────────────────────────────

    /// BOOTSTRAP state: full scan of every root, checkpoint set to the
    /// transaction id current at the start of the scan.
    pub async fn bootstrap(&self) -> Result<(), SyncError> {
        let start_txid = self.current_txid().await?;
        self.checkpoint.store(start_txid, Ordering::SeqCst);

        let ops = self.builder.bootstrap(&self.tree).await?;
        let ops = self.transform_ops(ops);

        for batch in ops.chunks(self.batch_size.max(1)) {
            self.bulk_apply(batch.to_vec()).await?;
        }
        Ok(())
    }

    // ── pull / logical_slot_changes ─────────────────────────────────

    /// One catch-up pass: streams everything committed between the last
    /// checkpoint and `txid_current() - 1`, then advances the checkpoint
    /// and marks the slot eligible for truncation on the next cycle.
    pub async fn pull(&self) -> Result<(), SyncError> {
        let checkpoint = self.checkpoint.load(Ordering::SeqCst);
        let txmin = if checkpoint == 0 { None } else { Some(checkpoint) };
        let txmax = self.current_txid().await? - 1;

        tracing::debug!(?txmin, txmax, "pull");
        self.logical_slot_changes(TxWindow::new(txmin, Some(txmax))).await?;

        self.checkpoint.store(txmax, Ordering::SeqCst);
        self.truncate_flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Repeatedly peeks `chunk_size` rows, paginating within the same
    /// peek session via an increasing `offset` (spec §4.A) so a page of
    /// pure `BEGIN`/`COMMIT` control lines — or a page that only closes
    /// out an in-flight transaction with no row events of its own — is
    /// skipped without ever advancing the slot: the next peek asks for
    /// the page right after it instead of re-reading the same one.
    ///
    /// Every peeked page is fed to the decoder so `BEGIN`/`COMMIT`
    /// framing carries across pages correctly, but `get` is issued only
    /// once a page actually yields committed-transaction events, and
    /// only *after* those events have been durably applied — per spec
    /// §3/§4.A, `get` may advance the confirmed position only past
    /// events already applied downstream. `upto_nchanges` on that `get`
    /// covers every row peeked so far this call, including the earlier
    /// pages skipped while paginating, so the slot advances past all of
    /// them in one destructive read. An empty peek ends the loop.
    pub async fn logical_slot_changes(&self, window: TxWindow) -> Result<(), SyncError> {
        let mut offset: i64 = 0;
        loop {
            if self.cancellation.is_cancelled() {
                return Ok(());
            }

            let peeked = self.slot.peek(&self.slot_name, window, None, self.chunk_size, offset).await?;
            if peeked.is_empty() {
                return Ok(());
            }

            let consumed = offset + peeked.len() as i64;

            let events = {
                let mut decoder = self.decoder.lock().await;
                self.decode_chunk(&mut decoder, &peeked)
            };

            if events.is_empty() {
                // Control-only page, or a transaction still open — keep
                // paginating without advancing the slot.
                offset = consumed;
                continue;
            }

            self.apply_events(events).await?;

            // Durably applied downstream: now it's safe to advance the
            // slot past everything peeked this call, including earlier
            // skipped pages.
            self.slot.get(&self.slot_name, window, Some(consumed)).await?;
            offset = 0;
        }
    }

    fn decode_chunk(&self, decoder: &mut Decoder, changes: &[RawChange]) -> Vec<RowEvent> {
        let mut events = Vec::new();
        for change in changes {
            match decoder.feed(change) {
                Decoded::None => {}
                Decoded::Transaction(txn) => events.extend(txn),
                Decoded::Error { raw, message } => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(raw = %raw, error = %message, "decode error, skipping line");
                }
            }
        }
        events
    }

    // ── on_publish ──────────────────────────────────────────────────

    /// Accepts externally-delivered payloads, sets the checkpoint to
    /// `min(xmin) - 1` *before* applying — deliberate, to avoid advancing
    /// past events still in-flight from the queue — then builds and
    /// indexes.
    pub async fn on_publish(&self, payloads: Vec<Payload>) -> Result<(), SyncError> {
        tracing::debug!(len = payloads.len(), "on_publish");

        if let Some(min_xmin) = payloads.iter().map(|p| p.xmin).min() {
            self.checkpoint.store(min_xmin - 1, Ordering::SeqCst);
        }

        let mut events = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match payload.into_row_event() {
                Ok(event) => events.push(event),
                Err(e) => {
                    self.stats.build_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "bad published payload, skipping");
                }
            }
        }

        self.apply_events(events).await
    }

    // ── truncate_slots ──────────────────────────────────────────────

    /// If a prior `pull` set the truncate flag, drain the slot with no
    /// limit and clear the flag.
    pub async fn truncate_slots(&self) -> Result<(), SyncError> {
        if self.truncate_flag.swap(false, Ordering::SeqCst) {
            tracing::debug!(slot = %self.slot_name, "Truncating replication slot: {}", self.slot_name);
            self.slot.get(&self.slot_name, TxWindow::unbounded(), None).await?;
        }
        Ok(())
    }

    // ── status ──────────────────────────────────────────────────────

    /// `<db_label> <index> Xlog: [n_xlog] => Db: [n_db] => Redis: [total
    /// = X pending = Y] => Elastic: [n_indexed] ...`
    pub fn status(&self, db_label: &str) -> String {
        format!(
            "{db_label} {} Xlog: [{}] => Db: [{}] => Redis: [total = {} pending = {}] => Elastic: [{}] ...\n",
            self.tree.index,
            self.stats.n_xlog.load(Ordering::Relaxed),
            self.stats.n_db.load(Ordering::Relaxed),
            self.stats.redis_total.load(Ordering::Relaxed),
            self.stats.redis_pending.load(Ordering::Relaxed),
            self.stats.n_indexed.load(Ordering::Relaxed),
        )
    }

    /// Refresh the Redis counters in the status line from a publish
    /// source's own bookkeeping.
    pub fn record_publish_counters(&self, total: u64, pending: u64) {
        self.stats.redis_total.store(total, Ordering::Relaxed);
        self.stats.redis_pending.store(pending, Ordering::Relaxed);
    }

    // ── apply path shared by pull and on_publish ─────────────────────

    async fn apply_events(&self, events: Vec<RowEvent>) -> Result<(), SyncError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut ops = Vec::new();
        for event in &events {
            match self.builder.build(&self.tree, event).await {
                Ok(built) => ops.extend(built),
                Err(e) => {
                    self.stats.build_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "document build failed, skipping event");
                }
            }
        }

        self.stats.n_xlog.fetch_add(events.len() as u64, Ordering::Relaxed);
        self.stats.n_db.fetch_add(ops.len() as u64, Ordering::Relaxed);

        if ops.is_empty() {
            return Ok(());
        }

        let ops = self.transform_ops(ops);
        self.bulk_apply(ops).await
    }

    fn transform_ops(&self, ops: Vec<BulkOp>) -> Vec<BulkOp> {
        ops.into_iter()
            .map(|op| match (op.action, &op.source) {
                (Action::Index, Some(source)) => {
                    let transformed = transform::apply(&self.tree, self.tree.root_index(), source);
                    BulkOp { source: Some(transformed), ..op }
                }
                _ => op,
            })
            .collect()
    }

    /// One bulk call per batch, preserving the batch's own order.
    /// `IndexError` is retried with backoff by the caller picking the
    /// batch back up on the next pass; this method only escalates to
    /// `Fatal` once the bulk indexer has failed too many consecutive
    /// times in a row.
    async fn bulk_apply(&self, ops: Vec<BulkOp>) -> Result<(), SyncError> {
        if ops.is_empty() {
            return Ok(());
        }
        let result = match self.indexer.bulk(&self.tree.index, &ops).await {
            Ok(result) => result,
            Err(e) => return Err(self.record_index_failure(e).await),
        };
        let succeeded = result.items.iter().filter(|i| i.ok).count();
        self.stats.n_indexed.fetch_add(succeeded as u64, Ordering::Relaxed);

        if !result.all_succeeded() {
            for item in result.failed() {
                tracing::warn!(id = %item.id, error = ?item.error, "bulk item failed, will retry next pass");
            }
            let err = SyncError::Index(format!(
                "{} of {} bulk items failed",
                ops.len() - succeeded,
                ops.len()
            ));
            return Err(self.record_index_failure(err).await);
        }

        self.index_retry.lock().await.reset();
        Ok(())
    }

    /// Record one bulk-indexer failure against the backoff policy (spec
    /// §7: "IndexError... trigger bounded exponential-backoff retry...
    /// then escalate to Fatal after N consecutive failures"). Returns the
    /// error the caller should propagate: the original `IndexError` while
    /// attempts remain, or a `Fatal` once the budget is exhausted.
    async fn record_index_failure(&self, err: SyncError) -> SyncError {
        let now_ms = self.elapsed_ms();
        let mut state = self.index_retry.lock().await;
        if state.record_failure(&self.retry_policy, now_ms) {
            err
        } else {
            SyncError::Fatal(format!("bulk indexer failed {} consecutive times: {err}", state.attempts))
        }
    }

    async fn current_txid(&self) -> Result<i64, SyncError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::Replication(format!("connection pool checkout failed: {e}")))?;
        let row = client
            .query_one("SELECT txid_current()::bigint", &[])
            .await
            .map_err(|e| SyncError::Replication(format!("txid_current() failed: {e}")))?;
        Ok(row.get(0))
    }

    async fn persist_checkpoint(&self) {
        let cp = self.checkpoint.load(Ordering::SeqCst);
        if let Err(e) = self.checkpoint_store.persist(&self.database, &self.tree.index, cp).await {
            tracing::error!(error = %e, "failed to persist checkpoint");
        }
    }
}

impl<S: SlotSource + 'static> Coordinator<S> {
    /// Drive the full state machine: VALIDATE, BOOTSTRAP, then STREAM
    /// until the cancellation token fires, then STOP. `publish_source`
    /// feeds the subscriber task.
    pub async fn run(self: Arc<Self>, mut publish_source: Box<dyn PublishSource>) -> Result<(), SyncError> {
        self.validate().await?;
        self.load_checkpoint().await?;
        if self.checkpoint.load(Ordering::SeqCst) == 0 {
            self.bootstrap().await?;
        }

        let reader = {
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move { coordinator.run_reader().await })
        };
        let subscriber = {
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        batch = publish_source.recv_batch() => {
                            match batch {
                                Some(payloads) => {
                                    let (total, pending) = publish_source.counters();
                                    coordinator.record_publish_counters(total, pending);
                                    match coordinator.on_publish(payloads).await {
                                        Ok(()) => {}
                                        Err(e) if e.is_retryable() => {
                                            tracing::warn!(error = %e, "on_publish failed for this batch, will retry next batch");
                                        }
                                        Err(e) => {
                                            tracing::error!(error = %e, "on_publish failed fatally, stopping subscriber");
                                            coordinator.cancellation.cancel();
                                            break;
                                        }
                                    }
                                }
                                None => break,
                            }
                        }
                        _ = coordinator.cancellation.cancelled() => break,
                    }
                }
            })
        };
        let checkpointer = {
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move { coordinator.run_checkpointer().await })
        };

        let _ = tokio::join!(reader, subscriber, checkpointer);
        Ok(())
    }

    /// Replication/index errors are retried with jittered exponential
    /// backoff; too many consecutive failures escalates to `Fatal`, which
    /// trips the shared cancellation token.
    async fn run_reader(&self) {
        loop {
            if self.cancellation.is_cancelled() {
                break;
            }

            match self.pull().await {
                Ok(()) => {
                    self.replication_retry.lock().await.reset();
                    if let Err(e) = self.truncate_slots().await {
                        tracing::warn!(error = %e, "truncate_slots failed");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.cancellation.cancelled() => break,
                    }
                }
                Err(e) if e.is_retryable() => {
                    let now_ms = self.elapsed_ms();
                    let mut state = self.replication_retry.lock().await;
                    if !state.record_failure(&self.retry_policy, now_ms) {
                        tracing::error!(error = %e, attempts = state.attempts, "pull failed too many consecutive times, escalating to fatal");
                        drop(state);
                        self.cancellation.cancel();
                        break;
                    }
                    let delay = Duration::from_millis(state.next_retry_at_ms.saturating_sub(now_ms));
                    drop(state);
                    tracing::warn!(error = %e, ?delay, "pull failed, retrying after backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancellation.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "pull failed fatally, stopping reader");
                    self.cancellation.cancel();
                    break;
                }
            }
        }
    }

    async fn run_checkpointer(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.checkpoint_interval) => {
                    self.persist_checkpoint().await;
                }
                _ = self.cancellation.cancelled() => {
                    self.persist_checkpoint().await;
                    break;
                }
            }
        }
    }
}

/// Hash a bulk op's `_id` into one of `n_buckets` sub-queues, preserving
/// within-bucket order, so that concurrent producers (reader +
/// subscriber) can fan documents for unrelated roots out in parallel
/// while two events for the *same* root always land in the same bucket
/// and therefore stay ordered relative to each other.
pub fn partition_by_id(ops: Vec<BulkOp>, n_buckets: usize) -> Vec<Vec<BulkOp>> {
    let n_buckets = n_buckets.max(1);
    let mut buckets: Vec<Vec<BulkOp>> = (0..n_buckets).map(|_| Vec::new()).collect();
    for op in ops {
        let bucket = (xxh64(op.id.as_bytes(), 0) as usize) % n_buckets;
        buckets[bucket].push(op);
    }
    buckets
}

async fn pg_setting_text(client: &deadpool_postgres::Object, name: &str) -> Result<String, SyncError> {
    let row = client
        .query_one("SELECT setting FROM pg_settings WHERE name = $1", &[&name])
        .await
        .map_err(|e| SyncError::Replication(format!("reading pg_settings.{name} failed: {e}")))?;
    Ok(row.get::<_, String>(0))
}

async fn pg_setting_i32(client: &deadpool_postgres::Object, name: &str) -> Result<i32, SyncError> {
    let text = pg_setting_text(client, name).await?;
    text.parse::<i32>()
        .map_err(|e| SyncError::Replication(format!("pg_settings.{name} was not an integer: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::BuiltDocument;
    use serde_json::json;

    #[test]
    fn partition_by_id_keeps_same_id_in_same_bucket_and_in_order() {
        let ops = vec![
            BulkOp::index(BuiltDocument { id: "1".into(), index: "testdb".into(), source: json!({}) }),
            BulkOp::index(BuiltDocument { id: "2".into(), index: "testdb".into(), source: json!({}) }),
            BulkOp::delete("1", "testdb"),
        ];
        let buckets = partition_by_id(ops, 4);
        let bucket_for_1: Vec<&BulkOp> = buckets.iter().flatten().filter(|op| op.id == "1").collect();
        assert_eq!(bucket_for_1.len(), 2);
        assert_eq!(bucket_for_1[0].action, Action::Index);
        assert_eq!(bucket_for_1[1].action, Action::Delete);
    }

    #[test]
    fn partition_by_id_is_deterministic() {
        let make = || {
            vec![
                BulkOp::index(BuiltDocument { id: "a".into(), index: "testdb".into(), source: json!({}) }),
                BulkOp::index(BuiltDocument { id: "b".into(), index: "testdb".into(), source: json!({}) }),
            ]
        };
        let first = partition_by_id(make(), 8);
        let second = partition_by_id(make(), 8);
        let first_ids: Vec<Vec<String>> = first.iter().map(|b| b.iter().map(|o| o.id.clone()).collect()).collect();
        let second_ids: Vec<Vec<String>> = second.iter().map(|b| b.iter().map(|o| o.id.clone()).collect()).collect();
        assert_eq!(first_ids, second_ids);
    }
}
