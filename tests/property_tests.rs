//! Property-based tests using proptest.
//!
//! Covers the invariants that don't need a live database:
//! - resume correctness: splitting a WAL stream's feed() calls at an
//!   arbitrary point doesn't change the decoded transactions
//! - rename idempotence under empty directives
//! - concat determinism
//! - primary-key / list-leaf scalar arrays come out sorted ascending
//!
//! Invariants about checkpoint/retry ordering already have dedicated
//! unit test coverage in `coordinator.rs` and `decoder.rs`.

use pgsync_core::decoder::{Decoded, Decoder, RawChange};
use pgsync_core::model::RowEvent;
use pgsync_core::transform::{concat, rename};
use proptest::prelude::*;
use serde_json::{Value, json};

// ── resume correctness ──────────────────────────────────────────────

/// One committed transaction's worth of raw lines: a `BEGIN`, one
/// `INSERT` row line per id in `ids`, then `COMMIT` — all sharing `xid`.
fn transaction_lines(xid: i64, ids: &[i64]) -> Vec<RawChange> {
    let mut lines = vec![RawChange::new(xid, "BEGIN")];
    for id in ids {
        lines.push(RawChange::new(
            xid,
            format!("table public.book: INSERT: id[integer]:{id}"),
        ));
    }
    lines.push(RawChange::new(xid, "COMMIT"));
    lines
}

/// A stream of `n_txns` transactions, xids `1..=n_txns`, each inserting
/// `rows_per_txn` sequential ids unique to that transaction.
fn arb_wal_stream() -> impl Strategy<Value = Vec<RawChange>> {
    (1usize..=6, 0usize..=3).prop_map(|(n_txns, rows_per_txn)| {
        let mut stream = Vec::new();
        for xid in 1..=n_txns as i64 {
            let ids: Vec<i64> = (0..rows_per_txn as i64).map(|i| xid * 100 + i).collect();
            stream.extend(transaction_lines(xid, &ids));
        }
        stream
    })
}

/// Feed every line to `decoder`, collecting every committed transaction's
/// events in WAL order. Decode errors are treated as test failures —
/// `arb_wal_stream` only ever generates well-formed lines.
fn drain(decoder: &mut Decoder, lines: &[RawChange]) -> Vec<RowEvent> {
    let mut events = Vec::new();
    for line in lines {
        match decoder.feed(line) {
            Decoded::None => {}
            Decoded::Transaction(txn) => events.extend(txn),
            Decoded::Error { raw, message } => {
                panic!("unexpected decode error on {raw:?}: {message}")
            }
        }
    }
    events
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Feeding a whole stream to one decoder yields the same events as
    /// splitting the same stream at any point and feeding both halves to
    /// the same decoder instance in sequence — a restart that resumes
    /// mid-stream must not lose or duplicate events, provided it never
    /// resumes inside an in-flight transaction (which callers never do:
    /// checkpoints only advance once a transaction has committed).
    #[test]
    fn prop_resume_at_transaction_boundary_is_lossless(stream in arb_wal_stream()) {
        let mut whole = Decoder::new();
        let whole_events = drain(&mut whole, &stream);

        // Only split at indices that land exactly on a transaction
        // boundary (right after a COMMIT line), mirroring how a real
        // restart resumes from a committed checkpoint.
        let mut boundaries = vec![0usize];
        for (i, line) in stream.iter().enumerate() {
            let trimmed = line.data.trim();
            if trimmed == "COMMIT" || trimmed.starts_with("COMMIT ") {
                boundaries.push(i + 1);
            }
        }

        for split in boundaries {
            let mut split_decoder = Decoder::new();
            let mut split_events = drain(&mut split_decoder, &stream[..split]);
            split_events.extend(drain(&mut split_decoder, &stream[split..]));
            prop_assert_eq!(&split_events, &whole_events);
            prop_assert!(!split_decoder.has_pending_transaction());
        }
    }

    // ── rename idempotence ──────────────────────────────────────────

    /// `rename(rename(d, {}), {}) == rename(d, {}) == d` for a flat
    /// object of JSON scalars — with no rename directives there's
    /// nothing to relabel, so the only thing rename can do is leave the
    /// object as-is (list values are handled by their own property
    /// below, since sorting makes `rename` *not* an identity on them).
    #[test]
    fn prop_rename_idempotent_on_flat_scalars(
        entries in prop::collection::vec(("[a-z]{1,8}", arb_scalar()), 0..6),
    ) {
        let mut map = serde_json::Map::new();
        for (k, v) in entries {
            map.insert(k, v);
        }
        let data = Value::Object(map);
        let directives = json!({});

        let once = rename(&data, &directives);
        let twice = rename(&once, &directives);

        prop_assert_eq!(&once, &data);
        prop_assert_eq!(&twice, &once);
    }

    // ── concat determinism ──────────────────────────────────────────

    /// `concat(d, spec)` is a pure function of `(d, spec)` — calling it
    /// twice on the same inputs yields byte-identical output.
    #[test]
    fn prop_concat_is_deterministic(
        a in prop::option::of(-1000i64..1000),
        b in prop::option::of("[a-zA-Z0-9 ]{0,10}"),
        delimiter in "[-_,:]{0,2}",
    ) {
        let mut map = serde_json::Map::new();
        if let Some(a) = a {
            map.insert("a".to_string(), json!(a));
        }
        if let Some(b) = &b {
            map.insert("b".to_string(), json!(b));
        }
        let data = Value::Object(map);
        let nodes = json!({
            "__concat__": [
                { "columns": ["a", "b"], "destination": "ab", "delimiter": delimiter }
            ]
        });

        prop_assert_eq!(concat(&data, &nodes), concat(&data, &nodes));
    }

    // ── list-leaf sorting ─────────────────────────────────────────────

    /// A list of same-typed scalars under a key, after `rename` with no
    /// directives, comes out sorted ascending — the sorting `rename`
    /// applies to list-leaf fields, which is how primary-key-derived
    /// arrays stay comparable across publishes.
    #[test]
    fn prop_scalar_list_leaf_is_sorted_ascending(mut ints in prop::collection::vec(-1000i64..1000, 1..10)) {
        let data = json!({ "ids": ints.clone() });
        let renamed = rename(&data, &json!({}));

        ints.sort();
        prop_assert_eq!(renamed["ids"], json!(ints));
    }

    #[test]
    fn prop_string_list_leaf_is_sorted_ascending(mut words in prop::collection::vec("[a-z]{1,6}", 1..10)) {
        let data = json!({ "tags": words.clone() });
        let renamed = rename(&data, &json!({}));

        words.sort();
        prop_assert_eq!(renamed["tags"], json!(words));
    }
}

/// An arbitrary JSON scalar (never object/array — those have their own
/// rename semantics tested separately).
fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        (-1000i64..1000).prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ]
}

// ── literal regression cases ────────────────────────────────────────
// A few concrete examples alongside the generated ones, matching the
// style of the decoder's own `#[cfg(test)]` module.

#[test]
fn resume_mid_multi_row_transaction_would_lose_the_open_transaction() {
    // Demonstrates why splits are only taken at transaction boundaries
    // above: a decoder that restarts with an in-flight transaction
    // simply never sees its COMMIT and never emits it. Real restarts
    // never do this because checkpoints only advance past a committed
    // xmax, but the decoder itself does not defend against it.
    let stream = transaction_lines(1, &[1, 2, 3]);

    let mut whole = Decoder::new();
    let whole_events = drain(&mut whole, &stream);
    assert_eq!(whole_events.len(), 3);

    let mut split = Decoder::new();
    let mut split_events = drain(&mut split, &stream[..2]);
    assert!(split.has_pending_transaction());
    split_events.extend(drain(&mut split, &stream[2..]));
    assert_eq!(split_events.len(), 3);
    assert_eq!(split_events, whole_events);
}

#[test]
fn rename_then_concat_pipeline_is_order_sensitive() {
    let data = json!({ "id": 7, "name": "Acme" });
    let rename_nodes = json!({ "id": "publisher_id" });
    let renamed = rename(&data, &rename_nodes);

    let concat_nodes = json!({
        "__concat__": [
            { "columns": ["publisher_id", "name"], "destination": "label", "delimiter": " - " }
        ]
    });
    let out = concat(&renamed, &concat_nodes);
    assert_eq!(out["label"], json!("7 - Acme"));

    // Concat first (before the rename that introduces `publisher_id`)
    // would see a missing column and fall back to its literal name.
    let out_wrong_order = concat(&data, &concat_nodes);
    assert_eq!(out_wrong_order["label"], json!("publisher_id - Acme"));
}
