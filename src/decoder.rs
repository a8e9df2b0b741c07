//! Change Decoder.
//!
//! Parses PostgreSQL logical-decoding text payloads ("test_decoding"
//! output plugin style) into structured [`RowEvent`]s, grouped by
//! committed transaction.
//!
//! Grammar:
//! ```text
//! BEGIN <xid>
//! table <schema>.<table>: <OP>: <col>[<type>]:<value> ...
//! COMMIT <xid>
//! ```
//!
//! The xid itself is not parsed out of the `BEGIN`/`COMMIT` text — the
//! slot manager's SQL function already returns it as a separate column
//! alongside the `data` text (see [`RawChange`]), so the decoder just
//! uses that to frame transactions.
//!
//! `old-key:` / `new-tuple:` markers, present when the source table has
//! non-default `REPLICA IDENTITY`, switch which tuple subsequent
//! `col[type]:value` pairs are written into; their absence means every
//! column belongs to the new tuple for INSERT/UPDATE and the old tuple
//! for DELETE/TRUNCATE.

use crate::model::{Operation, RowEvent, Scalar, Tuple};

/// One row as returned by `pg_logical_slot_{peek,get}_changes`: the xid
/// column plus the raw decoded text line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub xid: i64,
    pub data: String,
}

impl RawChange {
    pub fn new(xid: i64, data: impl Into<String>) -> Self {
        Self { xid, data: data.into() }
    }
}

/// The outcome of feeding one [`RawChange`] into the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A control line (`BEGIN`/`COMMIT`) was consumed; no event yet.
    None,
    /// A malformed line or unknown operation token. Carries the raw text.
    Error { raw: String, message: String },
    /// A transaction committed — every row event it contains, in WAL order.
    Transaction(Vec<RowEvent>),
}

#[derive(Debug, Default)]
enum DecoderState {
    #[default]
    Idle,
    InTransaction {
        xid: i64,
        events: Vec<RowEvent>,
    },
}

/// Stateful decoder: buffers row events by xid until `COMMIT` is seen.
#[derive(Debug, Default)]
pub struct Decoder {
    state: DecoderState,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transaction is currently open (held back awaiting COMMIT).
    pub fn has_pending_transaction(&self) -> bool {
        matches!(self.state, DecoderState::InTransaction { .. })
    }

    pub fn feed(&mut self, raw: &RawChange) -> Decoded {
        let line = raw.data.trim();

        if line == "BEGIN" || line.starts_with("BEGIN ") {
            self.state = DecoderState::InTransaction {
                xid: raw.xid,
                events: Vec::new(),
            };
            return Decoded::None;
        }

        if line == "COMMIT" || line.starts_with("COMMIT ") {
            return match std::mem::take(&mut self.state) {
                DecoderState::InTransaction { events, .. } => Decoded::Transaction(events),
                DecoderState::Idle => Decoded::Error {
                    raw: raw.data.clone(),
                    message: "COMMIT seen without a matching BEGIN".to_string(),
                },
            };
        }

        if let Some(rest) = line.strip_prefix("table ") {
            return match parse_change_line(rest, raw.xid) {
                Ok(event) => match &mut self.state {
                    DecoderState::InTransaction { events, .. } => {
                        events.push(event);
                        Decoded::None
                    }
                    DecoderState::Idle => Decoded::Error {
                        raw: raw.data.clone(),
                        message: "row change outside of a BEGIN/COMMIT frame".to_string(),
                    },
                },
                Err(message) => Decoded::Error { raw: raw.data.clone(), message },
            };
        }

        Decoded::Error {
            raw: raw.data.clone(),
            message: "unrecognized logical-decoding line".to_string(),
        }
    }
}

/// Parse `<schema>.<table>: <OP>: <col>[<type>]:<value> ...` (the part
/// after the `table ` keyword has already been stripped).
fn parse_change_line(rest: &str, xid: i64) -> Result<RowEvent, String> {
    let mut parts = rest.splitn(3, ':');
    let qualified = parts.next().unwrap_or("").trim();
    let op_token = parts.next().ok_or("missing operation token")?.trim();
    let columns_str = parts.next().unwrap_or("").trim();

    let (schema, table) = qualified
        .split_once('.')
        .ok_or_else(|| format!("malformed schema.table: {qualified}"))?;

    let operation =
        Operation::from_str(op_token).ok_or_else(|| format!("unknown operation token: {op_token}"))?;

    let mut old = Tuple::new();
    let mut new = Tuple::new();

    // Default target tuple: DELETE/TRUNCATE columns describe the row
    // being removed (old); INSERT/UPDATE columns describe the row's
    // current values (new).
    let mut target = match operation {
        Operation::Delete | Operation::Truncate => TupleTarget::Old,
        Operation::Insert | Operation::Update => TupleTarget::New,
    };

    let mut cursor = columns_str;
    while !cursor.trim_start().is_empty() {
        cursor = cursor.trim_start();

        if let Some(stripped) = cursor.strip_prefix("old-key:") {
            target = TupleTarget::Old;
            cursor = stripped;
            continue;
        }
        if let Some(stripped) = cursor.strip_prefix("new-tuple:") {
            target = TupleTarget::New;
            cursor = stripped;
            continue;
        }

        let (name, type_name, value, remainder) = parse_column_token(cursor)?;
        let scalar = coerce_scalar(&type_name, value);
        match target {
            TupleTarget::Old => old.push(name, scalar),
            TupleTarget::New => new.push(name, scalar),
        }
        cursor = remainder;
    }

    Ok(RowEvent {
        schema: schema.to_string(),
        table: table.to_string(),
        operation,
        old,
        new,
        xid,
    })
}

#[derive(Clone, Copy)]
enum TupleTarget {
    Old,
    New,
}

/// Parse one `col[type]:value` token off the front of `input`, returning
/// `(column, type, raw_value, remainder)`.
fn parse_column_token(input: &str) -> Result<(String, String, ColumnValue, &str), String> {
    let open = input.find('[').ok_or("expected '[' after column name")?;
    let name = input[..open].trim().to_string();
    if name.is_empty() {
        return Err("empty column name".to_string());
    }

    let close = input[open..].find(']').map(|i| i + open).ok_or("expected ']' after type")?;
    let type_name = input[open + 1..close].to_string();

    let after_close = &input[close + 1..];
    let after_colon = after_close
        .strip_prefix(':')
        .ok_or("expected ':' after column type")?;

    let (value, remainder) = parse_value(after_colon)?;
    Ok((name, type_name, value, remainder))
}

enum ColumnValue<'a> {
    Null,
    Quoted(String),
    Bare(&'a str),
}

/// Parse a single value: `null` (unquoted → SQL NULL, never coerced to
/// an empty string), a single-quoted string (`''` is an escaped quote),
/// or a bare unquoted token running to the next whitespace.
fn parse_value(input: &str) -> Result<(ColumnValue<'_>, &str), String> {
    if let Some(rest) = input.strip_prefix("null") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            return Ok((ColumnValue::Null, rest));
        }
    }

    if let Some(mut rest) = input.strip_prefix('\'') {
        let mut value = String::new();
        loop {
            match rest.find('\'') {
                None => return Err("unterminated quoted value".to_string()),
                Some(idx) => {
                    value.push_str(&rest[..idx]);
                    let after = &rest[idx + 1..];
                    if let Some(continued) = after.strip_prefix('\'') {
                        // doubled quote: literal single quote, keep scanning
                        value.push('\'');
                        rest = continued;
                    } else {
                        return Ok((ColumnValue::Quoted(value), after));
                    }
                }
            }
        }
    }

    let end = input.find(char::is_whitespace).unwrap_or(input.len());
    Ok((ColumnValue::Bare(&input[..end]), &input[end..]))
}

/// Disambiguate a value into a [`Scalar`] using the bracketed type tag.
fn coerce_scalar(type_name: &str, value: ColumnValue<'_>) -> Scalar {
    let raw = match value {
        ColumnValue::Null => return Scalar::Null,
        ColumnValue::Quoted(s) => s,
        ColumnValue::Bare(s) => s.to_string(),
    };

    match type_name {
        "integer" | "bigint" | "smallint" | "oid" => {
            raw.parse::<i64>().map(Scalar::Integer).unwrap_or(Scalar::Text(raw))
        }
        "boolean" => match raw.as_str() {
            "t" | "true" => Scalar::Boolean(true),
            "f" | "false" => Scalar::Boolean(false),
            _ => Scalar::Text(raw),
        },
        "numeric" | "real" | "double precision" => Scalar::Numeric(raw),
        "jsonb" | "json" => serde_json::from_str(&raw).map(Scalar::Json).unwrap_or(Scalar::Text(raw)),
        t if t.starts_with("timestamp") => Scalar::Timestamp(raw),
        _ => Scalar::Text(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_only_chunk_produces_no_events() {
        let mut d = Decoder::new();
        assert_eq!(d.feed(&RawChange::new(1234, "BEGIN: blah")), Decoded::None);
    }

    #[test]
    fn commit_without_begin_is_an_error() {
        let mut d = Decoder::new();
        match d.feed(&RawChange::new(1234, "COMMIT: blah")) {
            Decoded::Error { .. } => {}
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn single_insert_round_trips_from_spec_example() {
        let mut d = Decoder::new();
        assert_eq!(d.feed(&RawChange::new(1234, "BEGIN")), Decoded::None);

        let line = "table public.book: INSERT: id[integer]:10 isbn[character \
                     varying]:'888' title[character varying]:'My book title' \
                     description[character varying]:null copyright[character \
                     varying]:null tags[jsonb]:null publisher_id[integer]:null";
        assert_eq!(d.feed(&RawChange::new(1234, line)), Decoded::None);

        match d.feed(&RawChange::new(1234, "COMMIT")) {
            Decoded::Transaction(events) => {
                assert_eq!(events.len(), 1);
                let ev = &events[0];
                assert_eq!(ev.schema, "public");
                assert_eq!(ev.table, "book");
                assert_eq!(ev.operation, Operation::Insert);
                assert_eq!(ev.new.get("id"), Some(&Scalar::Integer(10)));
                assert_eq!(ev.new.get("isbn"), Some(&Scalar::Text("888".to_string())));
                assert_eq!(ev.new.get("title"), Some(&Scalar::Text("My book title".to_string())));
                assert_eq!(ev.new.get("description"), Some(&Scalar::Null));
                assert_eq!(ev.new.get("tags"), Some(&Scalar::Null));
            }
            other => panic!("expected Transaction, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_transaction_is_held_back() {
        let mut d = Decoder::new();
        d.feed(&RawChange::new(1, "BEGIN"));
        d.feed(&RawChange::new(
            1,
            "table public.book: INSERT: id[integer]:1",
        ));
        assert!(d.has_pending_transaction());
    }

    #[test]
    fn embedded_doubled_quote_is_unescaped() {
        let mut d = Decoder::new();
        d.feed(&RawChange::new(1, "BEGIN"));
        d.feed(&RawChange::new(
            1,
            "table public.book: INSERT: title[character varying]:'it''s here'",
        ));
        match d.feed(&RawChange::new(1, "COMMIT")) {
            Decoded::Transaction(events) => {
                assert_eq!(
                    events[0].new.get("title"),
                    Some(&Scalar::Text("it's here".to_string()))
                );
            }
            other => panic!("expected Transaction, got {other:?}"),
        }
    }

    #[test]
    fn malformed_line_is_a_decode_error() {
        let mut d = Decoder::new();
        d.feed(&RawChange::new(1, "BEGIN"));
        match d.feed(&RawChange::new(1, "table public.book: FROBNICATE: id[integer]:1")) {
            Decoded::Error { .. } => {}
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn delete_places_columns_in_old_tuple() {
        let mut d = Decoder::new();
        d.feed(&RawChange::new(1, "BEGIN"));
        d.feed(&RawChange::new(1, "table public.book: DELETE: id[integer]:10"));
        match d.feed(&RawChange::new(1, "COMMIT")) {
            Decoded::Transaction(events) => {
                assert_eq!(events[0].old.get("id"), Some(&Scalar::Integer(10)));
                assert!(events[0].new.is_empty());
            }
            other => panic!("expected Transaction, got {other:?}"),
        }
    }
}
