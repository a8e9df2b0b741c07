//! Core data model: row events, WAL positions, and typed column values.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A single typed scalar parsed from a logical-decoding column value, or
/// decoded from a published payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Integer(i64),
    Text(String),
    Boolean(bool),
    Numeric(String),
    Timestamp(String),
    Json(serde_json::Value),
}

impl Scalar {
    /// Whether this value coerces to false for the purposes of the
    /// concat transform's filter step: empty, null, or zero.
    pub fn is_falsy(&self) -> bool {
        match self {
            Scalar::Null => true,
            Scalar::Text(s) => s.is_empty(),
            Scalar::Integer(n) => *n == 0,
            Scalar::Numeric(s) => s.is_empty() || s == "0",
            Scalar::Boolean(b) => !b,
            Scalar::Timestamp(s) => s.is_empty(),
            Scalar::Json(v) => v.is_null(),
        }
    }

    /// Render as the string form used by `concat`'s `str.join` semantics.
    pub fn as_join_str(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Integer(n) => n.to_string(),
            Scalar::Text(s) => s.clone(),
            Scalar::Boolean(b) => b.to_string(),
            Scalar::Numeric(s) => s.clone(),
            Scalar::Timestamp(s) => s.clone(),
            Scalar::Json(v) => v.to_string(),
        }
    }

    /// Convert to a `serde_json::Value`, the representation used once a
    /// row enters the document builder.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Null => serde_json::Value::Null,
            Scalar::Integer(n) => serde_json::Value::from(*n),
            Scalar::Text(s) => serde_json::Value::from(s.clone()),
            Scalar::Boolean(b) => serde_json::Value::from(*b),
            Scalar::Numeric(s) => match s.parse::<f64>() {
                Ok(f) => serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .unwrap_or_else(|| serde_json::Value::from(s.clone())),
                Err(_) => serde_json::Value::from(s.clone()),
            },
            Scalar::Timestamp(s) => serde_json::Value::from(s.clone()),
            Scalar::Json(v) => v.clone(),
        }
    }
}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Integer(a), Scalar::Integer(b)) => a.partial_cmp(b),
            (Scalar::Text(a), Scalar::Text(b)) => a.partial_cmp(b),
            (Scalar::Boolean(a), Scalar::Boolean(b)) => a.partial_cmp(b),
            (Scalar::Numeric(a), Scalar::Numeric(b)) => a.partial_cmp(b),
            (Scalar::Timestamp(a), Scalar::Timestamp(b)) => a.partial_cmp(b),
            (Scalar::Null, Scalar::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

/// An ordered column-name → value tuple, preserving the column order the
/// decoder or publisher produced it in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    columns: Vec<(String, Scalar)>,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Scalar) {
        self.columns.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Scalar)> {
        self.columns.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// All primary-key columns are present — the invariant required of
    /// UPDATE/DELETE old-tuples.
    pub fn has_all(&self, keys: &[String]) -> bool {
        keys.iter().all(|k| self.get(k).is_some())
    }

    /// Project the tuple down to a stable, ordered map keyed by column
    /// name — used to derive the document `_id` and for catalog-driven
    /// column filtering.
    pub fn to_ordered_map(&self) -> BTreeMap<String, Scalar> {
        self.columns.iter().cloned().collect()
    }
}

/// The DML operation a row event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Truncate => "TRUNCATE",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            "TRUNCATE" => Some(Operation::Truncate),
            _ => None,
        }
    }
}

/// A single decoded (or published) row change.
///
/// Invariant: for UPDATE/DELETE, all primary-key columns are present in
/// `old`. Not enforced here — callers validate against the schema
/// tree's declared primary keys, since the event alone doesn't know
/// which columns are primary keys.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub schema: String,
    pub table: String,
    pub operation: Operation,
    pub old: Tuple,
    pub new: Tuple,
    pub xid: i64,
}

impl RowEvent {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// WAL position: an opaque, monotonically non-decreasing value bounding a
/// replay window. `txmax - 1` is the current committed-stable bound.
pub type XactId = i64;

/// A `(txmin, txmax)` replay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxWindow {
    pub txmin: Option<XactId>,
    pub txmax: Option<XactId>,
}

impl TxWindow {
    pub fn new(txmin: Option<XactId>, txmax: Option<XactId>) -> Self {
        Self { txmin, txmax }
    }

    pub fn unbounded() -> Self {
        Self { txmin: None, txmax: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_preserves_insertion_order() {
        let mut t = Tuple::new();
        t.push("b", Scalar::Integer(1));
        t.push("a", Scalar::Integer(2));
        let names: Vec<_> = t.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn falsy_values() {
        assert!(Scalar::Null.is_falsy());
        assert!(Scalar::Text(String::new()).is_falsy());
        assert!(Scalar::Integer(0).is_falsy());
        assert!(!Scalar::Integer(1).is_falsy());
        assert!(!Scalar::Text("x".into()).is_falsy());
    }

    #[test]
    fn has_all_primary_keys() {
        let mut t = Tuple::new();
        t.push("id", Scalar::Integer(1));
        assert!(t.has_all(&["id".to_string()]));
        assert!(!t.has_all(&["id".to_string(), "isbn".to_string()]));
    }
}
