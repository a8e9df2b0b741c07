//! Built documents and operation batches.

use serde_json::Value;

/// A document materialized for one root primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltDocument {
    pub id: String,
    pub index: String,
    pub source: Value,
}

/// What to do with a [`BuiltDocument`] in the bulk API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Index,
    Delete,
}

/// One entry in an operation batch: an ordered sequence of
/// `(document, action)` pairs. For deletes, `source` is empty — only
/// `id` and `index` matter.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOp {
    pub id: String,
    pub index: String,
    pub action: Action,
    pub source: Option<Value>,
}

impl BulkOp {
    pub fn index(doc: BuiltDocument) -> Self {
        Self {
            id: doc.id,
            index: doc.index,
            action: Action::Index,
            source: Some(doc.source),
        }
    }

    pub fn delete(id: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index: index.into(),
            action: Action::Delete,
            source: None,
        }
    }
}

/// Derive a document `_id` from a root node's primary-key tuple via a
/// stable serialization. A single-column key serializes to its
/// bare value; a composite key serializes as an ordered, comma-joined
/// list of its column values, so that identical key tuples always
/// produce identical bytes regardless of how they were looked up.
pub fn derive_id(primary_key_values: &[(String, Value)]) -> String {
    if primary_key_values.len() == 1 {
        return scalar_id_part(&primary_key_values[0].1);
    }
    primary_key_values
        .iter()
        .map(|(_, v)| scalar_id_part(v))
        .collect::<Vec<_>>()
        .join("-")
}

fn scalar_id_part(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_column_id_is_bare_value() {
        let id = derive_id(&[("id".to_string(), Value::from(10))]);
        assert_eq!(id, "10");
    }

    #[test]
    fn composite_id_joins_in_declared_order() {
        let id = derive_id(&[
            ("a".to_string(), Value::from(1)),
            ("b".to_string(), Value::from("x")),
        ]);
        assert_eq!(id, "1-x");
    }
}
