//! Transform Pipeline.
//!
//! Two transforms, applied in fixed order: rename, then concat. Both are
//! pure functions over `serde_json::Value` — an explicit tagged match
//! over object/array/scalar/null rather than dynamically-typed
//! branching. `replace` is intentionally absent: it was already
//! commented out upstream with no documented contract, so there's
//! nothing here to ground an implementation on.

use serde_json::{Map, Value};

use crate::schema::{NodeIndex, SchemaTree, TransformKind};

/// Apply the full pipeline (rename, then concat) to a built document's
/// `_source` tree, rooted at `root` in `tree`.
pub fn apply(tree: &SchemaTree, root: NodeIndex, data: &Value) -> Value {
    let renamed = rename(data, &tree.transform_subtree(root, TransformKind::Rename));
    concat(&renamed, &tree.transform_subtree(root, TransformKind::Concat))
}

/// Rename keys in a nested document based on a transform subtree built by
/// [`SchemaTree::transform_subtree`].
///
/// Rules, applied per key at each level:
/// 1. `nodes[key]` is a string → rename the key to that string; value
///    unchanged (no recursion).
/// 2. Value is a nested object and `key` has a subtree → recurse using
///    that subtree.
/// 3. Value is a list of non-objects → sort it (stable); if the elements
///    are mutually incomparable, leave the original order.
/// 4. Value is a list of objects and `key` has a subtree → recurse into
///    each element.
/// 5. Value is a scalar — nothing left to do once (1) has been tried.
pub fn rename(data: &Value, nodes: &Value) -> Value {
    let Value::Object(map) = data else {
        return data.clone();
    };

    let mut result = Map::new();
    for (key, value) in map {
        apply_rename_entry(&mut result, key, value, nodes);
    }
    Value::Object(result)
}

fn apply_rename_entry(result: &mut Map<String, Value>, key: &str, value: &Value, nodes: &Value) {
    let node_for_key = nodes.as_object().and_then(|m| m.get(key));

    if let Some(Value::String(new_key)) = node_for_key {
        result.insert(new_key.clone(), value.clone());
        return;
    }

    match value {
        Value::Object(_) => {
            let renamed = match node_for_key {
                Some(child_nodes) => rename(value, child_nodes),
                None => value.clone(),
            };
            result.insert(key.to_string(), renamed);
        }
        Value::Array(arr) => {
            let all_non_objects = !arr.is_empty() && arr.iter().all(|v| !v.is_object());
            if all_non_objects {
                let mut sorted = arr.clone();
                if !try_sort_scalars(&mut sorted) {
                    sorted = arr.clone();
                }
                result.insert(key.to_string(), Value::Array(sorted));
            } else if let Some(child_nodes) = node_for_key {
                let mapped = arr.iter().map(|v| rename(v, child_nodes)).collect();
                result.insert(key.to_string(), Value::Array(mapped));
            } else {
                result.insert(key.to_string(), value.clone());
            }
        }
        _ => {
            result.insert(key.to_string(), value.clone());
        }
    }
}

/// Sort a list of mutually comparable JSON scalars in place (stable).
/// Returns `false` (leaving `arr` untouched by the caller) if the
/// elements aren't all the same comparable kind.
fn try_sort_scalars(arr: &mut [Value]) -> bool {
    if arr.iter().all(|v| v.is_string()) {
        arr.sort_by(|a, b| a.as_str().unwrap().cmp(b.as_str().unwrap()));
        true
    } else if arr.iter().all(|v| v.is_number()) {
        arr.sort_by(|a, b| {
            a.as_f64()
                .unwrap_or(f64::NAN)
                .partial_cmp(&b.as_f64().unwrap_or(f64::NAN))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        true
    } else if arr.iter().all(|v| v.is_boolean()) {
        arr.sort_by_key(|v| v.as_bool().unwrap());
        true
    } else if arr.iter().all(|v| v.is_null()) {
        true
    } else {
        false
    }
}

/// Concatenate declared column values into new fields.
///
/// For each concat spec at a level (stored under the reserved
/// `__concat__` key by [`SchemaTree::transform_subtree`]): evaluate each
/// named column against the current level (its value if present, else
/// the literal column name), filter out falsy values (empty, null,
/// zero, false), join with `delimiter`, and write to `destination`,
/// overwriting. Recurses into nested object/array values keyed by
/// schema children.
pub fn concat(data: &Value, nodes: &Value) -> Value {
    let Value::Object(map) = data else {
        return data.clone();
    };

    let mut out = map.clone();

    if let Some(specs) = nodes.get("__concat__").and_then(Value::as_array) {
        for spec in specs {
            apply_concat_spec(&mut out, spec);
        }
    }

    if let Some(nodes_map) = nodes.as_object() {
        for (key, child_nodes) in nodes_map {
            if key == "__concat__" {
                continue;
            }
            if let Some(value) = out.get(key).cloned() {
                let new_value = match value {
                    Value::Object(_) => concat(&value, child_nodes),
                    Value::Array(arr) => {
                        Value::Array(arr.iter().map(|v| concat(v, child_nodes)).collect())
                    }
                    other => other,
                };
                out.insert(key.clone(), new_value);
            }
        }
    }

    Value::Object(out)
}

fn apply_concat_spec(map: &mut Map<String, Value>, spec: &Value) {
    let Some(columns) = spec.get("columns").and_then(Value::as_array) else {
        return;
    };
    let delimiter = spec.get("delimiter").and_then(Value::as_str).unwrap_or("");
    let Some(destination) = spec.get("destination").and_then(Value::as_str) else {
        return;
    };

    let values: Vec<String> = columns
        .iter()
        .filter_map(|c| {
            let column_name = c.as_str().unwrap_or_default();
            let value = map
                .get(column_name)
                .cloned()
                .unwrap_or_else(|| Value::String(column_name.to_string()));
            if is_falsy(&value) {
                None
            } else {
                Some(join_string(&value))
            }
        })
        .collect();

    map.insert(destination.to_string(), Value::String(values.join(delimiter)));
}

fn is_falsy(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

fn join_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rename_renames_scalar_key() {
        let data = json!({ "id": 1, "name": "Node A" });
        let nodes = json!({ "id": "publisher_id" });
        let renamed = rename(&data, &nodes);
        assert_eq!(renamed, json!({ "publisher_id": 1, "name": "Node A" }));
    }

    #[test]
    fn rename_recurses_into_nested_object() {
        let data = json!({ "publisher": { "id": 1 } });
        let nodes = json!({ "publisher": { "id": "publisher_id" } });
        let renamed = rename(&data, &nodes);
        assert_eq!(renamed, json!({ "publisher": { "publisher_id": 1 } }));
    }

    #[test]
    fn rename_is_idempotent_with_empty_directives() {
        let data = json!({ "a": 1, "b": [3, 1, 2] });
        let once = rename(&data, &json!({}));
        let twice = rename(&once, &json!({}));
        assert_eq!(once, twice);
        assert_eq!(once["b"], json!([1, 2, 3]));
    }

    #[test]
    fn rename_sorts_scalar_lists() {
        let data = json!({ "tags": ["c", "a", "b"] });
        let renamed = rename(&data, &json!({}));
        assert_eq!(renamed["tags"], json!(["a", "b", "c"]));
    }

    #[test]
    fn rename_leaves_heterogeneous_lists_untouched() {
        let data = json!({ "mixed": [1, "a", true] });
        let renamed = rename(&data, &json!({}));
        assert_eq!(renamed["mixed"], json!([1, "a", true]));
    }

    #[test]
    fn concat_joins_present_and_missing_columns() {
        let data = json!({ "publisher_id": 7, "is_active": true });
        let nodes = json!({
            "__concat__": [
                { "columns": ["publisher_id", "publisher_name", "is_active", "foo"],
                  "destination": "new_field", "delimiter": "-" }
            ]
        });
        let out = concat(&data, &nodes);
        // publisher_name is absent -> literal "publisher_name"; foo absent -> "foo";
        // is_active=true is truthy -> "true" kept.
        assert_eq!(out["new_field"], json!("7-publisher_name-true-foo"));
    }

    #[test]
    fn concat_filters_falsy_values() {
        let data = json!({ "a": 0, "b": "", "c": "x" });
        let nodes = json!({
            "__concat__": [
                { "columns": ["a", "b", "c"], "destination": "d", "delimiter": "," }
            ]
        });
        let out = concat(&data, &nodes);
        assert_eq!(out["d"], json!("x"));
    }

    #[test]
    fn concat_is_deterministic() {
        let data = json!({ "a": 1, "b": 2 });
        let nodes = json!({
            "__concat__": [{ "columns": ["a", "b"], "destination": "ab", "delimiter": "-" }]
        });
        assert_eq!(concat(&data, &nodes), concat(&data, &nodes));
    }
}
