//! Document Builder.
//!
//! Given a changed row, find every root document it affects and
//! re-materialize each from scratch by re-querying the database through
//! the schema tree. Re-querying (rather than patching the previous
//! document in place) is what gives the "last applied event's effect on
//! all reachable rows" invariant: whatever the database now says is
//! current wins, independent of how many intermediate events fired.
//!
//! ## Foreign key convention
//!
//! A child node's own table carries the foreign key column pointing at
//! its parent's primary key (the standard one-to-many shape: a `review`
//! row belongs to exactly one `book`). The column name defaults to
//! `<parent identifier>_<parent primary key>` and can be overridden per
//! node with `foreign_key` in the sync descriptor. Composite primary
//! keys are supported for `_id` derivation, but cross-table joins use
//! only the first declared primary-key column — composite-key joins are
//! out of scope (see DESIGN.md).

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tokio_postgres::Row;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

use crate::document::{BuiltDocument, BulkOp, derive_id};
use crate::error::SyncError;
use crate::model::{Operation, RowEvent, Scalar, Tuple};
use crate::schema::{NodeIndex, Relation, SchemaNode, SchemaTree};

/// Materializes built documents by joining across the schema tree.
pub struct DocumentBuilder {
    pool: deadpool_postgres::Pool,
}

impl DocumentBuilder {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }

    /// `build(event) -> list<built_document>`, widened to `BulkOp` so the
    /// root-delete-vs-rebuild decision travels with the result instead of
    /// being re-derived by the caller.
    pub async fn build(&self, tree: &SchemaTree, event: &RowEvent) -> Result<Vec<BulkOp>, SyncError> {
        let matching = tree.nodes_for_table(&event.qualified_table());
        if matching.is_empty() {
            return Ok(Vec::new());
        }

        let row = if event.new.is_empty() { &event.old } else { &event.new };

        let mut root_pks: Vec<Value> = Vec::new();
        for &node_idx in &matching {
            if let Some(pk) = self.resolve_root_pk(tree, node_idx, row).await? {
                if !root_pks.contains(&pk) {
                    root_pks.push(pk);
                }
            }
        }

        if root_pks.is_empty() {
            tracing::debug!(table = %event.qualified_table(), "no root found for changed row, dropping event");
            return Ok(Vec::new());
        }

        let root_changed_directly = matching.contains(&tree.root_index());
        let root_pk_cols: Vec<String> = if tree.root().primary_keys.is_empty() {
            vec!["id".to_string()]
        } else {
            tree.root().primary_keys.clone()
        };

        let mut ops = Vec::with_capacity(root_pks.len());
        for root_pk in root_pks {
            if event.operation == Operation::Delete && root_changed_directly {
                // The event's own old-tuple already carries every
                // primary-key column (data-model invariant for
                // UPDATE/DELETE), so the full composite key is read
                // straight from `row` rather than from the single
                // first-column `root_pk` the parent walk produces.
                let pk_values: Vec<(String, Value)> = root_pk_cols
                    .iter()
                    .map(|col| (col.clone(), row.get(col).map(Scalar::to_json).unwrap_or(Value::Null)))
                    .collect();
                let id = derive_id(&pk_values);
                ops.push(BulkOp::delete(id, tree.index.clone()));
                continue;
            }

            match self.materialize_root(tree, &root_pk).await? {
                Some((id, source)) => ops.push(BulkOp::index(BuiltDocument { id, index: tree.index.clone(), source })),
                None => {
                    tracing::debug!("root row vanished before rebuild, dropping event");
                }
            }
        }

        Ok(ops)
    }

    /// Walk from `start` up to the schema tree's root, following foreign
    /// keys, to find the affected root's primary-key value. Each hop is
    /// one-to-one (a child row has exactly one parent), so at most one
    /// root id comes out; `None` means a dangling reference, and the
    /// caller drops the event with a debug log.
    async fn resolve_root_pk(&self, tree: &SchemaTree, start: NodeIndex, row: &Tuple) -> Result<Option<Value>, SyncError> {
        if start == tree.root_index() {
            let pk_col = tree.root().primary_keys.first().map(String::as_str).unwrap_or("id");
            return Ok(row.get(pk_col).map(Scalar::to_json));
        }

        let node = tree.node(start);
        let parent_idx = tree.parent(start).expect("non-root schema node has a parent");
        let parent = tree.node(parent_idx);
        let fk_col = node.foreign_key_column(parent);

        let mut fk_value = row.get(&fk_col).map(Scalar::to_json);
        if fk_value.is_none() {
            // old-tuple on a DELETE may carry only the primary key
            // (REPLICA IDENTITY DEFAULT) -- look the fk value up.
            let own_pk = node.primary_keys.first().map(String::as_str).unwrap_or("id");
            if let Some(own_pk_value) = row.get(own_pk).map(Scalar::to_json) {
                fk_value = self.fetch_column(&node.table, own_pk, &own_pk_value, &fk_col).await?;
            }
        }

        let Some(mut cur_value) = fk_value else { return Ok(None) };
        if cur_value.is_null() {
            return Ok(None);
        }

        let mut cur_idx = parent_idx;
        while cur_idx != tree.root_index() {
            let cur_node = tree.node(cur_idx);
            let next_parent_idx = tree.parent(cur_idx).expect("non-root schema node has a parent");
            let next_parent = tree.node(next_parent_idx);
            let next_fk_col = cur_node.foreign_key_column(next_parent);
            let own_pk = cur_node.primary_keys.first().map(String::as_str).unwrap_or("id");

            match self.fetch_column(&cur_node.table, own_pk, &cur_value, &next_fk_col).await? {
                Some(v) if !v.is_null() => {
                    cur_value = v;
                    cur_idx = next_parent_idx;
                }
                _ => return Ok(None),
            }
        }

        Ok(Some(cur_value))
    }

    async fn fetch_column(&self, table: &str, pk_col: &str, pk_value: &Value, want_col: &str) -> Result<Option<Value>, SyncError> {
        let client = self.pool.get().await.map_err(|e| SyncError::Build(format!("connection pool checkout failed: {e}")))?;
        let sql = format!("SELECT {want_col} FROM {table} WHERE {pk_col} = $1");
        let param = json_to_sql_param(pk_value);
        let row = client
            .query_opt(&sql, &[&param])
            .await
            .map_err(|e| SyncError::Build(format!("parent-join query on {table} failed: {e}")))?;
        Ok(row.map(|r| value_from_row(&r, 0)))
    }

    /// Full scan of every root row, materializing one document each —
    /// the coordinator's bootstrap state: for each root, full query and
    /// bulk index.
    pub async fn bootstrap(&self, tree: &SchemaTree) -> Result<Vec<BulkOp>, SyncError> {
        let root = tree.root();
        let pk_col = root.primary_keys.first().map(String::as_str).unwrap_or("id");

        let rows = {
            let client = self.pool.get().await.map_err(|e| SyncError::Build(format!("connection pool checkout failed: {e}")))?;
            let sql = format!("SELECT {pk_col} FROM {} ORDER BY {pk_col}", root.table);
            client
                .query(&sql, &[])
                .await
                .map_err(|e| SyncError::Build(format!("bootstrap scan of {} failed: {e}", root.table)))?
        };

        let mut ops = Vec::with_capacity(rows.len());
        for row in &rows {
            let pk_value = value_from_row(row, 0);
            if let Some((id, source)) = self.materialize_root(tree, &pk_value).await? {
                ops.push(BulkOp::index(BuiltDocument { id, index: tree.index.clone(), source }));
            }
        }
        Ok(ops)
    }

    /// Steps 3-4: re-query the root row, then recursively assemble every
    /// child subtree into a single nested JSON object.
    async fn materialize_root(&self, tree: &SchemaTree, root_pk: &Value) -> Result<Option<(String, Value)>, SyncError> {
        let root = tree.root();
        let pk_col = root.primary_keys.first().map(String::as_str).unwrap_or("id");

        let client = self.pool.get().await.map_err(|e| SyncError::Build(format!("connection pool checkout failed: {e}")))?;
        let sql = format!("SELECT {} FROM {} WHERE {pk_col} = $1", select_clause(root), root.table);
        let param = json_to_sql_param(root_pk);
        let Some(row) = client
            .query_opt(&sql, &[&param])
            .await
            .map_err(|e| SyncError::Build(format!("root query on {} failed: {e}", root.table)))?
        else {
            return Ok(None);
        };

        let mut obj = row_to_object(&row);

        for &child_idx in tree.children(tree.root_index()) {
            if let Some(value) = self.materialize_children(tree, child_idx, root_pk.clone()).await? {
                obj.insert(tree.node(child_idx).identifier().to_string(), value);
            }
        }

        // `_id` derives from the root's full primary-key tuple (spec §3),
        // not just the single column `resolve_root_pk`/the join path used
        // to look this row up — a composite key needs every column's
        // value serialized in declared order.
        let pk_cols: Vec<&str> = if root.primary_keys.is_empty() {
            vec![pk_col]
        } else {
            root.primary_keys.iter().map(String::as_str).collect()
        };
        let pk_values: Vec<(String, Value)> = pk_cols
            .into_iter()
            .map(|col| {
                let value = obj
                    .get(col)
                    .cloned()
                    .unwrap_or_else(|| if col == pk_col { root_pk.clone() } else { Value::Null });
                (col.to_string(), value)
            })
            .collect();
        let id = derive_id(&pk_values);
        Ok(Some((id, Value::Object(obj))))
    }

    /// Step 3 continued: rows of `node_idx` whose foreign key matches
    /// `parent_pk`, each with its own children assembled recursively.
    /// Returns `None` when there are no matching rows, so the caller can
    /// leave the key absent rather than writing a `null` sentinel.
    fn materialize_children<'a>(
        &'a self,
        tree: &'a SchemaTree,
        node_idx: NodeIndex,
        parent_pk: Value,
    ) -> futures_util::future::BoxFuture<'a, Result<Option<Value>, SyncError>> {
        Box::pin(async move {
            let node = tree.node(node_idx);
            let parent = tree.node(tree.parent(node_idx).expect("child node has a parent"));
            let fk_col = node.foreign_key_column(parent);
            let pk_col = node.primary_keys.first().map(String::as_str).unwrap_or("id").to_string();

            let client = self.pool.get().await.map_err(|e| SyncError::Build(format!("connection pool checkout failed: {e}")))?;
            let sql = format!(
                "SELECT {} FROM {} WHERE {fk_col} = $1 ORDER BY {pk_col}",
                select_clause(node),
                node.table
            );
            let param = json_to_sql_param(&parent_pk);
            let rows = client
                .query(&sql, &[&param])
                .await
                .map_err(|e| SyncError::Build(format!("child query on {} failed: {e}", node.table)))?;

            if rows.is_empty() {
                return Ok(None);
            }

            let mut items = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut obj = row_to_object(row);
                let this_pk = obj.get(&pk_col).cloned().unwrap_or(Value::Null);

                for &grandchild_idx in tree.children(node_idx) {
                    if let Some(value) = self.materialize_children(tree, grandchild_idx, this_pk.clone()).await? {
                        obj.insert(tree.node(grandchild_idx).identifier().to_string(), value);
                    }
                }

                items.push(Value::Object(obj));
            }

            match node.relation {
                Relation::Object => Ok(items.into_iter().next()),
                Relation::Array => Ok(Some(Value::Array(items))),
            }
        })
    }
}

/// `columns` from the schema if declared (always including the primary
/// key, needed for joins even when the user didn't ask for it back),
/// else every column.
fn select_clause(node: &SchemaNode) -> String {
    if node.columns.is_empty() {
        return "*".to_string();
    }
    let mut cols = node.columns.clone();
    for pk in &node.primary_keys {
        if !cols.contains(pk) {
            cols.push(pk.clone());
        }
    }
    cols.join(", ")
}

fn row_to_object(row: &Row) -> Map<String, Value> {
    let mut map = Map::new();
    for (idx, col) in row.columns().iter().enumerate() {
        map.insert(col.name().to_string(), value_from_row(row, idx));
    }
    map
}

fn value_from_row(row: &Row, idx: usize) -> Value {
    match row.columns()[idx].type_().name() {
        "int2" => row.get::<_, Option<i16>>(idx).map(Value::from).unwrap_or(Value::Null),
        "int4" | "oid" => row.get::<_, Option<i32>>(idx).map(Value::from).unwrap_or(Value::Null),
        "int8" => row.get::<_, Option<i64>>(idx).map(Value::from).unwrap_or(Value::Null),
        "bool" => row.get::<_, Option<bool>>(idx).map(Value::from).unwrap_or(Value::Null),
        "float4" => row
            .get::<_, Option<f32>>(idx)
            .and_then(|f| serde_json::Number::from_f64(f as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "float8" => row
            .get::<_, Option<f64>>(idx)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "numeric" => row
            .get::<_, Option<Decimal>>(idx)
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        "json" | "jsonb" => row.get::<_, Option<Value>>(idx).unwrap_or(Value::Null),
        "timestamp" => row
            .get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|t| Value::from(t.to_string()))
            .unwrap_or(Value::Null),
        "timestamptz" => row
            .get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|t| Value::from(t.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => row.get::<_, Option<String>>(idx).map(Value::from).unwrap_or(Value::Null),
    }
}

/// A JSON scalar boxed so it can be passed as a `tokio_postgres` bind
/// parameter without knowing the target column's wire type ahead of
/// time — the driver negotiates it from the prepared statement.
#[derive(Debug, Clone)]
enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn json_to_sql_param(v: &Value) -> SqlParam {
    match v {
        Value::Null => SqlParam::Null,
        Value::Bool(b) => SqlParam::Bool(*b),
        Value::Number(n) => n.as_i64().map(SqlParam::Int).unwrap_or_else(|| SqlParam::Float(n.as_f64().unwrap_or_default())),
        Value::String(s) => SqlParam::Text(s.clone()),
        other => SqlParam::Text(other.to_string()),
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self, ty: &Type, out: &mut bytes::BytesMut) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Bool(b) => b.to_sql(ty, out),
            SqlParam::Int(i) => i.to_sql(ty, out),
            SqlParam::Float(f) => f.to_sql(ty, out),
            SqlParam::Text(s) => s.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_clause_includes_primary_key_even_if_not_declared() {
        let node = SchemaNode {
            table: "book".into(),
            label: None,
            columns: vec!["title".into()],
            primary_keys: vec!["id".into()],
            transform: Default::default(),
            relation: Relation::Array,
            foreign_key: None,
            parent: None,
            children: vec![],
        };
        assert_eq!(select_clause(&node), "title, id");
    }

    #[test]
    fn select_clause_is_star_when_no_columns_declared() {
        let node = SchemaNode {
            table: "book".into(),
            label: None,
            columns: vec![],
            primary_keys: vec!["id".into()],
            transform: Default::default(),
            relation: Relation::Array,
            foreign_key: None,
            parent: None,
            children: vec![],
        };
        assert_eq!(select_clause(&node), "*");
    }

    #[test]
    fn json_to_sql_param_classifies_scalars() {
        assert!(matches!(json_to_sql_param(&Value::from(1)), SqlParam::Int(1)));
        assert!(matches!(json_to_sql_param(&Value::Null), SqlParam::Null));
        assert!(matches!(json_to_sql_param(&Value::from("x")), SqlParam::Text(_)));
    }
}
