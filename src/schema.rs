//! Schema Tree.
//!
//! In-memory representation of the user's nested parent/child join graph,
//! built once from the sync-descriptor JSON and immutable for the process
//! lifetime: a plain arena of nodes addressed by index rather than
//! reference-counted pointers, so there's no way to build a cycle and no
//! shared mutable global to reach for.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::SyncError;

/// Declarative rename/concat transform directives attached to a node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformSpec {
    #[serde(default)]
    pub rename: HashMap<String, Value>,
    #[serde(default)]
    pub concat: Vec<ConcatSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcatSpec {
    pub columns: Vec<String>,
    pub destination: String,
    #[serde(default)]
    pub delimiter: String,
}

/// Raw JSON shape of one node, as it appears in the sync-descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNode {
    pub table: String,
    pub label: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    pub primary_key: Option<Vec<String>>,
    #[serde(default)]
    pub children: Vec<RawNode>,
    pub transform: Option<TransformSpec>,
    /// How a child nests into its parent's document: a single embedded
    /// object (one-to-one/many-to-one) or an array of rows (one-to-many).
    /// Defaults to `array`, the common case. Not present on the root.
    pub relation: Option<Relation>,
    /// Column on this node's own table holding the foreign key back to
    /// the parent's primary key. Defaults to the naming convention
    /// `<parent identifier>_<parent primary key>` (e.g. `book_id`) when
    /// omitted.
    pub foreign_key: Option<String>,
}

/// Nesting multiplicity of a child node in its parent's built document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    #[default]
    Array,
    Object,
}

/// Index into [`SchemaTree`]'s node arena.
pub type NodeIndex = usize;

/// One node in the schema tree: a joined table plus its own transform
/// directives and the indices of its children in the arena.
#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub table: String,
    pub label: Option<String>,
    pub columns: Vec<String>,
    pub primary_keys: Vec<String>,
    pub transform: TransformSpec,
    pub relation: Relation,
    pub foreign_key: Option<String>,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
}

impl SchemaNode {
    /// A node's identity within its parent: label if present, else table.
    pub fn identifier(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.table)
    }

    /// The foreign-key column on this node's own table that references
    /// its parent's primary key, per convention unless overridden.
    pub fn foreign_key_column(&self, parent: &SchemaNode) -> String {
        if let Some(explicit) = &self.foreign_key {
            return explicit.clone();
        }
        let parent_pk = parent.primary_keys.first().map(String::as_str).unwrap_or("id");
        if parent_pk == "id" {
            format!("{}_id", parent.identifier())
        } else {
            format!("{}_{parent_pk}", parent.identifier())
        }
    }
}

/// The full schema tree for one sync descriptor.
#[derive(Debug, Clone)]
pub struct SchemaTree {
    pub index: String,
    pub database: Option<String>,
    nodes: Vec<SchemaNode>,
    root: NodeIndex,
}

impl SchemaTree {
    /// Build a schema tree from a sync-descriptor JSON document.
    ///
    /// Rejects the legacy shape where `nodes` is a JSON array — that
    /// signals a config still in the pre-v2 schema shape.
    pub fn from_document(doc: &Value) -> Result<Self, SyncError> {
        let index = doc
            .get("index")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Config("missing required field: index".to_string()))?
            .to_string();
        let database = doc.get("database").and_then(Value::as_str).map(str::to_string);

        let nodes_value = doc
            .get("nodes")
            .ok_or_else(|| SyncError::Config("missing required field: nodes".to_string()))?;

        if nodes_value.is_array() {
            return Err(SyncError::Schema(
                "Incompatible schema. Please run v2 schema migration".to_string(),
            ));
        }

        let raw_root: RawNode = serde_json::from_value(nodes_value.clone())
            .map_err(|e| SyncError::Config(format!("invalid node shape: {e}")))?;

        let mut nodes = Vec::new();
        let root = build_node(&mut nodes, raw_root, None)?;
        check_no_duplicate_identifiers(&nodes, root)?;

        Ok(Self { index, database, nodes, root })
    }

    pub fn root(&self) -> &SchemaNode {
        &self.nodes[self.root]
    }

    pub fn root_index(&self) -> NodeIndex {
        self.root
    }

    pub fn node(&self, idx: NodeIndex) -> &SchemaNode {
        &self.nodes[idx]
    }

    pub fn children(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.nodes[idx].children
    }

    pub fn parent(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.nodes[idx].parent
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node indices whose (schema, table) matches the given qualified
    /// table name — the first step in mapping a decoded row event back to
    /// the node(s) of the tree it affects.
    pub fn nodes_for_table(&self, schema_qualified_table: &str) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.table == schema_qualified_table || table_name(&n.table) == schema_qualified_table)
            .map(|(i, _)| i)
            .collect()
    }

    /// Walk from `idx` up to the root, returning the path root-first.
    pub fn path_to_root(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut path = vec![idx];
        let mut cur = idx;
        while let Some(p) = self.nodes[cur].parent {
            path.push(p);
            cur = p;
        }
        path.reverse();
        path
    }

    /// Fill in primary keys for any node that didn't declare `primary_key`
    /// explicitly, by discovering them from catalog metadata. Idempotent:
    /// nodes that already have a declared primary key are left untouched.
    pub async fn resolve_primary_keys(&mut self, pool: &deadpool_postgres::Pool) -> Result<(), SyncError> {
        for node in &mut self.nodes {
            if node.primary_keys.is_empty() {
                node.primary_keys = discover_primary_keys(pool, &node.table).await?;
            }
        }
        Ok(())
    }

    /// Gather transform directives of a given kind across the tree, keyed
    /// at each level by child identifier. A parent's own directives appear
    /// at the top level; children with no directives at any depth are
    /// elided.
    pub fn transform_subtree(&self, idx: NodeIndex, kind: TransformKind) -> Value {
        self.transform_subtree_inner(idx, kind)
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    fn transform_subtree_inner(&self, idx: NodeIndex, kind: TransformKind) -> Option<Value> {
        let node = &self.nodes[idx];
        let mut out = serde_json::Map::new();

        match kind {
            TransformKind::Rename => {
                for (k, v) in &node.transform.rename {
                    out.insert(k.clone(), v.clone());
                }
            }
            TransformKind::Concat => {
                if !node.transform.concat.is_empty() {
                    let arr: Vec<Value> = node
                        .transform
                        .concat
                        .iter()
                        .map(|c| {
                            serde_json::json!({
                                "columns": c.columns,
                                "destination": c.destination,
                                "delimiter": c.delimiter,
                            })
                        })
                        .collect();
                    // concat directives at this level live under a
                    // reserved "__concat__" key; children are nested by
                    // identifier exactly like rename.
                    out.insert("__concat__".to_string(), Value::Array(arr));
                }
            }
        }

        for &child in &node.children {
            if let Some(child_node) = self.transform_subtree_inner(child, kind) {
                out.insert(self.nodes[child].identifier().to_string(), child_node);
            }
        }

        if out.is_empty() { None } else { Some(Value::Object(out)) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Rename,
    Concat,
}

fn table_name(qualified: &str) -> &str {
    qualified.split_once('.').map(|(_, t)| t).unwrap_or(qualified)
}

/// Look up a table's primary-key columns, in declared key order, via
/// `pg_index`/`pg_attribute`. A table with no primary key yields an empty
/// list — callers fall back to the `id` naming convention in that case.
async fn discover_primary_keys(pool: &deadpool_postgres::Pool, table: &str) -> Result<Vec<String>, SyncError> {
    let client = pool
        .get()
        .await
        .map_err(|e| SyncError::Schema(format!("connection pool checkout failed while resolving primary keys: {e}")))?;

    let rows = client
        .query(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = $1::regclass AND i.indisprimary \
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&table],
        )
        .await
        .map_err(|e| SyncError::Schema(format!("discovering primary key for {table} failed: {e}")))?;

    Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
}

fn build_node(
    nodes: &mut Vec<SchemaNode>,
    raw: RawNode,
    parent: Option<NodeIndex>,
) -> Result<NodeIndex, SyncError> {
    let idx = nodes.len();
    nodes.push(SchemaNode {
        table: raw.table.clone(),
        label: raw.label.clone(),
        columns: raw.columns.clone(),
        primary_keys: raw.primary_key.clone().unwrap_or_default(),
        transform: raw.transform.clone().unwrap_or_default(),
        relation: raw.relation.unwrap_or_default(),
        foreign_key: raw.foreign_key.clone(),
        parent,
        children: Vec::new(),
    });

    for child in raw.children {
        let child_idx = build_node(nodes, child, Some(idx))?;
        nodes[idx].children.push(child_idx);
    }

    Ok(idx)
}

/// A child's identity within its parent must be unique — reject
/// ambiguous (label-or-table) collisions early rather than silently
/// shadowing a sibling in the output document.
fn check_no_duplicate_identifiers(nodes: &[SchemaNode], root: NodeIndex) -> Result<(), SyncError> {
    fn visit(nodes: &[SchemaNode], idx: NodeIndex) -> Result<(), SyncError> {
        let mut seen = std::collections::HashSet::new();
        for &child in &nodes[idx].children {
            let id = nodes[child].identifier();
            if !seen.insert(id.to_string()) {
                return Err(SyncError::Config(format!(
                    "duplicate child identifier '{id}' under node '{}'",
                    nodes[idx].identifier()
                )));
            }
            visit(nodes, child)?;
        }
        Ok(())
    }
    visit(nodes, root)
}
