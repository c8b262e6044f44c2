//! Relational data model exchanged with the storage provider
//!
//! A database state is a set of named schema objects plus, per table, a set
//! of rows keyed by primary key. The provider reports differences between two
//! states as a [`RawDiff`]; the engine writes into forks with [`Query`].
//!
//! Merge conflict detection works at the granularity defined here: a schema
//! object is identified by its name, a row by `(table, key)`.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Column name → value map, ordered for stable output
pub type Columns = BTreeMap<String, Value>;

/// Kind of schema object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchemaKind {
    /// A table (owns rows)
    Table,
    /// A column of a table, named `table.column`
    Column,
    /// An index
    Index,
    /// A view
    View,
}

impl SchemaKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::Table => "table",
            SchemaKind::Column => "column",
            SchemaKind::Index => "index",
            SchemaKind::View => "view",
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named schema element
///
/// Two objects with the same name but different `definition` or `kind` are
/// the same object, modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaObject {
    /// Unique name within the database
    pub name: String,
    /// Object kind
    pub kind: SchemaKind,
    /// Provider-specific definition (DDL text, type, expression, ...)
    pub definition: String,
}

impl SchemaObject {
    /// Create a schema object
    pub fn new(name: impl Into<String>, kind: SchemaKind, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            definition: definition.into(),
        }
    }

    /// A table object
    pub fn table(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self::new(name, SchemaKind::Table, definition)
    }

    /// A column object, named `table.column`
    pub fn column(table: &str, column: &str, definition: impl Into<String>) -> Self {
        Self::new(format!("{}.{}", table, column), SchemaKind::Column, definition)
    }

    /// An index object
    pub fn index(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self::new(name, SchemaKind::Index, definition)
    }

    /// A view object
    pub fn view(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self::new(name, SchemaKind::View, definition)
    }

    /// Check if this object is a table
    pub fn is_table(&self) -> bool {
        self.kind == SchemaKind::Table
    }
}

/// A table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Primary key
    pub key: String,
    /// Column values
    pub columns: Columns,
}

impl Row {
    /// Create an empty row with the given key
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            columns: Columns::new(),
        }
    }

    /// Builder-style column setter
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    /// Get a column value
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }
}

/// A statement executed against a live fork
///
/// `Begin` / `Commit` / `Rollback` delimit a transaction on the fork;
/// everything between them becomes visible atomically at `Commit`.
/// Statements outside a transaction apply immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    /// Open a transaction
    Begin,
    /// Commit the open transaction
    Commit,
    /// Discard the open transaction
    Rollback,
    /// Create a schema object
    CreateObject(SchemaObject),
    /// Replace an existing schema object's definition
    AlterObject(SchemaObject),
    /// Drop a schema object (dropping a table drops its rows)
    DropObject {
        /// Object name
        name: String,
    },
    /// Insert or replace a row
    Upsert {
        /// Target table
        table: String,
        /// Row to write
        row: Row,
    },
    /// Delete a row by key
    Delete {
        /// Target table
        table: String,
        /// Primary key
        key: String,
    },
    /// Read all rows of a table
    Select {
        /// Source table
        table: String,
    },
}

impl Query {
    /// Short statement name for logs and error context
    pub fn kind(&self) -> &'static str {
        match self {
            Query::Begin => "begin",
            Query::Commit => "commit",
            Query::Rollback => "rollback",
            Query::CreateObject(_) => "create",
            Query::AlterObject(_) => "alter",
            Query::DropObject { .. } => "drop",
            Query::Upsert { .. } => "upsert",
            Query::Delete { .. } => "delete",
            Query::Select { .. } => "select",
        }
    }

    /// Check if this statement mutates data or schema
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Query::CreateObject(_)
                | Query::AlterObject(_)
                | Query::DropObject { .. }
                | Query::Upsert { .. }
                | Query::Delete { .. }
        )
    }
}

/// Result of executing a [`Query`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Number of rows or objects changed
    pub rows_affected: u64,
    /// Rows returned by reads
    pub rows: Vec<Row>,
}

/// Polarity of a single change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Present only after
    Added,
    /// Present only before
    Removed,
    /// Present on both sides with different contents
    Modified,
}

fn change_kind<T>(before: &Option<T>, after: &Option<T>) -> ChangeKind {
    match (before, after) {
        (None, Some(_)) => ChangeKind::Added,
        (Some(_), None) => ChangeKind::Removed,
        _ => ChangeKind::Modified,
    }
}

/// One schema object that differs between two states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Object name
    pub name: String,
    /// Object in the "from" state
    pub before: Option<SchemaObject>,
    /// Object in the "to" state
    pub after: Option<SchemaObject>,
}

impl SchemaChange {
    /// Added, removed or modified
    pub fn kind(&self) -> ChangeKind {
        change_kind(&self.before, &self.after)
    }

    /// Kind of the object on whichever side it exists
    pub fn object_kind(&self) -> SchemaKind {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|o| o.kind)
            .unwrap_or(SchemaKind::Table)
    }

    /// The same fact seen from the other direction
    pub fn inverted(&self) -> Self {
        Self {
            name: self.name.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

/// One row that differs between two states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Table the row belongs to
    pub table: String,
    /// Primary key
    pub key: String,
    /// Row in the "from" state
    pub before: Option<Row>,
    /// Row in the "to" state
    pub after: Option<Row>,
}

impl RowChange {
    /// Added, removed or modified
    pub fn kind(&self) -> ChangeKind {
        change_kind(&self.before, &self.after)
    }

    /// The same fact seen from the other direction
    pub fn inverted(&self) -> Self {
        Self {
            table: self.table.clone(),
            key: self.key.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }
}

/// Provider-reported difference between two states (`from` → `to`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDiff {
    /// Schema objects that differ
    pub schema: Vec<SchemaChange>,
    /// Rows that differ
    pub rows: Vec<RowChange>,
}

impl RawDiff {
    /// Check if the two states were identical
    pub fn is_empty(&self) -> bool {
        self.schema.is_empty() && self.rows.is_empty()
    }

    /// Total number of changed objects and rows
    pub fn len(&self) -> usize {
        self.schema.len() + self.rows.len()
    }

    /// The diff `to` → `from`
    pub fn inverted(&self) -> Self {
        Self {
            schema: self.schema.iter().map(SchemaChange::inverted).collect(),
            rows: self.rows.iter().map(RowChange::inverted).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_builder() {
        let row = Row::new("42").with("name", "alice").with("age", 30);
        assert_eq!(row.key, "42");
        assert_eq!(row.get("name"), Some(&Value::from("alice")));
        assert_eq!(row.get("age"), Some(&Value::Int(30)));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_column_object_name() {
        let col = SchemaObject::column("users", "email", "TEXT");
        assert_eq!(col.name, "users.email");
        assert_eq!(col.kind, SchemaKind::Column);
        assert!(!col.is_table());
    }

    #[test]
    fn test_change_kinds() {
        let row = Some(Row::new("1"));
        let added = RowChange {
            table: "t".into(),
            key: "1".into(),
            before: None,
            after: row.clone(),
        };
        assert_eq!(added.kind(), ChangeKind::Added);
        assert_eq!(added.inverted().kind(), ChangeKind::Removed);

        let modified = RowChange {
            table: "t".into(),
            key: "1".into(),
            before: row.clone(),
            after: Some(Row::new("1").with("x", 1)),
        };
        assert_eq!(modified.kind(), ChangeKind::Modified);
        assert_eq!(modified.inverted().kind(), ChangeKind::Modified);
    }

    #[test]
    fn test_diff_inversion_twice_is_identity() {
        let diff = RawDiff {
            schema: vec![SchemaChange {
                name: "users".into(),
                before: None,
                after: Some(SchemaObject::table("users", "id TEXT")),
            }],
            rows: vec![RowChange {
                table: "users".into(),
                key: "1".into(),
                before: None,
                after: Some(Row::new("1").with("name", "a")),
            }],
        };
        assert_eq!(diff.inverted().inverted(), diff);
        assert_eq!(diff.len(), 2);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_query_classification() {
        assert!(!Query::Begin.is_write());
        assert!(!Query::Select { table: "t".into() }.is_write());
        assert!(Query::Delete {
            table: "t".into(),
            key: "k".into()
        }
        .is_write());
        assert_eq!(Query::DropObject { name: "t".into() }.kind(), "drop");
    }
}
