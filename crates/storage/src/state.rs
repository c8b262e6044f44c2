//! In-memory database state
//!
//! Every statement is validated before it mutates anything, so a failed
//! statement leaves the state untouched.

use std::collections::{BTreeMap, BTreeSet};
use timelines_core::{
    ProviderError, ProviderResult, Query, QueryResult, RawDiff, Row, RowChange, SchemaChange,
    SchemaKind, SchemaObject,
};

/// Schema objects plus rows, keyed for deterministic iteration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseState {
    schema: BTreeMap<String, SchemaObject>,
    tables: BTreeMap<String, BTreeMap<String, Row>>,
}

impl DatabaseState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a schema object by name
    pub fn schema_object(&self, name: &str) -> Option<&SchemaObject> {
        self.schema.get(name)
    }

    /// Look up a row
    pub fn row(&self, table: &str, key: &str) -> Option<&Row> {
        self.tables.get(table).and_then(|rows| rows.get(key))
    }

    /// All rows of a table, ordered by key
    pub fn rows(&self, table: &str) -> Vec<&Row> {
        self.tables
            .get(table)
            .map(|rows| rows.values().collect())
            .unwrap_or_default()
    }

    /// Names of all tables
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Total number of rows across tables
    pub fn row_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    fn require_table(&self, table: &str) -> ProviderResult<()> {
        match self.schema.get(table) {
            Some(obj) if obj.kind == SchemaKind::Table => Ok(()),
            _ => Err(ProviderError::permanent(format!(
                "table '{}' does not exist",
                table
            ))),
        }
    }

    /// Apply a data or schema statement
    ///
    /// Transaction control (`Begin`/`Commit`/`Rollback`) belongs to the
    /// provider, not to a state, and is rejected here.
    pub fn apply(&mut self, query: &Query) -> ProviderResult<QueryResult> {
        match query {
            Query::CreateObject(obj) => {
                if self.schema.contains_key(&obj.name) {
                    return Err(ProviderError::permanent(format!(
                        "object '{}' already exists",
                        obj.name
                    )));
                }
                if obj.kind == SchemaKind::Column {
                    let table = obj.name.split('.').next().unwrap_or_default();
                    self.require_table(table)?;
                }
                if obj.is_table() {
                    self.tables.insert(obj.name.clone(), BTreeMap::new());
                }
                self.schema.insert(obj.name.clone(), obj.clone());
                Ok(affected(1))
            }
            Query::AlterObject(obj) => {
                let existing = self.schema.get(&obj.name).ok_or_else(|| {
                    ProviderError::permanent(format!("object '{}' does not exist", obj.name))
                })?;
                if existing.kind != obj.kind {
                    return Err(ProviderError::permanent(format!(
                        "cannot change '{}' from {} to {}",
                        obj.name, existing.kind, obj.kind
                    )));
                }
                self.schema.insert(obj.name.clone(), obj.clone());
                Ok(affected(1))
            }
            Query::DropObject { name } => {
                let removed = self.schema.remove(name).ok_or_else(|| {
                    ProviderError::permanent(format!("object '{}' does not exist", name))
                })?;
                let mut count = 1;
                if removed.is_table() {
                    self.tables.remove(name);
                    // Columns belong to their table
                    let prefix = format!("{}.", name);
                    let before = self.schema.len();
                    self.schema
                        .retain(|n, o| !(o.kind == SchemaKind::Column && n.starts_with(&prefix)));
                    count += (before - self.schema.len()) as u64;
                }
                Ok(affected(count))
            }
            Query::Upsert { table, row } => {
                self.require_table(table)?;
                if row.key.is_empty() {
                    return Err(ProviderError::permanent("row key cannot be empty"));
                }
                self.tables
                    .entry(table.clone())
                    .or_default()
                    .insert(row.key.clone(), row.clone());
                Ok(affected(1))
            }
            Query::Delete { table, key } => {
                self.require_table(table)?;
                let removed = self
                    .tables
                    .get_mut(table)
                    .and_then(|rows| rows.remove(key))
                    .is_some();
                Ok(affected(u64::from(removed)))
            }
            Query::Select { table } => {
                self.require_table(table)?;
                Ok(QueryResult {
                    rows_affected: 0,
                    rows: self.rows(table).into_iter().cloned().collect(),
                })
            }
            Query::Begin | Query::Commit | Query::Rollback => Err(ProviderError::permanent(
                format!("'{}' is not a data statement", query.kind()),
            )),
        }
    }

    /// Compute the difference `self` → `to`
    pub fn diff(&self, to: &DatabaseState) -> RawDiff {
        let mut diff = RawDiff::default();

        let names: BTreeSet<&String> = self.schema.keys().chain(to.schema.keys()).collect();
        for name in names {
            let before = self.schema.get(name);
            let after = to.schema.get(name);
            if before != after {
                diff.schema.push(SchemaChange {
                    name: name.clone(),
                    before: before.cloned(),
                    after: after.cloned(),
                });
            }
        }

        let empty = BTreeMap::new();
        let tables: BTreeSet<&String> = self.tables.keys().chain(to.tables.keys()).collect();
        for table in tables {
            let rows_a = self.tables.get(table).unwrap_or(&empty);
            let rows_b = to.tables.get(table).unwrap_or(&empty);
            let keys: BTreeSet<&String> = rows_a.keys().chain(rows_b.keys()).collect();
            for key in keys {
                let before = rows_a.get(key);
                let after = rows_b.get(key);
                if before != after {
                    diff.rows.push(RowChange {
                        table: table.clone(),
                        key: key.clone(),
                        before: before.cloned(),
                        after: after.cloned(),
                    });
                }
            }
        }

        diff
    }
}

fn affected(n: u64) -> QueryResult {
    QueryResult {
        rows_affected: n,
        rows: Vec::new(),
    }
}
