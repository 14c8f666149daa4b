//! Hierarchical normalizer.
//!
//! Turns one nested document into a set of flat tables. The records found
//! at the root path form the base table. Every repeated structure below a
//! record becomes a child table named by its dotted path, and every row of
//! a child table carries the key columns of the record it descends from.
//! Nested mappings that are not repeated flatten into dotted columns of the
//! row that contains them.

pub mod dates;
mod table;

pub use dates::{ColumnData, TypedColumn, TypedTable, coerce_dates};
pub use table::FlatTable;

use indexmap::IndexMap;
use snafu::prelude::*;

use crate::error::{RootNotRecordsSnafu, RootPathEmptySnafu, RootSegmentMissingSnafu, SchemaError};
use crate::source::{Node, RawDocument};

/// Tables of one document, keyed by table name in discovery order.
pub type NormalizedTables = IndexMap<String, FlatTable>;

/// Key column values carried down the tree, in key column order.
type Keys = Vec<(String, String)>;

/// One row under construction; later writes to a column win.
type Row = IndexMap<String, Option<String>>;

/// Normalizes documents that share one root path and key set.
#[derive(Debug, Clone)]
pub struct Normalizer {
    root_path: Vec<String>,
    key_columns: Vec<String>,
}

impl Normalizer {
    pub fn new(root_path: Vec<String>, key_columns: Vec<String>) -> Self {
        Self {
            root_path,
            key_columns,
        }
    }

    /// Name of the base table: the last root path segment.
    pub fn base_table(&self) -> Option<&str> {
        self.root_path.last().map(String::as_str)
    }

    /// Normalize one document.
    ///
    /// Fails only when the root path does not resolve to records. A root
    /// path ending at a single mapping yields a one-row base table.
    pub fn normalize(&self, document: &RawDocument) -> Result<NormalizedTables, SchemaError> {
        let base = self.base_table().context(RootPathEmptySnafu)?;

        let mut current = &document.root;
        for (depth, segment) in self.root_path.iter().enumerate() {
            current = current
                .as_map()
                .and_then(|fields| fields.get(segment))
                .with_context(|| RootSegmentMissingSnafu {
                    segment: segment.clone(),
                    path: self.root_path[..depth].join("."),
                })?;
        }

        let records: &[Node] = match current {
            Node::Seq(items) => items,
            Node::Map(_) => std::slice::from_ref(current),
            Node::Null | Node::Scalar(_) => {
                return RootNotRecordsSnafu {
                    path: self.root_path.join("."),
                }
                .fail();
            }
        };

        let mut builders = IndexMap::new();
        self.walk_records(base, base, records, &Vec::new(), &mut builders);

        Ok(builders
            .into_iter()
            .map(|(name, rows)| {
                let table = self.coalesce(&name, rows);
                (name, table)
            })
            .collect())
    }

    /// Append `records` to `table`, recursing into their child tables.
    ///
    /// `leaf` names the column used when the records are bare scalars.
    fn walk_records(
        &self,
        table: &str,
        leaf: &str,
        records: &[Node],
        inherited: &Keys,
        builders: &mut IndexMap<String, Vec<Row>>,
    ) {
        for record in records {
            match record {
                Node::Map(fields) => self.walk_record(table, fields, inherited, builders),
                Node::Scalar(value) => {
                    let mut row = key_row(inherited);
                    row.entry(leaf.to_string())
                        .or_insert_with(|| Some(value.clone()));
                    builders.entry(table.to_string()).or_default().push(row);
                }
                Node::Seq(items) => self.walk_records(table, leaf, items, inherited, builders),
                Node::Null => {}
            }
        }
    }

    fn walk_record(
        &self,
        table: &str,
        fields: &IndexMap<String, Node>,
        inherited: &Keys,
        builders: &mut IndexMap<String, Vec<Row>>,
    ) {
        let mut cells = Row::new();
        let mut children = Vec::new();
        flatten(fields, "", &mut cells, &mut children);

        let keys = self.resolve_keys(inherited, &cells);

        let mut row = key_row(&keys);
        for (column, value) in cells {
            // Key columns hold the propagated value, never a local one.
            if !row.contains_key(&column) {
                row.insert(column, value);
            }
        }
        builders.entry(table.to_string()).or_default().push(row);

        for child in children {
            let child_table = format!("{table}.{}", child.path);
            self.walk_records(&child_table, child.leaf, child.items, &keys, builders);
        }
    }

    /// Inherited keys, plus key columns first present on this row.
    fn resolve_keys(&self, inherited: &Keys, cells: &Row) -> Keys {
        self.key_columns
            .iter()
            .filter_map(|key| {
                inherited
                    .iter()
                    .find(|(name, _)| name == key)
                    .map(|(_, value)| value.clone())
                    .or_else(|| cells.get(key).cloned().flatten())
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }

    /// Fix the column set of a table and pad missing cells with nulls.
    ///
    /// Key columns come first in key order, then the rest in first-seen order.
    fn coalesce(&self, name: &str, rows: Vec<Row>) -> FlatTable {
        let mut seen: IndexMap<&str, ()> = IndexMap::new();
        for row in &rows {
            for column in row.keys() {
                seen.entry(column.as_str()).or_default();
            }
        }

        let mut columns: Vec<String> = self
            .key_columns
            .iter()
            .filter(|key| seen.contains_key(key.as_str()))
            .cloned()
            .collect();
        columns.extend(
            seen.keys()
                .filter(|column| !self.key_columns.iter().any(|key| key == *column))
                .map(|column| column.to_string()),
        );

        let rows = rows
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .map(|column| row.swap_remove(column).flatten())
                    .collect()
            })
            .collect();

        FlatTable {
            name: name.to_string(),
            columns,
            rows,
        }
    }
}

struct Child<'a> {
    path: String,
    leaf: &'a str,
    items: &'a [Node],
}

fn key_row(keys: &Keys) -> Row {
    keys.iter()
        .map(|(name, value)| (name.clone(), Some(value.clone())))
        .collect()
}

/// Flatten nested mappings into dotted columns and collect sequences.
fn flatten<'a>(
    fields: &'a IndexMap<String, Node>,
    prefix: &str,
    cells: &mut Row,
    children: &mut Vec<Child<'a>>,
) {
    for (name, value) in fields {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            Node::Null => {
                cells.insert(path, None);
            }
            Node::Scalar(text) => {
                cells.insert(path, Some(text.clone()));
            }
            Node::Map(nested) => flatten(nested, &path, cells, children),
            Node::Seq(items) => children.push(Child {
                path,
                leaf: name,
                items,
            }),
        }
    }
}
