//! Destination schema metadata for FK-aware execution.
//!
//! This module provides:
//! - Data models for tables, their columns and foreign-key references
//! - The [`SchemaSource`] service trait the executor queries once per run
//! - Dependency graph construction with post-order topological sorting

mod graph;

pub use graph::*;

use crate::error::Result;
use ahash::AHashMap;
use async_trait::async_trait;
use std::fmt;

/// Unique identifier for a table within a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

/// Schema information for a single table
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Lowercased table name without schema qualifier
    pub name: String,
    pub id: TableId,
    pub columns: Vec<String>,
    /// Tables this table references via foreign key, lowercased
    pub references: Vec<String>,
}

/// Tables, columns and FK references as reported by the destination
#[derive(Debug, Clone, Default)]
pub struct SchemaInfo {
    /// Map from lowercased table name to table ID
    tables: AHashMap<String, TableId>,
    /// Table schemas indexed by TableId
    pub table_schemas: Vec<TableInfo>,
}

impl SchemaInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get table ID by name (case-insensitive)
    pub fn get_table_id(&self, name: &str) -> Option<TableId> {
        self.tables.get(&name.to_lowercase()).copied()
    }

    pub fn table(&self, id: TableId) -> Option<&TableInfo> {
        self.table_schemas.get(id.0 as usize)
    }

    pub fn get_table(&self, name: &str) -> Option<&TableInfo> {
        self.get_table_id(name).and_then(|id| self.table(id))
    }

    /// Add a table, or return the existing one's ID
    pub fn add_table(&mut self, name: &str) -> TableId {
        let key = name.to_lowercase();
        if let Some(&id) = self.tables.get(&key) {
            return id;
        }
        let id = TableId(self.table_schemas.len() as u32);
        self.tables.insert(key.clone(), id);
        self.table_schemas.push(TableInfo {
            name: key,
            id,
            columns: Vec::new(),
            references: Vec::new(),
        });
        id
    }

    pub fn add_column(&mut self, table: &str, column: &str) {
        let id = self.add_table(table);
        let info = &mut self.table_schemas[id.0 as usize];
        let column = column.to_lowercase();
        if !info.columns.contains(&column) {
            info.columns.push(column);
        }
    }

    /// Record that `table` has a foreign key referencing `referenced`
    pub fn add_reference(&mut self, table: &str, referenced: &str) {
        let id = self.add_table(table);
        self.add_table(referenced);
        let info = &mut self.table_schemas[id.0 as usize];
        let referenced = referenced.to_lowercase();
        if !info.references.contains(&referenced) {
            info.references.push(referenced);
        }
    }

    pub fn len(&self) -> usize {
        self.table_schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table_schemas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableInfo> {
        self.table_schemas.iter()
    }
}

/// Read-only schema metadata query against the destination.
#[async_trait]
pub trait SchemaSource: Send {
    async fn schema_info(&mut self) -> Result<SchemaInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_info_is_case_insensitive() {
        let mut s = SchemaInfo::new();
        s.add_column("Orders", "ID");
        s.add_reference("orders", "Customers");
        assert_eq!(s.len(), 2);
        let orders = s.get_table("ORDERS").unwrap();
        assert_eq!(orders.columns, vec!["id"]);
        assert_eq!(orders.references, vec!["customers"]);
        assert!(s.get_table("customers").is_some());
    }

    #[test]
    fn test_duplicate_references_collapse() {
        let mut s = SchemaInfo::new();
        s.add_reference("a", "b");
        s.add_reference("a", "b");
        assert_eq!(s.get_table("a").unwrap().references.len(), 1);
    }
}
