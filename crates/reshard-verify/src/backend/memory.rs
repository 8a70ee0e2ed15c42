//! In-process row source.
//!
//! Rows live in a `BTreeMap` per table, so range reads and offset probes come
//! back in key order like an indexed primary key scan. A memory database can
//! be preloaded from a JSON data file and restricted to one shard's key range,
//! which lets the whole pipeline run without a server.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DatabaseTarget, KeyRange};
use crate::config::DbConfig;
use crate::core::{Key, Row, RowSource, SqlValue, Table};
use crate::error::{Result, VerifyError};

/// Serialized form of a memory database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySnapshot {
    #[serde(default)]
    pub tables: Vec<TableData>,
}

/// One table and its rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableData {
    #[serde(flatten)]
    pub table: Table,

    #[serde(default)]
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    table: Table,
    rows: BTreeMap<Key, Vec<SqlValue>>,
}

/// A database held in memory.
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    tables: RwLock<BTreeMap<String, MemoryTable>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build from configuration, loading `data_file` if set and keeping only
    /// rows inside the addressed shard.
    pub fn from_config(config: &DbConfig, target: &DatabaseTarget) -> Result<Self> {
        let full = Self::new(config.database.clone());
        if let Some(path) = &config.data_file {
            full.load(path)?;
        }
        match &target.shard {
            Some(_) => Ok(full.filtered(config.database.clone(), &target.key_range()?)),
            None => Ok(full),
        }
    }

    /// Load tables and rows from a JSON snapshot file.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let snapshot: MemorySnapshot = serde_json::from_str(&content)?;
        let mut rows = 0;
        for data in snapshot.tables {
            self.create_table(&data.table);
            for row in data.rows {
                self.insert(&data.table.name, row.key, row.data);
                rows += 1;
            }
        }
        debug!(
            "{}: loaded {} rows from {}",
            self.name,
            rows,
            path.as_ref().display()
        );
        Ok(())
    }

    /// Current contents as a serializable snapshot.
    pub fn snapshot(&self) -> MemorySnapshot {
        let tables = self.read();
        MemorySnapshot {
            tables: tables
                .values()
                .map(|t| TableData {
                    table: t.table.clone(),
                    rows: t
                        .rows
                        .iter()
                        .map(|(k, v)| Row::new(k.clone(), v.clone()))
                        .collect(),
                })
                .collect(),
        }
    }

    /// Register an empty table. Existing rows are kept.
    pub fn create_table(&self, table: &Table) {
        self.write()
            .entry(table.name.clone())
            .or_insert_with(|| MemoryTable {
                table: table.clone(),
                rows: BTreeMap::new(),
            });
    }

    /// Insert or replace a row, creating the table if needed.
    pub fn insert(&self, table: &str, key: Key, data: Vec<SqlValue>) {
        self.write()
            .entry(table.to_string())
            .or_insert_with(|| MemoryTable {
                table: Table::new(table),
                rows: BTreeMap::new(),
            })
            .rows
            .insert(key, data);
    }

    /// Delete a row. Returns whether it existed.
    pub fn delete(&self, table: &str, key: &Key) -> bool {
        self.write()
            .get_mut(table)
            .is_some_and(|t| t.rows.remove(key).is_some())
    }

    /// Remove every row of a table, keeping the table.
    pub fn truncate(&self, table: &str) {
        if let Some(t) = self.write().get_mut(table) {
            t.rows.clear();
        }
    }

    /// Number of rows in a table (0 if it does not exist).
    pub fn row_count(&self, table: &str) -> usize {
        self.read().get(table).map_or(0, |t| t.rows.len())
    }

    /// Copy of the rows whose keys fall in `range`, under a new name.
    pub fn filtered(&self, name: impl Into<String>, range: &KeyRange) -> MemorySource {
        let tables = self
            .read()
            .iter()
            .map(|(table_name, t)| {
                let rows = t
                    .rows
                    .iter()
                    .filter(|(k, _)| range.contains_key(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (
                    table_name.clone(),
                    MemoryTable {
                        table: t.table.clone(),
                        rows,
                    },
                )
            })
            .collect();
        MemorySource {
            name: name.into(),
            tables: RwLock::new(tables),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, MemoryTable>> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, MemoryTable>> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn missing(&self, table: &str, context: &str) -> VerifyError {
        VerifyError::query(
            &self.name,
            format!("{} {}", context, table),
            format!("table '{}' does not exist", table),
            false,
        )
    }
}

#[async_trait]
impl RowSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn key_at_offset(
        &self,
        table: &Table,
        from: Option<&Key>,
        offset: usize,
    ) -> Result<Option<Key>> {
        let tables = self.read();
        let t = tables
            .get(&table.name)
            .ok_or_else(|| self.missing(&table.name, "key probe"))?;
        let lower = from.map_or(Bound::Unbounded, Bound::Included);
        Ok(t.rows
            .range::<Key, _>((lower, Bound::Unbounded))
            .nth(offset)
            .map(|(k, _)| k.clone()))
    }

    async fn read_range(
        &self,
        table: &Table,
        start: Option<&Key>,
        end: Option<&Key>,
    ) -> Result<Vec<Row>> {
        let tables = self.read();
        let t = tables
            .get(&table.name)
            .ok_or_else(|| self.missing(&table.name, "read"))?;
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Ok(Vec::new());
            }
        }
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(t.rows
            .range::<Key, _>((lower, upper))
            .map(|(k, v)| Row::new(k.clone(), v.clone()))
            .collect())
    }

    async fn estimate_rows(&self, table: &Table) -> Result<u64> {
        let tables = self.read();
        let t = tables
            .get(&table.name)
            .ok_or_else(|| self.missing(&table.name, "estimate"))?;
        Ok(t.rows.len() as u64)
    }

    async fn list_tables(&self) -> Result<Vec<Table>> {
        Ok(self
            .read()
            .values()
            .map(|t| t.table.clone().with_estimated_rows(t.rows.len() as u64))
            .collect())
    }
}
