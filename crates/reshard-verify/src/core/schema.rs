//! Table identity used by chunking and reading.

use serde::{Deserialize, Serialize};

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,

    /// Primary key column names, in key order.
    #[serde(default = "default_key_columns")]
    pub key_columns: Vec<String>,

    /// Data columns to compare. Empty means every column.
    #[serde(default)]
    pub columns: Vec<String>,

    /// Approximate row count (for logging and metrics only).
    #[serde(default)]
    pub estimated_rows: u64,
}

impl Table {
    /// Create a table keyed on a single `id` column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_columns: default_key_columns(),
            columns: Vec::new(),
            estimated_rows: 0,
        }
    }

    /// Set the primary key columns.
    pub fn with_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict comparison to the given data columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the estimated row count.
    pub fn with_estimated_rows(mut self, rows: u64) -> Self {
        self.estimated_rows = rows;
        self
    }

    /// Check if the table has a single-column primary key.
    pub fn has_single_key(&self) -> bool {
        self.key_columns.len() == 1
    }
}

fn default_key_columns() -> Vec<String> {
    vec!["id".to_string()]
}
