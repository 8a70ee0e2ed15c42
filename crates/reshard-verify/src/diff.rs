//! Row-level differences and the merge comparison that finds them.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Row;

/// What a downstream tool would have to do to the target to fix a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Row exists only in the source.
    Insert,
    /// Row exists on both sides with different content.
    Update,
    /// Row exists only in the target.
    Delete,
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffKind::Insert => write!(f, "insert"),
            DiffKind::Update => write!(f, "update"),
            DiffKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single row difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub kind: DiffKind,
    pub table: String,

    /// Source row for inserts and updates, target row for deletes.
    pub row: Row,

    /// Current target row, for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Row>,
}

impl Diff {
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Self {
            kind: DiffKind::Insert,
            table: table.into(),
            row,
            target: None,
        }
    }

    pub fn update(table: impl Into<String>, source: Row, target: Row) -> Self {
        Self {
            kind: DiffKind::Update,
            table: table.into(),
            row: source,
            target: Some(target),
        }
    }

    pub fn delete(table: impl Into<String>, row: Row) -> Self {
        Self {
            kind: DiffKind::Delete,
            table: table.into(),
            row,
            target: None,
        }
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind, self.table, self.row.key)
    }
}

/// Diff counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl DiffCounts {
    /// Count one diff.
    pub fn record(&mut self, kind: DiffKind) {
        match kind {
            DiffKind::Insert => self.inserts += 1,
            DiffKind::Update => self.updates += 1,
            DiffKind::Delete => self.deletes += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }

    pub fn has_differences(&self) -> bool {
        self.total() > 0
    }

    /// Merge counts from another table or chunk.
    pub fn merge(&mut self, other: DiffCounts) {
        self.inserts += other.inserts;
        self.updates += other.updates;
        self.deletes += other.deletes;
    }
}

/// Compare two row lists of the same key range.
///
/// Backends return rows in their own collation order, which need not match
/// [`Key`](crate::core::Key)'s byte order (`'apple' < 'Banana'` under a
/// case-insensitive collation). Both sides are sorted by `Key` before the
/// merge so they are walked in one shared order. Keys must be unique per side.
pub fn compare_rows(table: &str, mut source: Vec<Row>, mut target: Vec<Row>) -> Vec<Diff> {
    source.sort_by(Row::cmp_key);
    target.sort_by(Row::cmp_key);

    let mut diffs = Vec::new();
    let mut source = source.into_iter().peekable();
    let mut target = target.into_iter().peekable();

    loop {
        let order = match (source.peek(), target.peek()) {
            (Some(s), Some(t)) => s.cmp_key(t),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };

        match order {
            Ordering::Less => {
                if let Some(s) = source.next() {
                    diffs.push(Diff::insert(table, s));
                }
            }
            Ordering::Greater => {
                if let Some(t) = target.next() {
                    diffs.push(Diff::delete(table, t));
                }
            }
            Ordering::Equal => {
                if let (Some(s), Some(t)) = (source.next(), target.next()) {
                    if s.data != t.data {
                        diffs.push(Diff::update(table, s, t));
                    }
                }
            }
        }
    }

    diffs
}
