//! The row-access seam between the diff engine and a database.
//!
//! The engine never builds SQL itself. It asks a [`RowSource`] for key
//! boundaries and for the rows inside a key range, and everything else
//! (connection pooling, quoting, value decoding) lives behind this trait.

use async_trait::async_trait;

use crate::error::Result;

use super::schema::Table;
use super::value::{Key, Row};

/// Read access to one logical database (a source shard or the target).
///
/// Implementations must be cheap to share: the reader holds them in an
/// `Arc` and calls them from many chunk workers at once.
///
/// # Ordering contract
///
/// Keys and rows come back in the backend's own ascending key order, which
/// for text keys is the column collation and need not agree with [`Key`]'s
/// `Ord`. Chunk boundaries are taken from that order and handed back to the
/// same backend as range bounds, so ranges stay contiguous on its terms.
/// The chunk processor re-sorts each side by [`Key`] before merging.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Name used in logs and errors (e.g. `customer/-80@replica`).
    fn name(&self) -> &str;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Return the key of the row `offset` positions after `from`.
    ///
    /// Counting starts at the first row whose key is `>= from` (or at the
    /// first row of the table when `from` is `None`), so `offset = 0` returns
    /// that first row's key. Returns `None` when fewer rows remain.
    async fn key_at_offset(
        &self,
        table: &Table,
        from: Option<&Key>,
        offset: usize,
    ) -> Result<Option<Key>>;

    /// Read all rows with `start <= key < end`, in the backend's key order.
    ///
    /// A `None` bound is unbounded on that side.
    async fn read_range(
        &self,
        table: &Table,
        start: Option<&Key>,
        end: Option<&Key>,
    ) -> Result<Vec<Row>>;

    /// Data (non-key) column names of a table, in definition order.
    ///
    /// Fills in [`Table::columns`] when none are configured, so both sides
    /// select the same columns by name whatever their physical layout. The
    /// default returns an empty list, meaning the backend's rows already
    /// carry a fixed column order.
    async fn columns(&self, _table: &Table) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Approximate row count for a table.
    async fn estimate_rows(&self, table: &Table) -> Result<u64>;

    /// Discover the tables (with their primary keys) in this database.
    async fn list_tables(&self) -> Result<Vec<Table>>;
}
