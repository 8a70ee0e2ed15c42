//! Key-range chunk generation.
//!
//! A table is split into half-open ranges `[start, end)` by probing the
//! source for the key found `chunk_size` rows past the current boundary.
//! The first chunk is unbounded below and the last unbounded above, so the
//! chunks cover the whole key space even when rows are added at either end
//! after generation.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{Key, RowSource, Table};
use crate::error::{Result, VerifyError};
use crate::retry::{retry, RetryOptions};

/// A half-open key range of one table.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub table: Arc<Table>,

    /// Position in generation order.
    pub seq: usize,

    /// Inclusive lower bound; `None` is unbounded.
    pub start: Option<Key>,

    /// Exclusive upper bound; `None` is unbounded.
    pub end: Option<Key>,
}

impl Chunk {
    /// Check whether a key falls inside this chunk, comparing in [`Key`] order.
    pub fn contains(&self, key: &Key) -> bool {
        self.start.as_ref().map_or(true, |s| key >= s)
            && self.end.as_ref().map_or(true, |e| key < e)
    }

    /// The range in interval notation, e.g. `[10, 20)`.
    pub fn range(&self) -> String {
        let start = self.start.as_ref().map_or("-inf".to_string(), Key::to_string);
        let end = self.end.as_ref().map_or("+inf".to_string(), Key::to_string);
        format!("[{}, {})", start, end)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.table.name, self.range())
    }
}

/// Split a table into chunks of about `chunk_size` rows.
///
/// Every probe runs through the retrying accessor. A probe that still fails
/// after retries fails the whole table.
pub async fn generate_table_chunks(
    table: &Arc<Table>,
    source: &Arc<dyn RowSource>,
    chunk_size: usize,
    options: &RetryOptions,
    cancel: &CancellationToken,
) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(VerifyError::Config("chunk_size must be at least 1".into()));
    }

    let mut chunks = Vec::new();
    let mut start: Option<Key> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(VerifyError::Cancelled);
        }

        let next = retry(options, cancel, "key probe", || {
            let source = source.clone();
            let table = table.clone();
            let from = start.clone();
            async move { source.key_at_offset(&table, from.as_ref(), chunk_size).await }
        })
        .await
        .map_err(|e| wrap(&table.name, e))?;

        match next {
            Some(end) => {
                // Boundaries are in the backend's order; only a repeat stalls.
                if start.as_ref() == Some(&end) {
                    return Err(VerifyError::chunking(
                        &table.name,
                        VerifyError::query(
                            source.name(),
                            "key probe",
                            format!("boundary {} repeats the previous boundary", end),
                            false,
                        ),
                    ));
                }
                chunks.push(Chunk {
                    table: table.clone(),
                    seq: chunks.len(),
                    start: start.take(),
                    end: Some(end.clone()),
                });
                start = Some(end);
            }
            None => {
                chunks.push(Chunk {
                    table: table.clone(),
                    seq: chunks.len(),
                    start,
                    end: None,
                });
                break;
            }
        }
    }

    debug!(
        "{}: generated {} chunks (chunk_size {})",
        table.name,
        chunks.len(),
        chunk_size
    );
    Ok(chunks)
}

fn wrap(table: &str, err: VerifyError) -> VerifyError {
    if err.is_cancelled() {
        err
    } else {
        VerifyError::chunking(table, err)
    }
}
