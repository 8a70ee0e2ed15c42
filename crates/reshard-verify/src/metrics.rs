//! Metrics sink injected into readers and the checksum engine.
//!
//! Nothing here is correctness-relevant: readers report progress and
//! latency as fire-and-forget calls. [`NoopMetrics`] discards everything;
//! [`RecordingMetrics`] keeps in-process counters for summaries and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Receiver for observational counters and latencies.
pub trait MetricsCollector: Send + Sync {
    /// A table read started.
    fn table_started(&self, _table: &str, _estimated_rows: u64) {}

    /// A table read finished successfully.
    fn table_done(&self, _table: &str) {}

    /// A chunk was read (and diffed, in diff mode).
    fn chunk_processed(&self, _table: &str) {}

    /// A processed chunk produced at least one diff.
    fn chunk_with_diffs(&self, _table: &str) {}

    /// Time spent waiting for an admission permit.
    fn limiter_wait(&self, _backend: &str, _waited: Duration) {}

    /// A read attempt failed and will be retried.
    fn retry(&self, _backend: &str) {}
}

/// Metrics sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {}

/// Per-table counters kept by [`RecordingMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounters {
    pub estimated_rows: u64,
    pub chunks_processed: u64,
    pub chunks_with_diffs: u64,
    pub done: bool,
}

/// Wait-time summary for one backend's limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitStats {
    /// Limiter waits recorded, including ones that timed out.
    pub acquisitions: u64,
    pub total_wait_us: u64,
    pub max_wait_us: u64,
    pub retries: u64,
}

/// In-process metrics sink.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    tables_started: AtomicU64,
    tables_done: AtomicU64,
    tables: Mutex<HashMap<String, TableCounters>>,
    backends: Mutex<HashMap<String, WaitStats>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of table reads started.
    pub fn tables_started(&self) -> u64 {
        self.tables_started.load(Ordering::Relaxed)
    }

    /// Number of table reads finished.
    pub fn tables_done(&self) -> u64 {
        self.tables_done.load(Ordering::Relaxed)
    }

    /// Counters for one table.
    pub fn table(&self, table: &str) -> TableCounters {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    /// Limiter wait statistics for one backend.
    pub fn backend(&self, backend: &str) -> WaitStats {
        lock(&self.backends).get(backend).cloned().unwrap_or_default()
    }

    fn update_table(&self, table: &str, f: impl FnOnce(&mut TableCounters)) {
        let mut tables = lock(&self.tables);
        f(tables.entry(table.to_string()).or_default());
    }

    fn update_backend(&self, backend: &str, f: impl FnOnce(&mut WaitStats)) {
        let mut backends = lock(&self.backends);
        f(backends.entry(backend.to_string()).or_default());
    }
}

impl MetricsCollector for RecordingMetrics {
    fn table_started(&self, table: &str, estimated_rows: u64) {
        self.tables_started.fetch_add(1, Ordering::Relaxed);
        self.update_table(table, |t| t.estimated_rows = estimated_rows);
    }

    fn table_done(&self, table: &str) {
        self.tables_done.fetch_add(1, Ordering::Relaxed);
        self.update_table(table, |t| t.done = true);
    }

    fn chunk_processed(&self, table: &str) {
        self.update_table(table, |t| t.chunks_processed += 1);
    }

    fn chunk_with_diffs(&self, table: &str) {
        self.update_table(table, |t| t.chunks_with_diffs += 1);
    }

    fn limiter_wait(&self, backend: &str, waited: Duration) {
        let us = waited.as_micros().min(u64::MAX as u128) as u64;
        self.update_backend(backend, |b| {
            b.acquisitions += 1;
            b.total_wait_us += us;
            b.max_wait_us = b.max_wait_us.max(us);
        });
    }

    fn retry(&self, backend: &str) {
        self.update_backend(backend, |b| b.retries += 1);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
