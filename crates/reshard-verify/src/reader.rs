//! Parallel chunked reader.
//!
//! A [`Reader`] diffs (or dumps) one table:
//!
//! 1. chunk the source key space ([`generate_table_chunks`])
//! 2. shuffle the chunks so hot key ranges are spread over the run
//! 3. process at most `reader_parallelism` chunks at a time, each reading
//!    source and target through their retrying accessors and merging the
//!    two row sets
//! 4. send every diff on the output channel
//!
//! In consistent mode the first failed chunk cancels the table and fails
//! the read. Otherwise failed chunks are logged, counted as skipped, and the
//! read carries on with the rest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::{generate_table_chunks, Chunk};
use crate::core::{Row, RowSource, Table};
use crate::diff::{compare_rows, Diff, DiffCounts};
use crate::error::{Result, VerifyError};
use crate::limiter::Limiter;
use crate::metrics::{MetricsCollector, NoopMetrics};
use crate::retry::{retry, RetryOptions};

/// Per-table reader settings.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Target rows per chunk.
    pub chunk_size: usize,

    /// Concurrent chunk workers for this table.
    pub reader_parallelism: usize,

    /// Retries per read after the first attempt.
    pub read_retries: usize,

    /// Per-attempt read timeout.
    pub read_timeout: Duration,

    /// Maximum wait for an admission permit.
    pub acquire_timeout: Duration,

    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// Fail the read on the first failed chunk.
    pub consistent: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5_000,
            reader_parallelism: 20,
            read_retries: 10,
            read_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(60),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(10),
            consistent: false,
        }
    }
}

impl ReaderConfig {
    /// Retry options for one backend under these settings.
    pub fn retry_options(
        &self,
        backend: &str,
        limiter: Arc<dyn Limiter>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> RetryOptions {
        RetryOptions {
            max_retries: self.read_retries,
            timeout: self.read_timeout,
            acquire_timeout: self.acquire_timeout,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            ..RetryOptions::new(backend, limiter)
        }
        .with_metrics(metrics)
    }
}

/// Whether chunks are compared against the target or just dumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Read source and target, emit their differences.
    Diff,
    /// Read the source only, emit every row as an insert.
    Read,
}

/// Outcome of reading one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSummary {
    pub table: String,
    pub chunks_generated: usize,
    pub chunks_processed: usize,
    pub chunks_with_diffs: usize,

    /// Chunks that failed and were skipped (best-effort mode only).
    pub chunks_skipped: usize,

    pub diffs: DiffCounts,
    pub duration_ms: u64,
}

impl ReadSummary {
    /// Whether every chunk was processed.
    pub fn is_complete(&self) -> bool {
        self.chunks_skipped == 0
    }
}

/// Reads and diffs a single chunk. Cheap to clone into worker tasks.
#[derive(Clone)]
struct ChunkProcessor {
    source: Arc<dyn RowSource>,
    target: Arc<dyn RowSource>,
    source_retry: RetryOptions,
    target_retry: RetryOptions,
    metrics: Arc<dyn MetricsCollector>,
}

impl ChunkProcessor {
    async fn process_chunk(
        &self,
        chunk: &Chunk,
        mode: ReadMode,
        diffs: &mpsc::Sender<Diff>,
        cancel: &CancellationToken,
    ) -> Result<DiffCounts> {
        let found = self
            .compare_chunk(chunk, mode, cancel)
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    e
                } else {
                    VerifyError::chunk(&chunk.table.name, chunk.range(), e)
                }
            })?;

        let table = &chunk.table.name;
        self.metrics.chunk_processed(table);

        let mut counts = DiffCounts::default();
        for diff in found {
            counts.record(diff.kind);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
                sent = diffs.send(diff) => sent.map_err(|_| VerifyError::OutputClosed)?,
            }
        }

        if counts.has_differences() {
            self.metrics.chunk_with_diffs(table);
            debug!("{}: {} diffs", chunk, counts.total());
        }
        Ok(counts)
    }

    async fn compare_chunk(
        &self,
        chunk: &Chunk,
        mode: ReadMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<Diff>> {
        let table = &chunk.table.name;
        match mode {
            ReadMode::Diff => {
                let (source_rows, target_rows) = tokio::try_join!(
                    read_chunk(&self.source, &self.source_retry, chunk, cancel),
                    read_chunk(&self.target, &self.target_retry, chunk, cancel),
                )?;
                Ok(compare_rows(table, source_rows, target_rows))
            }
            ReadMode::Read => {
                let rows = read_chunk(&self.source, &self.source_retry, chunk, cancel).await?;
                Ok(rows.into_iter().map(|row| Diff::insert(table, row)).collect())
            }
        }
    }
}

async fn read_chunk(
    source: &Arc<dyn RowSource>,
    options: &RetryOptions,
    chunk: &Chunk,
    cancel: &CancellationToken,
) -> Result<Vec<Row>> {
    let operation = format!("read {} from {}", chunk.range(), source.name());
    retry(options, cancel, &operation, || {
        let source = source.clone();
        let table = chunk.table.clone();
        let start = chunk.start.clone();
        let end = chunk.end.clone();
        async move { source.read_range(&table, start.as_ref(), end.as_ref()).await }
    })
    .await
}

/// Chunk failures that best-effort mode may skip.
fn is_skippable(err: &VerifyError) -> bool {
    matches!(err, VerifyError::Chunk { .. }) && !err.is_cancelled()
}

/// Parallel reader for one table.
pub struct Reader {
    table: Arc<Table>,
    config: ReaderConfig,
    processor: ChunkProcessor,
    chunker_permits: Option<Arc<Semaphore>>,
}

impl Reader {
    /// Create a reader for one table.
    pub fn new(
        config: ReaderConfig,
        table: Arc<Table>,
        source: Arc<dyn RowSource>,
        source_limiter: Arc<dyn Limiter>,
        target: Arc<dyn RowSource>,
        target_limiter: Arc<dyn Limiter>,
    ) -> Self {
        let metrics: Arc<dyn MetricsCollector> = Arc::new(NoopMetrics);
        let processor = ChunkProcessor {
            source,
            target,
            source_retry: config.retry_options("source", source_limiter, metrics.clone()),
            target_retry: config.retry_options("target", target_limiter, metrics.clone()),
            metrics,
        };
        Self {
            table,
            config,
            processor,
            chunker_permits: None,
        }
    }

    /// Report progress and limiter waits to a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.processor.source_retry.metrics = metrics.clone();
        self.processor.target_retry.metrics = metrics.clone();
        self.processor.metrics = metrics;
        self
    }

    /// Gate chunk generation on a semaphore shared across tables.
    pub fn with_chunker_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.chunker_permits = Some(permits);
        self
    }

    /// Diff the table, sending every difference on `diffs`.
    pub async fn diff(
        &self,
        diffs: mpsc::Sender<Diff>,
        cancel: &CancellationToken,
    ) -> Result<ReadSummary> {
        self.run(ReadMode::Diff, diffs, cancel).await
    }

    /// Read the source table only, sending every row as an insert.
    pub async fn read(
        &self,
        diffs: mpsc::Sender<Diff>,
        cancel: &CancellationToken,
    ) -> Result<ReadSummary> {
        self.run(ReadMode::Read, diffs, cancel).await
    }

    async fn run(
        &self,
        mode: ReadMode,
        diffs: mpsc::Sender<Diff>,
        cancel: &CancellationToken,
    ) -> Result<ReadSummary> {
        let started = Instant::now();
        let name = self.table.name.clone();
        let cancel = cancel.child_token();
        self.processor
            .metrics
            .table_started(&name, self.table.estimated_rows);

        let mut chunks = self.generate_chunks(&cancel).await?;
        let mut summary = ReadSummary {
            table: name.clone(),
            chunks_generated: chunks.len(),
            ..ReadSummary::default()
        };
        chunks.shuffle(&mut rand::thread_rng());

        info!(
            "{}: {} {} chunks (~{} rows) with parallelism {}",
            name,
            if mode == ReadMode::Diff { "diffing" } else { "reading" },
            chunks.len(),
            self.table.estimated_rows,
            self.config.reader_parallelism
        );

        let slots = Arc::new(Semaphore::new(self.config.reader_parallelism.max(1)));
        let mut workers = JoinSet::new();

        for chunk in chunks {
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                slot = slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let processor = self.processor.clone();
            let diffs = diffs.clone();
            let cancel = cancel.clone();
            let consistent = self.config.consistent;
            workers.spawn(async move {
                let _slot = slot;
                let result = processor.process_chunk(&chunk, mode, &diffs, &cancel).await;
                if let Err(e) = &result {
                    if consistent || !is_skippable(e) {
                        cancel.cancel();
                    }
                }
                result
            });
        }
        drop(diffs);

        // Drain every worker, even after a failure
        let mut failure: Option<VerifyError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| {
                cancel.cancel();
                VerifyError::Task(format!("Chunk worker for {} panicked: {}", name, e))
            });
            match result.and_then(|r| r) {
                Ok(counts) => {
                    summary.chunks_processed += 1;
                    if counts.has_differences() {
                        summary.chunks_with_diffs += 1;
                    }
                    summary.diffs.merge(counts);
                }
                Err(e) if !self.config.consistent && is_skippable(&e) => {
                    warn!("{}, skipping: {}", e, root_cause(&e));
                    summary.chunks_skipped += 1;
                }
                Err(e) => {
                    // Keep the error that caused the abort rather than the
                    // cancellations it triggered in other workers
                    if failure.as_ref().map_or(true, |f| f.is_cancelled() && !e.is_cancelled()) {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            error!("{}: read failed: {}", name, e);
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(VerifyError::Cancelled);
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        self.processor.metrics.table_done(&name);
        info!(
            "{}: done in {}ms, {} chunks processed, {} skipped, {} diffs ({} inserts, {} updates, {} deletes)",
            name,
            summary.duration_ms,
            summary.chunks_processed,
            summary.chunks_skipped,
            summary.diffs.total(),
            summary.diffs.inserts,
            summary.diffs.updates,
            summary.diffs.deletes
        );
        Ok(summary)
    }

    async fn generate_chunks(&self, cancel: &CancellationToken) -> Result<Vec<Chunk>> {
        let _chunking_slot = match &self.chunker_permits {
            Some(permits) => Some(tokio::select! {
                _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
                slot = permits.clone().acquire_owned() => slot.map_err(|_| VerifyError::Cancelled)?,
            }),
            None => None,
        };

        generate_table_chunks(
            &self.table,
            &self.processor.source,
            self.config.chunk_size,
            &self.processor.source_retry,
            cancel,
        )
        .await
    }
}

fn root_cause(err: &VerifyError) -> String {
    let mut current: &dyn std::error::Error = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemorySource;
    use crate::core::{Key, SqlValue};
    use crate::diff::DiffKind;
    use crate::limiter::FixedLimiter;
    use crate::metrics::RecordingMetrics;
    use crate::testing::FlakySource;

    fn config() -> ReaderConfig {
        ReaderConfig {
            chunk_size: 10,
            reader_parallelism: 4,
            read_retries: 1,
            read_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(2),
            consistent: false,
        }
    }

    fn memory(name: &str, ids: impl IntoIterator<Item = i64>) -> Arc<MemorySource> {
        let source = MemorySource::new(name);
        source.create_table(&Table::new("customers"));
        for id in ids {
            source.insert(
                "customers",
                Key::from(id),
                vec![SqlValue::Int(id), SqlValue::from(format!("customer {}", id))],
            );
        }
        Arc::new(source)
    }

    fn reader(
        config: ReaderConfig,
        source: Arc<dyn RowSource>,
        target: Arc<dyn RowSource>,
    ) -> Reader {
        Reader::new(
            config,
            Arc::new(Table::new("customers")),
            source,
            Arc::new(FixedLimiter::new(16)),
            target,
            Arc::new(FixedLimiter::new(16)),
        )
    }

    async fn run(reader: &Reader, mode: ReadMode) -> (Result<ReadSummary>, Vec<Diff>) {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let consumer = async {
            let mut diffs = Vec::new();
            while let Some(d) = rx.recv().await {
                diffs.push(d);
            }
            diffs
        };
        let read = async {
            match mode {
                ReadMode::Diff => reader.diff(tx, &cancel).await,
                ReadMode::Read => reader.read(tx, &cancel).await,
            }
        };
        tokio::join!(read, consumer)
    }

    fn sorted(diffs: &[Diff]) -> Vec<(DiffKind, i64)> {
        let mut out: Vec<(DiffKind, i64)> = diffs
            .iter()
            .map(|d| match d.row.key.values() {
                [crate::core::PkValue::Int(id)] => (d.kind, *id),
                other => panic!("unexpected key {:?}", other),
            })
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_diff_finds_every_kind() {
        let source = memory("source", 1..=100);
        let target = memory("target", 1..=100);
        target.delete("customers", &Key::from(3));
        target.delete("customers", &Key::from(77));
        target.insert("customers", Key::from(42), vec![SqlValue::Int(42), SqlValue::from("changed")]);
        // Outside the source's key range on both ends
        target.insert("customers", Key::from(-5), vec![SqlValue::Int(-5), SqlValue::Null]);
        target.insert("customers", Key::from(500), vec![SqlValue::Int(500), SqlValue::Null]);

        let metrics = Arc::new(RecordingMetrics::new());
        let reader = reader(config(), source, target).with_metrics(metrics.clone());
        let (summary, diffs) = run(&reader, ReadMode::Diff).await;
        let summary = summary.unwrap();

        assert_eq!(
            sorted(&diffs),
            vec![
                (DiffKind::Insert, 3),
                (DiffKind::Insert, 77),
                (DiffKind::Update, 42),
                (DiffKind::Delete, -5),
                (DiffKind::Delete, 500),
            ]
        );
        assert_eq!(summary.chunks_generated, 10);
        assert_eq!(summary.chunks_processed, 10);
        assert_eq!(summary.chunks_skipped, 0);
        assert_eq!(summary.diffs.inserts, 2);
        assert_eq!(summary.diffs.updates, 1);
        assert_eq!(summary.diffs.deletes, 2);
        assert!(summary.chunks_with_diffs >= 3);

        let counters = metrics.table("customers");
        assert_eq!(counters.chunks_processed, 10);
        assert_eq!(counters.chunks_with_diffs, summary.chunks_with_diffs as u64);
        assert!(counters.done);
    }

    #[tokio::test]
    async fn test_read_mode_skips_target() {
        let source = memory("source", 1..=25);
        let target = Arc::new(FlakySource::new(memory("target", 1..=25)));
        let reader = reader(config(), source, target.clone());
        let (summary, diffs) = run(&reader, ReadMode::Read).await;

        assert_eq!(summary.unwrap().diffs.inserts, 25);
        assert_eq!(diffs.len(), 25);
        assert!(diffs.iter().all(|d| d.kind == DiffKind::Insert));
        assert_eq!(target.reads(), 0);
    }

    #[tokio::test]
    async fn test_repeated_runs_yield_same_diffs() {
        let source = memory("source", (1..=200).filter(|id| id % 7 != 0));
        let target = memory("target", (1..=200).filter(|id| id % 5 != 0));
        let reader = reader(config(), source, target);

        let (_, first) = run(&reader, ReadMode::Diff).await;
        let (_, second) = run(&reader, ReadMode::Diff).await;
        assert!(!first.is_empty());
        assert_eq!(sorted(&first), sorted(&second));
    }

    #[tokio::test]
    async fn test_consistent_mode_fails_on_chunk_error() {
        let source = Arc::new(FlakySource::new(memory("source", 1..=100)).poison(Key::from(50)));
        let target = memory("target", []);
        let reader = reader(
            ReaderConfig {
                consistent: true,
                ..config()
            },
            source,
            target,
        );

        let (result, _) = run(&reader, ReadMode::Diff).await;
        match result {
            Err(VerifyError::Chunk { table, range, .. }) => {
                assert_eq!(table, "customers");
                assert_eq!(range, "[41, 51)");
            }
            other => panic!("expected chunk failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_best_effort_skips_failed_chunk() {
        let source = Arc::new(FlakySource::new(memory("source", 1..=100)).poison(Key::from(50)));
        let target = memory("target", []);
        let reader = reader(config(), source, target);

        let (result, diffs) = run(&reader, ReadMode::Diff).await;
        let summary = result.unwrap();
        assert_eq!(summary.chunks_skipped, 1);
        assert_eq!(summary.chunks_processed, 9);
        assert!(!summary.is_complete());
        assert_eq!(diffs.len(), 90);
        assert!(sorted(&diffs)
            .iter()
            .all(|(kind, id)| *kind == DiffKind::Insert && !(41..=50).contains(id)));
    }

    #[tokio::test]
    async fn test_transient_read_failures_recover() {
        let source = Arc::new(FlakySource::new(memory("source", 1..=30)).fail_reads(1));
        let target = memory("target", 1..=30);
        let reader = reader(config(), source.clone(), target);

        let (result, diffs) = run(&reader, ReadMode::Diff).await;
        let summary = result.unwrap();
        assert!(summary.is_complete());
        assert!(diffs.is_empty());
        assert_eq!(source.reads(), summary.chunks_generated + 1);
    }

    #[tokio::test]
    async fn test_parallelism_one_serializes_chunks() {
        let source = Arc::new(
            FlakySource::new(memory("source", 1..=60)).with_delay(Duration::from_millis(5)),
        );
        let reader = reader(
            ReaderConfig {
                reader_parallelism: 1,
                ..config()
            },
            source.clone(),
            memory("target", 1..=60),
        );
        let (result, _) = run(&reader, ReadMode::Diff).await;
        result.unwrap();
        assert_eq!(source.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_parallelism_bounds_concurrent_workers() {
        let source = Arc::new(
            FlakySource::new(memory("source", 1..=200)).with_delay(Duration::from_millis(20)),
        );
        let reader = reader(
            ReaderConfig {
                reader_parallelism: 3,
                ..config()
            },
            source.clone(),
            memory("target", 1..=200),
        );
        let (result, _) = run(&reader, ReadMode::Diff).await;
        assert_eq!(result.unwrap().chunks_processed, 20);
        assert!(source.max_in_flight() <= 3);
        assert!(source.max_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_closed_output_fails_read() {
        let reader = reader(config(), memory("source", 1..=50), memory("target", []));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = reader.diff(tx, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VerifyError::OutputClosed));
    }

    #[tokio::test]
    async fn test_cancelled_read_returns_cancelled() {
        let reader = reader(config(), memory("source", 1..=50), memory("target", []));
        let (tx, _rx) = mpsc::channel(1000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = reader.diff(tx, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_full_output() {
        let reader = reader(config(), memory("source", 1..=50), memory("target", []));
        // Never drained, so workers block on send once one diff is queued
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), reader.diff(tx, &cancel))
            .await
            .expect("cancel did not unblock the reader");
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_table() {
        let reader = reader(config(), memory("source", []), memory("target", []));
        let (result, diffs) = run(&reader, ReadMode::Diff).await;
        let summary = result.unwrap();
        assert_eq!(summary.chunks_generated, 1);
        assert_eq!(summary.chunks_processed, 1);
        assert!(diffs.is_empty());
    }
}
