//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{Key, Row, RowSource, Table};
use crate::error::{Result, VerifyError};

/// Wraps a row source with injected failures, latency and concurrency
/// accounting.
pub struct FlakySource {
    inner: Arc<dyn RowSource>,
    probe_failures: AtomicUsize,
    read_failures: AtomicUsize,
    poisoned: Mutex<Vec<Key>>,
    delay: Option<Duration>,
    columns: Option<Vec<String>>,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FlakySource {
    pub fn new(inner: Arc<dyn RowSource>) -> Self {
        Self {
            inner,
            probe_failures: AtomicUsize::new(0),
            read_failures: AtomicUsize::new(0),
            poisoned: Mutex::new(Vec::new()),
            delay: None,
            columns: None,
            reads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// The next `n` key probes fail with a transient error.
    pub fn fail_probes(self, n: usize) -> Self {
        self.probe_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` range reads fail with a transient error.
    pub fn fail_reads(self, n: usize) -> Self {
        self.read_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every range read covering `key` fails with a transient error.
    pub fn poison(self, key: Key) -> Self {
        self.poisoned.lock().unwrap().push(key);
        self
    }

    /// Sleep this long inside every range read.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report these data columns for every table.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Range reads attempted so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Highest number of range reads observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(&self, context: &str) -> VerifyError {
        VerifyError::query(self.inner.name(), context, "injected failure", true)
    }
}

#[async_trait]
impl RowSource for FlakySource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn key_at_offset(
        &self,
        table: &Table,
        from: Option<&Key>,
        offset: usize,
    ) -> Result<Option<Key>> {
        if Self::take_failure(&self.probe_failures) {
            return Err(self.injected("key probe"));
        }
        self.inner.key_at_offset(table, from, offset).await
    }

    async fn read_range(
        &self,
        table: &Table,
        start: Option<&Key>,
        end: Option<&Key>,
    ) -> Result<Vec<Row>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let poisoned = self.poisoned.lock().unwrap().iter().any(|k| {
            start.map_or(true, |s| k >= s) && end.map_or(true, |e| k < e)
        });
        let result = if poisoned || Self::take_failure(&self.read_failures) {
            Err(self.injected("read"))
        } else {
            self.inner.read_range(table, start, end).await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn columns(&self, table: &Table) -> Result<Vec<String>> {
        match &self.columns {
            Some(columns) => Ok(columns.clone()),
            None => self.inner.columns(table).await,
        }
    }

    async fn estimate_rows(&self, table: &Table) -> Result<u64> {
        self.inner.estimate_rows(table).await
    }

    async fn list_tables(&self) -> Result<Vec<Table>> {
        self.inner.list_tables().await
    }
}
