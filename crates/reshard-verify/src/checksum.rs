//! Multi-table checksum runs.
//!
//! [`Checksum`] resolves the source and target connections, builds one
//! admission limiter per backend, and runs a [`Reader`] per table with
//! run-wide limits on how many tables are read and chunked at once.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, DbConfig};
use crate::core::{RowSource, Table};
use crate::diff::{Diff, DiffCounts};
use crate::error::{Result, VerifyError};
use crate::limiter;
use crate::metrics::{MetricsCollector, NoopMetrics};
use crate::reader::{ReadMode, ReadSummary, Reader};

/// Result of a checksum run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Per-table summaries, sorted by table name.
    pub tables: Vec<ReadSummary>,

    /// Collected diffs (empty for streamed runs).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<Diff>,
}

impl ChecksumResult {
    /// Diff counts over all tables.
    pub fn totals(&self) -> DiffCounts {
        let mut totals = DiffCounts::default();
        for table in &self.tables {
            totals.merge(table.diffs);
        }
        totals
    }

    pub fn chunks_skipped(&self) -> usize {
        self.tables.iter().map(|t| t.chunks_skipped).sum()
    }

    pub fn has_differences(&self) -> bool {
        self.totals().has_differences()
    }

    /// No differences found and no chunk skipped.
    pub fn is_in_sync(&self) -> bool {
        !self.has_differences() && self.chunks_skipped() == 0
    }
}

/// Connectivity of both sides of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}

/// A configured checksum run.
pub struct Checksum {
    config: Config,
    metrics: Arc<dyn MetricsCollector>,
    backends: Option<(Arc<dyn RowSource>, Arc<dyn RowSource>)>,
    table_filter: Vec<String>,
    mode: ReadMode,
}

impl Checksum {
    /// Create a run from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metrics: Arc::new(NoopMetrics),
            backends: None,
            table_filter: Vec::new(),
            mode: ReadMode::Diff,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use already-connected backends instead of resolving the configured ones.
    pub fn with_backends(mut self, source: Arc<dyn RowSource>, target: Arc<dyn RowSource>) -> Self {
        self.backends = Some((source, target));
        self
    }

    /// Only process the named tables.
    pub fn with_table_filter<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.table_filter = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Dump source rows instead of diffing against the target.
    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run to completion, collecting every diff in memory.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ChecksumResult> {
        let (source, target) = self.connect().await?;
        let (tx, mut rx) = mpsc::channel(self.config.checksum.get_queue_size());

        let collect = async {
            let mut diffs = Vec::new();
            while let Some(diff) = rx.recv().await {
                diffs.push(diff);
            }
            diffs
        };
        let (result, diffs) = tokio::join!(self.execute(source, target, tx, cancel), collect);

        let mut result = result?;
        result.diffs = diffs;
        Ok(result)
    }

    /// Start the run in the background and stream diffs as they are found.
    ///
    /// Connections are resolved before this returns. The join handle resolves
    /// to the run result without diffs once every table is done.
    pub async fn stream(
        self,
        cancel: CancellationToken,
    ) -> Result<(mpsc::Receiver<Diff>, JoinHandle<Result<ChecksumResult>>)> {
        let (source, target) = self.connect().await?;
        let (tx, rx) = mpsc::channel(self.config.checksum.get_queue_size());
        let handle =
            tokio::spawn(async move { self.execute(source, target, tx, &cancel).await });
        Ok((rx, handle))
    }

    /// Connect to and ping both sides, reporting failures instead of
    /// returning them.
    pub async fn health_check(&self) -> HealthCheckResult {
        let probe = |side: Option<Arc<dyn RowSource>>, config: &DbConfig| {
            let config = config.clone();
            async move {
                let started = Instant::now();
                let result: Result<()> = async {
                    let source = match side {
                        Some(source) => source,
                        None => config.connect().await?,
                    };
                    source.ping().await
                }
                .await;
                (result, started.elapsed().as_millis() as u64)
            }
        };
        let (source, target) = match &self.backends {
            Some((s, t)) => (Some(s.clone()), Some(t.clone())),
            None => (None, None),
        };
        let ((source, source_latency_ms), (target, target_latency_ms)) = tokio::join!(
            probe(source, &self.config.source),
            probe(target, &self.config.target)
        );
        let source_connected = source.is_ok();
        let target_connected = target.is_ok();
        HealthCheckResult {
            source_connected,
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_connected,
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
            healthy: source_connected && target_connected,
        }
    }

    async fn connect(&self) -> Result<(Arc<dyn RowSource>, Arc<dyn RowSource>)> {
        match &self.backends {
            Some((source, target)) => Ok((source.clone(), target.clone())),
            None => tokio::try_join!(self.config.source.connect(), self.config.target.connect()),
        }
    }

    async fn execute(
        &self,
        source: Arc<dyn RowSource>,
        target: Arc<dyn RowSource>,
        diffs: mpsc::Sender<Diff>,
        cancel: &CancellationToken,
    ) -> Result<ChecksumResult> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        let cancel = cancel.child_token();
        let checksum = &self.config.checksum;

        let tables = self.resolve_tables(&source).await?;
        info!(
            "Checksum run {}: {} tables, {} -> {}",
            run_id,
            tables.len(),
            source.name(),
            target.name()
        );

        let source_limiter = limiter::from_config(&self.config.source.limiter);
        let target_limiter = limiter::from_config(&self.config.target.limiter);
        let reader_config = checksum.reader_config();
        let table_permits = Arc::new(Semaphore::new(checksum.get_reader_count()));
        let chunker_permits = Arc::new(Semaphore::new(checksum.get_chunker_count()));

        let mut readers = JoinSet::new();
        for table in tables {
            let name = table.name.clone();
            let reader = Reader::new(
                reader_config.clone(),
                Arc::new(table),
                source.clone(),
                source_limiter.clone(),
                target.clone(),
                target_limiter.clone(),
            )
            .with_metrics(self.metrics.clone())
            .with_chunker_permits(chunker_permits.clone());

            let permits = table_permits.clone();
            let diffs = diffs.clone();
            let cancel = cancel.clone();
            let mode = self.mode;
            let consistent = checksum.consistent;
            readers.spawn(async move {
                let _slot = tokio::select! {
                    _ = cancel.cancelled() => return (name, Err(VerifyError::Cancelled)),
                    slot = permits.acquire_owned() => match slot {
                        Ok(slot) => slot,
                        Err(_) => return (name, Err(VerifyError::Cancelled)),
                    },
                };
                let result = match mode {
                    ReadMode::Diff => reader.diff(diffs, &cancel).await,
                    ReadMode::Read => reader.read(diffs, &cancel).await,
                };
                if result.is_err() && consistent {
                    cancel.cancel();
                }
                (name, result)
            });
        }
        drop(diffs);

        let mut summaries = Vec::new();
        let mut failure: Option<VerifyError> = None;
        while let Some(joined) = readers.join_next().await {
            let (name, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    cancel.cancel();
                    (
                        "<unknown>".to_string(),
                        Err(VerifyError::Task(format!("Table reader panicked: {}", e))),
                    )
                }
            };
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    if !e.is_cancelled() {
                        error!("Table {} failed: {}", name, e);
                    }
                    if failure
                        .as_ref()
                        .map_or(true, |f| f.is_cancelled() && !e.is_cancelled())
                    {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(VerifyError::Cancelled);
        }

        summaries.sort_by(|a, b| a.table.cmp(&b.table));
        let result = ChecksumResult {
            run_id,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            tables: summaries,
            diffs: Vec::new(),
        };
        let totals = result.totals();
        info!(
            "Checksum run {} finished in {}ms: {} diffs ({} inserts, {} updates, {} deletes), {} chunks skipped",
            result.run_id,
            result.duration_ms,
            totals.total(),
            totals.inserts,
            totals.updates,
            totals.deletes,
            result.chunks_skipped()
        );
        Ok(result)
    }

    /// Configured tables, or the source's tables when none are configured,
    /// narrowed by the table filter.
    async fn resolve_tables(&self, source: &Arc<dyn RowSource>) -> Result<Vec<Table>> {
        let candidates = if self.config.checksum.tables.is_empty() {
            source.list_tables().await?
        } else {
            self.config.checksum.tables.clone()
        };

        let mut tables = if self.table_filter.is_empty() {
            candidates
        } else {
            let mut selected = Vec::with_capacity(self.table_filter.len());
            for name in &self.table_filter {
                let table = candidates
                    .iter()
                    .find(|t| &t.name == name)
                    .cloned()
                    .ok_or_else(|| VerifyError::Config(format!("table '{}' not found", name)))?;
                selected.push(table);
            }
            selected
        };

        let resolved = join_all(tables.iter().map(|table| async move {
            if table.columns.is_empty() {
                source.columns(table).await.map(Some)
            } else {
                Ok(None)
            }
        }))
        .await;
        for (table, columns) in tables.iter_mut().zip(resolved) {
            if let Some(columns) = columns? {
                table.columns = columns;
            }
        }

        let estimates = join_all(tables.iter().map(|table| async move {
            if table.estimated_rows > 0 {
                return table.estimated_rows;
            }
            match source.estimate_rows(table).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("Could not estimate rows for {}: {}", table.name, e);
                    0
                }
            }
        }))
        .await;
        for (table, rows) in tables.iter_mut().zip(estimates) {
            table.estimated_rows = rows;
        }
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DatabaseTarget, KeyRange, MemorySource};
    use crate::config::{ChecksumConfig, DbConfig};
    use crate::core::{Key, SqlValue};
    use crate::diff::DiffKind;
    use crate::metrics::RecordingMetrics;
    use crate::testing::FlakySource;
    use std::io::Write;

    fn customers(name: &str, ids: impl IntoIterator<Item = i64>) -> Arc<MemorySource> {
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

    fn config(tables: Vec<Table>) -> Config {
        Config {
            source: DbConfig::memory("customer/-80@replica"),
            target: DbConfig::memory("customer"),
            checksum: ChecksumConfig {
                queue_size: Some(1000),
                chunk_size: Some(5),
                chunker_count: Some(1),
                reader_count: Some(1),
                read_timeout_secs: Some(60),
                retry_base_delay_ms: Some(1),
                retry_max_delay_ms: Some(2),
                tables,
                ..ChecksumConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn test_sharded_source_against_empty_target() {
        let full = customers("customer", 1..=1000);
        let shard = Arc::new(full.filtered("customer/-80@replica", &KeyRange::parse("-80").unwrap()));
        let expected = shard.row_count("customers");
        assert!(expected > 0 && expected < 1000);
        let target = customers("customer", []);

        let checksum = Checksum::new(config(vec![Table::new("customers")]))
            .unwrap()
            .with_backends(shard, target);
        let result = checksum.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.diffs.len(), expected);
        assert!(result.diffs.iter().all(|d| d.kind == DiffKind::Insert));
        assert_eq!(result.totals().inserts, expected as u64);
        assert_eq!(result.tables.len(), 1);
        assert_eq!(result.tables[0].chunks_processed, result.tables[0].chunks_generated);
        assert!(!result.is_in_sync());
        assert!(uuid::Uuid::parse_str(&result.run_id).is_ok());
    }

    #[tokio::test]
    async fn test_shard_qualified_memory_database_from_data_file() {
        let full = customers("seed", 1..=1000);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&full.snapshot()).unwrap().as_bytes())
            .unwrap();

        let mut config = config(Vec::new());
        config.source.data_file = Some(file.path().display().to_string());
        let expected = (1..=1000)
            .filter(|id| KeyRange::parse("-80").unwrap().contains_key(&Key::from(*id)))
            .count();

        // Target has no tables at all, so its reads fail and every chunk is skipped
        let result = Checksum::new(config.clone())
            .unwrap()
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.tables[0].chunks_skipped, result.tables[0].chunks_generated);

        let target_file = tempfile::NamedTempFile::new().unwrap();
        let empty = MemorySource::new("customer");
        empty.create_table(&Table::new("customers"));
        std::fs::write(
            target_file.path(),
            serde_json::to_string(&empty.snapshot()).unwrap(),
        )
        .unwrap();
        config.target.data_file = Some(target_file.path().display().to_string());

        let result = Checksum::new(config)
            .unwrap()
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.diffs.len(), expected);
        assert_eq!(result.tables[0].table, "customers");
    }

    #[tokio::test]
    async fn test_in_sync_databases() {
        let checksum = Checksum::new(config(Vec::new()))
            .unwrap()
            .with_backends(customers("s", 1..=50), customers("t", 1..=50));
        let result = checksum.run(&CancellationToken::new()).await.unwrap();
        assert!(result.is_in_sync());
        assert!(result.diffs.is_empty());
    }

    #[tokio::test]
    async fn test_stream_delivers_diffs_and_summary() {
        let source = customers("s", 1..=100);
        let target = customers("t", 11..=110);
        let checksum = Checksum::new(config(Vec::new()))
            .unwrap()
            .with_backends(source, target);

        let (mut rx, handle) = checksum.stream(CancellationToken::new()).await.unwrap();
        let mut diffs = Vec::new();
        while let Some(diff) = rx.recv().await {
            diffs.push(diff);
        }
        let result = handle.await.unwrap().unwrap();

        assert!(result.diffs.is_empty());
        assert_eq!(diffs.len(), 20);
        assert_eq!(result.totals().inserts, 10);
        assert_eq!(result.totals().deletes, 10);
    }

    #[tokio::test]
    async fn test_read_mode_dumps_source() {
        let checksum = Checksum::new(config(Vec::new()))
            .unwrap()
            .with_backends(customers("s", 1..=30), customers("t", []))
            .with_mode(ReadMode::Read);
        let result = checksum.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.diffs.len(), 30);
    }

    #[tokio::test]
    async fn test_failed_table_reported_after_others_finish() {
        let metrics = Arc::new(RecordingMetrics::new());
        let mut config = config(vec![Table::new("customers"), Table::new("ghosts")]);
        config.checksum.reader_count = Some(2);
        let checksum = Checksum::new(config)
            .unwrap()
            .with_metrics(metrics.clone())
            .with_backends(customers("s", 1..=100), customers("t", 1..=90));

        let err = checksum.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VerifyError::Chunking { ref table, .. } if table == "ghosts"));
        assert!(metrics.table("customers").done);
    }

    #[tokio::test]
    async fn test_consistent_mode_cancels_other_tables() {
        let mut config = config(vec![Table::new("ghosts"), Table::new("customers")]);
        config.checksum.consistent = true;
        let checksum = Checksum::new(config)
            .unwrap()
            .with_backends(customers("s", 1..=100), customers("t", []));

        let err = checksum.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VerifyError::Chunking { .. }));
    }

    #[tokio::test]
    async fn test_unknown_table_filter_is_config_error() {
        let checksum = Checksum::new(config(Vec::new()))
            .unwrap()
            .with_backends(customers("s", 1..=10), customers("t", 1..=10))
            .with_table_filter(["orders"]);
        let err = checksum.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VerifyError::Config(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_columns_resolved_from_source() {
        let source: Arc<dyn RowSource> = Arc::new(
            FlakySource::new(customers("s", 1..=10)).with_columns(["name", "email"]),
        );
        let checksum = Checksum::new(config(vec![
            Table::new("customers"),
            Table::new("orders").with_columns(["total"]),
        ]))
        .unwrap();

        let tables = checksum.resolve_tables(&source).await.unwrap();
        assert_eq!(tables[0].columns, vec!["name", "email"]);
        assert_eq!(tables[1].columns, vec!["total"]);
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let checksum = Checksum::new(config(Vec::new()))
            .unwrap()
            .with_backends(customers("s", 1..=10), customers("t", []));
        let err = checksum.run(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_health_check_reports_each_side() {
        let checksum = Checksum::new(config(Vec::new())).unwrap();
        let result = checksum.health_check().await;
        assert!(result.healthy);

        let mut config = config(Vec::new());
        config.target.data_file = Some("/nonexistent/reshard-verify.json".to_string());
        let result = Checksum::new(config).unwrap().health_check().await;
        assert!(result.source_connected);
        assert!(!result.target_connected);
        assert!(result.target_error.is_some());
        assert!(!result.healthy);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config(Vec::new());
        config.checksum.chunk_size = Some(0);
        assert!(Checksum::new(config).is_err());
    }

    /// End-to-end against a sharded MySQL-protocol cluster (Vitess vtgate or
    /// TiDB). Settings come from RESHARD_VERIFY_{SOURCE,TARGET}_{HOST,PORT,
    /// USER,PASSWORD,DATABASE}; the source database defaults to
    /// `customer/-80@replica`. Both sides need a `customers` table with
    /// columns `id BIGINT PRIMARY KEY, name VARCHAR(255)`.
    #[tokio::test]
    #[ignore]
    async fn test_sharded_mysql_end_to_end() {
        use mysql_async::prelude::Queryable;

        let db = |side: &str, default_port: u16, default_db: &str| {
            let env = |k: &str| std::env::var(format!("RESHARD_VERIFY_{}_{}", side, k)).ok();
            let mut config = DbConfig::mysql(
                env("HOST").unwrap_or_else(|| "127.0.0.1".into()),
                env("PORT").and_then(|p| p.parse().ok()).unwrap_or(default_port),
                env("DATABASE").unwrap_or_else(|| default_db.into()),
            );
            config.user = env("USER").unwrap_or_else(|| "root".into());
            config.password = env("PASSWORD").unwrap_or_default();
            config
        };
        let source = db("SOURCE", 15306, "customer/-80@replica");
        let target = db("TARGET", 4000, "customer");

        let opts = |c: &DbConfig, database: &str| {
            mysql_async::OptsBuilder::default()
                .ip_or_hostname(c.host.clone())
                .tcp_port(c.port)
                .user(Some(c.user.clone()))
                .pass(Some(c.password.clone()))
                .db_name(Some(database.to_string()))
        };

        // Seed the whole keyspace, then empty the target
        let keyspace = DatabaseTarget::parse(&source.database).unwrap().keyspace;
        let mut conn = mysql_async::Conn::new(opts(&source, &keyspace)).await.unwrap();
        conn.query_drop("DELETE FROM customers").await.unwrap();
        for id in 1..=1000i64 {
            conn.exec_drop(
                "INSERT INTO customers (id, name) VALUES (?, ?)",
                (id, format!("customer {}", id)),
            )
            .await
            .unwrap();
        }
        let mut shard = mysql_async::Conn::new(opts(&source, &source.database)).await.unwrap();
        let expected: Option<u64> = shard
            .query_first("SELECT COUNT(*) FROM customers")
            .await
            .unwrap();
        let mut conn = mysql_async::Conn::new(opts(&target, &target.database)).await.unwrap();
        conn.query_drop("DELETE FROM customers").await.unwrap();

        let checksum = Checksum::new(Config {
            source,
            target,
            checksum: config(vec![Table::new("customers")]).checksum,
        })
        .unwrap();
        let result = checksum.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(Some(result.diffs.len() as u64), expected);
        assert!(result.diffs.iter().all(|d| d.kind == DiffKind::Insert));
    }
}
