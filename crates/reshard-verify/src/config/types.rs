//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Table;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database (usually a sharded cluster, possibly shard-qualified).
    pub source: DbConfig,

    /// Target database.
    pub target: DbConfig,

    /// Diff run configuration.
    #[serde(default)]
    pub checksum: ChecksumConfig,
}

/// Connection settings for one logical database.
#[derive(Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Backend type: "mysql" (MySQL, TiDB, Vitess vtgate) or "memory".
    #[serde(default = "default_mysql")]
    pub r#type: String,

    /// Database host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Database name, optionally shard-qualified: `<keyspace>[/<shard>][@<role>]`.
    pub database: String,

    /// Maximum pooled connections. Defaults to the limiter's cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Admission control for reads against this database.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// JSON file of tables and rows to preload (memory backend only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file: Option<String>,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .field("limiter", &self.limiter)
            .field("data_file", &self.data_file)
            .finish()
    }
}

impl DbConfig {
    /// A MySQL-protocol database on the given host.
    pub fn mysql(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            r#type: default_mysql(),
            host: host.into(),
            port,
            user: String::new(),
            password: String::new(),
            database: database.into(),
            max_connections: None,
            limiter: LimiterConfig::default(),
            data_file: None,
        }
    }

    /// An in-memory database, optionally preloaded from a JSON data file.
    pub fn memory(database: impl Into<String>) -> Self {
        Self {
            r#type: "memory".to_string(),
            ..Self::mysql("", default_mysql_port(), database)
        }
    }

    /// Effective connection pool size.
    pub fn get_max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or(self.limiter.limit.max(self.limiter.max_limit))
            .max(1)
    }
}

/// Limiter algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// Static cap on in-flight reads.
    #[default]
    Fixed,

    /// Additive increase, multiplicative decrease on overload.
    Aimd,
}

/// Admission-control limiter settings for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub kind: LimiterKind,

    /// Initial (fixed: permanent) number of concurrent reads.
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// AIMD floor.
    #[serde(default = "default_min_limit")]
    pub min_limit: usize,

    /// AIMD ceiling.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// AIMD multiplier applied on dropped reads.
    #[serde(default = "default_backoff_ratio")]
    pub backoff_ratio: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            kind: LimiterKind::default(),
            limit: default_limit(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
            backoff_ratio: default_backoff_ratio(),
        }
    }
}

/// Diff run configuration.
/// All tuning fields use Option<T> to distinguish between
/// "not set" (use default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChecksumConfig {
    /// Capacity of the diff output channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,

    /// Target rows per chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Tables chunked concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunker_count: Option<usize>,

    /// Tables read concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_count: Option<usize>,

    /// Concurrent chunk workers per table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_parallelism: Option<usize>,

    /// Retries per read after the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_retries: Option<usize>,

    /// Per-attempt read timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_secs: Option<u64>,

    /// Maximum wait for an admission permit, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_secs: Option<u64>,

    /// First retry delay in milliseconds (doubles per attempt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Upper bound on the retry delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_delay_ms: Option<u64>,

    /// Fail the whole run when any chunk fails (default: best effort).
    #[serde(default)]
    pub consistent: bool,

    /// Tables to diff. Empty means every table the source reports.
    #[serde(default)]
    pub tables: Vec<Table>,
}

impl ChecksumConfig {
    pub fn get_queue_size(&self) -> usize {
        self.queue_size.unwrap_or(10_000)
    }

    pub fn get_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(5_000)
    }

    pub fn get_chunker_count(&self) -> usize {
        self.chunker_count.unwrap_or(10)
    }

    pub fn get_reader_count(&self) -> usize {
        self.reader_count.unwrap_or(20)
    }

    pub fn get_reader_parallelism(&self) -> usize {
        self.reader_parallelism.unwrap_or(20)
    }

    pub fn get_read_retries(&self) -> usize {
        self.read_retries.unwrap_or(10)
    }

    pub fn get_read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.unwrap_or(300))
    }

    pub fn get_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs.unwrap_or(60))
    }

    pub fn get_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.unwrap_or(100))
    }

    pub fn get_retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms.unwrap_or(10_000))
    }
}

// Default value functions for serde
fn default_mysql() -> String {
    "mysql".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_limit() -> usize {
    16
}

fn default_min_limit() -> usize {
    1
}

fn default_max_limit() -> usize {
    64
}

fn default_backoff_ratio() -> f64 {
    0.9
}
