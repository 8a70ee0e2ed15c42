//! # reshard-verify
//!
//! Concurrent chunked row-level diff between a (possibly sharded) source
//! database and a target database, used to verify a reshard or migration.
//!
//! Each table's primary-key space is split into half-open chunks, chunks are
//! read from both sides in parallel, and rows are merged by key into
//! insert, update and delete diffs. Features:
//!
//! - **Shard-qualified sources** such as `customer/-80@replica` (Vitess
//!   syntax), passed through to the server
//! - **Admission limiters** per backend (fixed or AIMD) with bounded retries
//! - **Consistent or best-effort** failure policies
//! - **Streaming output** with backpressure, or collected results
//!
//! ## Example
//!
//! ```rust,no_run
//! use reshard_verify::{Checksum, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> reshard_verify::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let checksum = Checksum::new(config)?;
//!     let result = checksum.run(&CancellationToken::new()).await?;
//!     println!("Found {} differences", result.totals().total());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod checksum;
pub mod chunk;
pub mod config;
pub mod core;
pub mod diff;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod reader;
pub mod retry;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use backend::{DatabaseTarget, KeyRange, MemorySource, MysqlSource};
pub use checksum::{Checksum, ChecksumResult, HealthCheckResult};
pub use chunk::Chunk;
pub use config::{ChecksumConfig, Config, DbConfig, LimiterConfig, LimiterKind};
pub use core::{Key, PkValue, Row, RowSource, SqlValue, Table};
pub use diff::{Diff, DiffCounts, DiffKind};
pub use error::{Result, VerifyError};
pub use limiter::Limiter;
pub use metrics::{MetricsCollector, NoopMetrics, RecordingMetrics};
pub use reader::{ReadMode, ReadSummary, Reader, ReaderConfig};
