//! Error types for the verification library.

use std::time::Duration;
use thiserror::Error;

/// MySQL server error codes that indicate a retryable condition.
const TRANSIENT_SERVER_CODES: &[u16] = &[
    1040, // ER_CON_COUNT_ERROR (too many connections)
    1053, // ER_SERVER_SHUTDOWN
    1205, // ER_LOCK_WAIT_TIMEOUT
    1213, // ER_LOCK_DEADLOCK
    2006, // CR_SERVER_GONE_ERROR
    2013, // CR_SERVER_LOST
];

/// Main error type for verification operations.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Configuration error (invalid YAML, missing fields, bad values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend query failure reported by a row source.
    #[error("Query failed on {backend} ({context}): {message}")]
    Query {
        backend: String,
        context: String,
        message: String,
        transient: bool,
    },

    /// MySQL driver error with context about where it occurred.
    #[error("MySQL error on {backend} ({context}): {source}")]
    Mysql {
        backend: String,
        context: String,
        #[source]
        source: mysql_async::Error,
    },

    /// A single attempt ran past its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// No admission permit could be obtained in time.
    #[error("Admission limiter for {backend} saturated, waited {waited:?}")]
    LimiterSaturated { backend: String, waited: Duration },

    /// Every retry attempt failed.
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        #[source]
        source: Box<VerifyError>,
    },

    /// Key-space discovery failed; the table cannot be read.
    #[error("Chunking failed for table {table}")]
    Chunking {
        table: String,
        #[source]
        source: Box<VerifyError>,
    },

    /// A single chunk could not be read or diffed.
    #[error("Chunk {table}{range} failed")]
    Chunk {
        table: String,
        range: String,
        #[source]
        source: Box<VerifyError>,
    },

    /// The diff consumer went away while chunks were still emitting.
    #[error("Diff output channel closed")]
    OutputClosed,

    /// A worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Task(String),

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was cancelled (SIGINT, consistent-mode abort, caller).
    #[error("Verification cancelled")]
    Cancelled,
}

impl VerifyError {
    /// Create a Query error.
    pub fn query(
        backend: impl Into<String>,
        context: impl Into<String>,
        message: impl Into<String>,
        transient: bool,
    ) -> Self {
        VerifyError::Query {
            backend: backend.into(),
            context: context.into(),
            message: message.into(),
            transient,
        }
    }

    /// Wrap a MySQL driver error with the backend name and operation.
    pub fn mysql(
        backend: impl Into<String>,
        context: impl Into<String>,
        source: mysql_async::Error,
    ) -> Self {
        VerifyError::Mysql {
            backend: backend.into(),
            context: context.into(),
            source,
        }
    }

    /// Wrap a chunk failure with its table and range.
    pub fn chunk(table: impl Into<String>, range: impl Into<String>, source: VerifyError) -> Self {
        VerifyError::Chunk {
            table: table.into(),
            range: range.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a chunking failure with its table.
    pub fn chunking(table: impl Into<String>, source: VerifyError) -> Self {
        VerifyError::Chunking {
            table: table.into(),
            source: Box::new(source),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            VerifyError::Query { transient, .. } => *transient,
            VerifyError::Mysql { source, .. } => is_transient_mysql(source),
            VerifyError::Timeout { .. } | VerifyError::LimiterSaturated { .. } => true,
            _ => false,
        }
    }

    /// Whether this error is (or wraps) a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            VerifyError::Cancelled => true,
            VerifyError::Chunk { source, .. }
            | VerifyError::Chunking { source, .. }
            | VerifyError::RetriesExhausted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            VerifyError::Config(_) | VerifyError::Yaml(_) => 2,
            e if e.is_cancelled() => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

fn is_transient_mysql(err: &mysql_async::Error) -> bool {
    match err {
        mysql_async::Error::Io(_) => true,
        mysql_async::Error::Server(e) => TRANSIENT_SERVER_CODES.contains(&e.code),
        mysql_async::Error::Driver(mysql_async::DriverError::ConnectionClosed) => true,
        mysql_async::Error::Driver(mysql_async::DriverError::PoolDisconnected) => true,
        _ => false,
    }
}

/// Result type alias for verification operations.
pub type Result<T> = std::result::Result<T, VerifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(VerifyError::query("src", "read", "reset", true).is_transient());
        assert!(!VerifyError::query("src", "read", "syntax", false).is_transient());
        assert!(VerifyError::Timeout {
            operation: "read".into(),
            timeout: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!VerifyError::Cancelled.is_transient());
        assert!(!VerifyError::Config("bad".into()).is_transient());
    }

    #[test]
    fn test_cancelled_detected_through_wrappers() {
        let err = VerifyError::chunk("customers", "[1, 5)", VerifyError::Cancelled);
        assert!(err.is_cancelled());
        assert_eq!(err.exit_code(), 130);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let err = VerifyError::chunk(
            "customers",
            "[1, 5)",
            VerifyError::RetriesExhausted {
                operation: "read source".into(),
                attempts: 3,
                source: Box::new(VerifyError::query("source", "read", "connection reset", true)),
            },
        );
        let detailed = err.format_detailed();
        assert!(detailed.contains("Chunk customers[1, 5) failed"));
        assert!(detailed.contains("after 3 attempts"));
        assert!(detailed.contains("connection reset"));
    }
}
