//! Configuration validation.

use super::{Config, DbConfig, LimiterConfig};
use crate::backend::DatabaseTarget;
use crate::error::{Result, VerifyError};

const BACKEND_TYPES: &[&str] = &["mysql", "memory"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_db("source", &config.source)?;
    validate_db("target", &config.target)?;

    // Cannot diff a database against itself
    if config.source.r#type == "mysql"
        && config.target.r#type == "mysql"
        && config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(VerifyError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    // Checksum config validation - only check if explicitly set
    let checksum = &config.checksum;
    for (name, value) in [
        ("queue_size", checksum.queue_size),
        ("chunk_size", checksum.chunk_size),
        ("chunker_count", checksum.chunker_count),
        ("reader_count", checksum.reader_count),
        ("reader_parallelism", checksum.reader_parallelism),
    ] {
        if let Some(0) = value {
            return Err(VerifyError::Config(format!(
                "checksum.{} must be at least 1",
                name
            )));
        }
    }
    if let Some(0) = checksum.read_timeout_secs {
        return Err(VerifyError::Config(
            "checksum.read_timeout_secs must be at least 1".into(),
        ));
    }
    if checksum.get_retry_base_delay() > checksum.get_retry_max_delay() {
        return Err(VerifyError::Config(
            "checksum.retry_base_delay_ms cannot exceed retry_max_delay_ms".into(),
        ));
    }

    for table in &checksum.tables {
        if table.name.is_empty() {
            return Err(VerifyError::Config("checksum.tables: name is required".into()));
        }
        if table.key_columns.is_empty() {
            return Err(VerifyError::Config(format!(
                "checksum.tables: table {} needs at least one key column",
                table.name
            )));
        }
    }

    Ok(())
}

fn validate_db(side: &str, db: &DbConfig) -> Result<()> {
    if !BACKEND_TYPES.contains(&db.r#type.as_str()) {
        return Err(VerifyError::Config(format!(
            "{}.type must be one of {:?}, got '{}'",
            side, BACKEND_TYPES, db.r#type
        )));
    }
    if db.database.is_empty() {
        return Err(VerifyError::Config(format!("{}.database is required", side)));
    }
    if db.r#type == "mysql" && db.host.is_empty() {
        return Err(VerifyError::Config(format!("{}.host is required", side)));
    }
    if db.r#type != "memory" && db.data_file.is_some() {
        return Err(VerifyError::Config(format!(
            "{}.data_file is only supported for memory databases",
            side
        )));
    }
    if let Some(0) = db.max_connections {
        return Err(VerifyError::Config(format!(
            "{}.max_connections must be at least 1",
            side
        )));
    }

    DatabaseTarget::parse(&db.database).map_err(|e| match e {
        VerifyError::Config(msg) => VerifyError::Config(format!("{}.database: {}", side, msg)),
        other => other,
    })?;

    validate_limiter(side, &db.limiter)
}

fn validate_limiter(side: &str, limiter: &LimiterConfig) -> Result<()> {
    if limiter.limit == 0 {
        return Err(VerifyError::Config(format!(
            "{}.limiter.limit must be at least 1",
            side
        )));
    }
    if limiter.min_limit == 0 || limiter.min_limit > limiter.max_limit {
        return Err(VerifyError::Config(format!(
            "{}.limiter: need 1 <= min_limit <= max_limit",
            side
        )));
    }
    if !(limiter.backoff_ratio > 0.0 && limiter.backoff_ratio < 1.0) {
        return Err(VerifyError::Config(format!(
            "{}.limiter.backoff_ratio must be between 0 and 1",
            side
        )));
    }
    Ok(())
}
