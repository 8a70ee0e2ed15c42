//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{Result, VerifyError};
use crate::reader::ReaderConfig;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            VerifyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl ChecksumConfig {
    /// Per-table reader settings derived from the run settings.
    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            chunk_size: self.get_chunk_size(),
            reader_parallelism: self.get_reader_parallelism(),
            read_retries: self.get_read_retries(),
            read_timeout: self.get_read_timeout(),
            acquire_timeout: self.get_acquire_timeout(),
            retry_base_delay: self.get_retry_base_delay(),
            retry_max_delay: self.get_retry_max_delay(),
            consistent: self.consistent,
        }
    }
}
