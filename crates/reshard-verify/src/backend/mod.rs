//! Database backends and connection resolution.
//!
//! - [`MysqlSource`]: MySQL protocol (MySQL, TiDB, Vitess vtgate)
//! - [`MemorySource`]: in-process tables for tests and dry runs
//!
//! Database names may be shard-qualified the way Vitess addresses them,
//! `<keyspace>[/<shard>][@<role>]`. The name is validated here and passed to
//! the server unchanged.

pub mod memory;
pub mod mysql;

pub use memory::MemorySource;
pub use mysql::MysqlSource;

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::DbConfig;
use crate::core::{Key, PkValue, RowSource};
use crate::error::{Result, VerifyError};

/// Tablet roles accepted after `@`.
const ROLES: &[&str] = &["primary", "master", "replica", "rdonly"];

impl DbConfig {
    /// Resolve this configuration to a live row source.
    pub async fn connect(&self) -> Result<Arc<dyn RowSource>> {
        let target = DatabaseTarget::parse(&self.database)?;
        let source: Arc<dyn RowSource> = match self.r#type.as_str() {
            "mysql" => Arc::new(MysqlSource::connect(self).await?),
            "memory" => Arc::new(MemorySource::from_config(self, &target)?),
            other => {
                return Err(VerifyError::Config(format!(
                    "unsupported database type '{}'",
                    other
                )))
            }
        };
        info!("Connected to {} ({})", source.name(), self.r#type);
        Ok(source)
    }
}

/// A parsed, possibly shard-qualified database name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseTarget {
    pub keyspace: String,
    pub shard: Option<String>,
    pub role: Option<String>,
}

impl DatabaseTarget {
    /// Parse `<keyspace>[/<shard>][@<role>]`.
    pub fn parse(database: &str) -> Result<Self> {
        let (rest, role) = match database.rsplit_once('@') {
            Some((rest, role)) => {
                if !ROLES.contains(&role) {
                    return Err(VerifyError::Config(format!(
                        "unknown tablet role '{}' in '{}'",
                        role, database
                    )));
                }
                (rest, Some(role.to_string()))
            }
            None => (database, None),
        };

        let (keyspace, shard) = match rest.split_once('/') {
            Some((keyspace, shard)) => {
                if shard.is_empty() {
                    return Err(VerifyError::Config(format!(
                        "empty shard in '{}'",
                        database
                    )));
                }
                KeyRange::parse(shard)?;
                (keyspace, Some(shard.to_string()))
            }
            None => (rest, None),
        };

        if keyspace.is_empty() || keyspace.chars().any(char::is_whitespace) {
            return Err(VerifyError::Config(format!(
                "invalid keyspace in '{}'",
                database
            )));
        }

        Ok(Self {
            keyspace: keyspace.to_string(),
            shard,
            role,
        })
    }

    /// Key range of the addressed shard; the full range when unqualified.
    pub fn key_range(&self) -> Result<KeyRange> {
        match &self.shard {
            Some(shard) => KeyRange::parse(shard),
            None => Ok(KeyRange::full()),
        }
    }
}

impl fmt::Display for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyspace)?;
        if let Some(shard) = &self.shard {
            write!(f, "/{}", shard)?;
        }
        if let Some(role) = &self.role {
            write!(f, "@{}", role)?;
        }
        Ok(())
    }
}

/// A shard's keyspace-id range, `<start>-<end>` in hex with either side
/// optional. A shard name without `-` (such as `0`) covers everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    start: Vec<u8>,
    end: Vec<u8>,
}

impl KeyRange {
    pub fn full() -> Self {
        Self {
            start: Vec::new(),
            end: Vec::new(),
        }
    }

    pub fn parse(shard: &str) -> Result<Self> {
        let Some((start, end)) = shard.split_once('-') else {
            return Ok(Self::full());
        };
        let start = decode_hex(start)
            .ok_or_else(|| VerifyError::Config(format!("invalid shard range '{}'", shard)))?;
        let end = decode_hex(end)
            .ok_or_else(|| VerifyError::Config(format!("invalid shard range '{}'", shard)))?;
        if !end.is_empty() && start >= end {
            return Err(VerifyError::Config(format!(
                "shard range '{}' is empty",
                shard
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether the keyspace id falls in this range.
    pub fn contains(&self, keyspace_id: &[u8]) -> bool {
        keyspace_id >= self.start.as_slice()
            && (self.end.is_empty() || keyspace_id < self.end.as_slice())
    }

    /// Whether the row with this primary key belongs to this range.
    pub fn contains_key(&self, key: &Key) -> bool {
        self.contains(&keyspace_id(key))
    }
}

/// Deterministic 8-byte keyspace id for a primary key.
///
/// Spreads sequential keys uniformly so that hex shard ranges split rows
/// roughly evenly.
pub fn keyspace_id(key: &Key) -> [u8; 8] {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for value in key.values() {
        let bytes: Vec<u8> = match value {
            PkValue::Int(v) => v.to_be_bytes().to_vec(),
            PkValue::UInt(v) => v.to_be_bytes().to_vec(),
            PkValue::Text(v) => v.as_bytes().to_vec(),
            PkValue::Bytes(v) => v.clone(),
        };
        for b in bytes {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
    }
    // splitmix64 finalizer
    h ^= h >> 30;
    h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h ^= h >> 27;
    h = h.wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^= h >> 31;
    h.to_be_bytes()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_keyspace() {
        let t = DatabaseTarget::parse("customer").unwrap();
        assert_eq!(t.keyspace, "customer");
        assert_eq!(t.shard, None);
        assert_eq!(t.role, None);
        assert_eq!(t.key_range().unwrap(), KeyRange::full());
    }

    #[test]
    fn test_parse_shard_and_role() {
        let t = DatabaseTarget::parse("customer/-80@replica").unwrap();
        assert_eq!(t.keyspace, "customer");
        assert_eq!(t.shard.as_deref(), Some("-80"));
        assert_eq!(t.role.as_deref(), Some("replica"));
        assert_eq!(t.to_string(), "customer/-80@replica");

        let t = DatabaseTarget::parse("commerce@primary").unwrap();
        assert_eq!(t.shard, None);
        assert_eq!(t.role.as_deref(), Some("primary"));

        let t = DatabaseTarget::parse("customer/0").unwrap();
        assert_eq!(t.key_range().unwrap(), KeyRange::full());
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        for bad in [
            "",
            "/-80",
            "customer/",
            "customer/-8g",
            "customer/80-40",
            "customer@leader",
            "cust omer",
        ] {
            assert!(DatabaseTarget::parse(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn test_key_range_contains() {
        let lower = KeyRange::parse("-80").unwrap();
        let upper = KeyRange::parse("80-").unwrap();
        assert!(lower.contains(&[0x00; 8]));
        assert!(lower.contains(&[0x7f, 0xff, 0, 0, 0, 0, 0, 0]));
        assert!(!lower.contains(&[0x80, 0, 0, 0, 0, 0, 0, 0]));
        assert!(upper.contains(&[0x80, 0, 0, 0, 0, 0, 0, 0]));
        assert!(upper.contains(&[0xff; 8]));

        let middle = KeyRange::parse("40-c0").unwrap();
        assert!(middle.contains(&[0x40, 0, 0, 0, 0, 0, 0, 0]));
        assert!(!middle.contains(&[0xc0, 0, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_every_key_lands_in_exactly_one_shard() {
        let shards = [
            KeyRange::parse("-40").unwrap(),
            KeyRange::parse("40-80").unwrap(),
            KeyRange::parse("80-c0").unwrap(),
            KeyRange::parse("c0-").unwrap(),
        ];
        let mut per_shard = [0usize; 4];
        for id in 1..=1000 {
            let key = Key::from(id);
            let hits: Vec<usize> = (0..4).filter(|i| shards[*i].contains_key(&key)).collect();
            assert_eq!(hits.len(), 1);
            per_shard[hits[0]] += 1;
        }
        assert!(per_shard.iter().all(|n| *n > 100), "{:?}", per_shard);
    }
}
