//! # Cluster Configuration
//!
//! A cluster is described by one TOML document: the shards-per-pool ratio,
//! the resolver, the optional cache and the physical pools in pool-id order.
//!
//! ```toml
//! shards_per_pool = 16
//! workers = 8
//!
//! [resolver]
//! kind = "monthly"
//! start = "2015-01-01T00:00:00Z"
//!
//! [cache]
//! capacity = 100000
//!
//! [[pools]]
//! endpoint = "data/pool0.db"
//! size = 8
//!
//! [[pools]]
//! endpoint = "data/pool1.db"
//! autocommit = false
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::{PoolConfig, DEFAULT_ACQUIRE_TIMEOUT};
use crate::resolver::{Granularity, HashShardResolver, ShardResolver, TimedShardResolver};

/// Top-level cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Logical shards per physical pool.
    #[serde(default = "default_shards_per_pool")]
    pub shards_per_pool: u32,

    /// Fan-out worker threads; 0 uses the CPU count.
    #[serde(default)]
    pub workers: usize,

    /// How long a caller waits for a pooled connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Shard resolver.
    pub resolver: ResolverConfig,

    /// In-process cache; no cache when absent.
    #[serde(default)]
    pub cache: Option<CacheConfig>,

    /// Physical pools, indexed by position.
    pub pools: Vec<PoolConfig>,
}

/// How shards are chosen for new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    /// `hash % shards`.
    Hash {
        /// Fixed number of shards.
        shards: u32,
    },
    /// Windows of a fixed length.
    FixedInterval {
        /// Start of shard 0.
        start: DateTime<Utc>,
        /// Window length in milliseconds.
        interval_ms: i64,
    },
    /// One shard per day.
    Daily {
        /// Start of shard 0.
        start: DateTime<Utc>,
    },
    /// One shard per `weeks` weeks.
    Weekly {
        /// Start of shard 0.
        start: DateTime<Utc>,
        /// Window width in weeks.
        #[serde(default = "default_weeks")]
        weeks: u32,
    },
    /// One shard per calendar month.
    Monthly {
        /// Start of shard 0.
        start: DateTime<Utc>,
    },
    /// One shard per calendar year.
    Yearly {
        /// Start of shard 0.
        start: DateTime<Utc>,
    },
}

/// In-process cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached entries.
    pub capacity: usize,
}

fn default_shards_per_pool() -> u32 {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT.as_millis() as u64
}

fn default_weeks() -> u32 {
    1
}

impl ResolverConfig {
    /// Builds the resolver.
    pub fn build(&self) -> Result<Arc<dyn ShardResolver>> {
        let timed = |start: &DateTime<Utc>, g: Granularity| -> Result<Arc<dyn ShardResolver>> {
            Ok(Arc::new(TimedShardResolver::new(*start, g)?))
        };
        match self {
            ResolverConfig::Hash { shards } => Ok(Arc::new(HashShardResolver::new(*shards)?)),
            ResolverConfig::FixedInterval { start, interval_ms } => timed(
                start,
                Granularity::FixedInterval {
                    interval_ms: *interval_ms,
                },
            ),
            ResolverConfig::Daily { start } => timed(start, Granularity::Daily),
            ResolverConfig::Weekly { start, weeks } => timed(start, Granularity::Weekly { weeks: *weeks }),
            ResolverConfig::Monthly { start } => timed(start, Granularity::Monthly),
            ResolverConfig::Yearly { start } => timed(start, Granularity::Yearly),
        }
    }
}

impl ClusterConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClusterConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Acquire timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.shards_per_pool == 0 {
            return Err(Error::Config("shards_per_pool must be > 0".into()));
        }
        if self.pools.is_empty() {
            return Err(Error::Config("at least one [[pools]] entry is required".into()));
        }
        for (i, pool) in self.pools.iter().enumerate() {
            if pool.endpoint.is_empty() {
                return Err(Error::Config(format!("pools[{}].endpoint is empty", i)));
            }
            if pool.size == 0 {
                return Err(Error::Config(format!("pools[{}].size must be > 0", i)));
            }
        }
        if let Some(cache) = &self.cache {
            if cache.capacity == 0 {
                return Err(Error::Config("cache.capacity must be > 0".into()));
            }
        }
        if let ResolverConfig::Hash { shards } = self.resolver {
            let needed = (shards.saturating_sub(1) / self.shards_per_pool) as usize + 1;
            if shards == 0 || needed > self.pools.len() {
                return Err(Error::Config(format!(
                    "{} shards at {} per pool need {} pools, {} configured",
                    shards,
                    self.shards_per_pool,
                    needed,
                    self.pools.len()
                )));
            }
        }
        Ok(())
    }
}
