//! # Shard Routing
//!
//! The router maps logical shards onto physical pools with a fixed ratio:
//!
//! ```text
//! shards_per_pool = 16
//!
//!  shard:  0 ... 15 │ 16 ... 31 │ 32 ... 47 │ 48 ... 63
//!          ─────────┼───────────┼───────────┼──────────
//!  pool:       0    │     1     │     2     │     3
//! ```
//!
//! `pool = shard / shards_per_pool`. Many shards colocate on few pools; moving
//! to more pools later means changing the ratio, never the ids.
//!
//! ## Endpoint Canonicalisation
//!
//! Two pool entries can point at the same physical database (a common setup
//! while a cluster is still small). Every pool id is mapped to the first pool
//! with the same endpoint, so batched work is grouped per physical database
//! and never sent to one database twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::PhysicalPool;
use crate::resolver::ShardResolver;
use crate::types::{ObjectId, PoolId, ShardId};

/// Routes shards and object ids to physical pools.
#[derive(Debug)]
pub struct ShardRouter {
    resolver: Arc<dyn ShardResolver>,
    pools: Vec<Arc<PhysicalPool>>,
    /// `canonical[i]` is the first pool sharing pool `i`'s endpoint.
    canonical: Vec<PoolId>,
    shards_per_pool: u32,
}

impl ShardRouter {
    /// Creates a router over `pools`, indexed by position.
    pub fn new(
        resolver: Arc<dyn ShardResolver>,
        pools: Vec<Arc<PhysicalPool>>,
        shards_per_pool: u32,
    ) -> Result<Self> {
        if pools.is_empty() {
            return Err(Error::Config("at least one pool is required".into()));
        }
        if shards_per_pool == 0 {
            return Err(Error::Config("shards_per_pool must be positive".into()));
        }
        for (i, pool) in pools.iter().enumerate() {
            if pool.id().index() != i {
                return Err(Error::Config(format!(
                    "pool at position {} has id {}",
                    i,
                    pool.id()
                )));
            }
        }

        let canonical: Vec<PoolId> = {
            let mut first_by_endpoint: HashMap<&str, PoolId> = HashMap::new();
            pools
                .iter()
                .map(|pool| *first_by_endpoint.entry(pool.endpoint()).or_insert(pool.id()))
                .collect()
        };

        let needed = (resolver.shard_count().saturating_sub(1) / shards_per_pool) as usize + 1;
        if needed > pools.len() {
            tracing::warn!(
                shards = resolver.shard_count(),
                shards_per_pool,
                pools = pools.len(),
                "resolver currently addresses more pools than are configured"
            );
        }

        Ok(Self {
            resolver,
            pools,
            canonical,
            shards_per_pool,
        })
    }

    /// Returns the resolver that bounds the valid shard range.
    pub fn resolver(&self) -> &Arc<dyn ShardResolver> {
        &self.resolver
    }

    /// Returns the number of shards per pool.
    pub fn shards_per_pool(&self) -> u32 {
        self.shards_per_pool
    }

    /// Returns all configured pools.
    pub fn pools(&self) -> &[Arc<PhysicalPool>] {
        &self.pools
    }

    /// Returns the pool with id `pool`.
    pub fn pool(&self, pool: PoolId) -> Result<&Arc<PhysicalPool>> {
        self.pools
            .get(pool.index())
            .ok_or_else(|| Error::Config(format!("unknown pool {}", pool)))
    }

    /// Returns the first pool sharing `pool`'s endpoint.
    pub fn canonical(&self, pool: PoolId) -> PoolId {
        self.canonical.get(pool.index()).copied().unwrap_or(pool)
    }

    /// Maps a shard to its (canonical) pool id.
    ///
    /// Fails with [`Error::ShardRouting`] when the shard is outside the
    /// resolver's valid range or no pool is configured for it.
    pub fn pool_id_for_shard(&self, shard: ShardId) -> Result<PoolId> {
        self.resolver.validate(shard)?;
        let index = (shard.as_raw() / self.shards_per_pool) as usize;
        if index >= self.pools.len() {
            return Err(Error::ShardRouting {
                shard,
                reason: format!(
                    "maps to pool {} but only {} pools are configured",
                    index,
                    self.pools.len()
                ),
            });
        }
        Ok(self.canonical[index])
    }

    /// Maps a shard to its pool.
    pub fn pool_for_shard(&self, shard: ShardId) -> Result<&Arc<PhysicalPool>> {
        let id = self.pool_id_for_shard(shard)?;
        self.pool(id)
    }

    /// Decodes `id` and maps it to its (canonical) pool id.
    pub fn pool_id_for_id(&self, id: &str) -> Result<PoolId> {
        self.pool_id_for_shard(ObjectId::parse(id)?.shard())
    }

    /// Decodes `id` and maps it to its pool.
    pub fn pool_for_id(&self, id: &str) -> Result<&Arc<PhysicalPool>> {
        let pool = self.pool_id_for_id(id)?;
        self.pool(pool)
    }

    /// Groups ids by the pool that stores them.
    ///
    /// Every input id lands in exactly one partition, in input order. The
    /// first undecodable or unroutable id fails the whole call.
    pub fn partition_by_pool<I>(&self, ids: I) -> Result<BTreeMap<PoolId, Vec<String>>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut partitions: BTreeMap<PoolId, Vec<String>> = BTreeMap::new();
        for id in ids {
            let id = id.as_ref();
            let pool = self.pool_id_for_id(id)?;
            partitions.entry(pool).or_default().push(id.to_string());
        }
        Ok(partitions)
    }

    /// Canonical pools that hold at least one currently valid shard.
    pub fn active_pools(&self) -> Vec<PoolId> {
        let max_shard = self.resolver.shard_count().saturating_sub(1);
        let last = ((max_shard / self.shards_per_pool) as usize).min(self.pools.len() - 1);

        let mut out: Vec<PoolId> = Vec::new();
        for index in 0..=last {
            let pool = self.canonical[index];
            if !out.contains(&pool) {
                out.push(pool);
            }
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, DEFAULT_ACQUIRE_TIMEOUT};
    use crate::resolver::HashShardResolver;
    use std::collections::HashSet;

    fn pools(endpoints: &[&str]) -> Vec<Arc<PhysicalPool>> {
        endpoints
            .iter()
            .enumerate()
            .map(|(i, e)| {
                PhysicalPool::new(
                    PoolId::from_raw(i as u32),
                    PoolConfig::new(*e),
                    DEFAULT_ACQUIRE_TIMEOUT,
                )
                .unwrap()
            })
            .collect()
    }

    fn router(endpoints: &[&str], shards: u32, per_pool: u32) -> ShardRouter {
        let resolver = Arc::new(HashShardResolver::new(shards).unwrap());
        ShardRouter::new(resolver, pools(endpoints), per_pool).unwrap()
    }

    #[test]
    fn test_ratio_mapping() {
        let r = router(&["a", "b", "c", "d"], 64, 16);
        assert_eq!(r.pool_id_for_shard(ShardId::from_raw(0)).unwrap().as_raw(), 0);
        assert_eq!(r.pool_id_for_shard(ShardId::from_raw(15)).unwrap().as_raw(), 0);
        assert_eq!(r.pool_id_for_shard(ShardId::from_raw(16)).unwrap().as_raw(), 1);
        assert_eq!(r.pool_id_for_shard(ShardId::from_raw(63)).unwrap().as_raw(), 3);
        assert_eq!(r.pool_for_id("40-abc").unwrap().endpoint(), "c");
    }

    #[test]
    fn test_out_of_range_shard_is_routing_error() {
        let r = router(&["a", "b"], 64, 16);
        assert!(matches!(
            r.pool_id_for_shard(ShardId::from_raw(64)),
            Err(Error::ShardRouting { .. })
        ));
        // valid for the resolver, but pool 2 is not configured
        assert!(matches!(
            r.pool_id_for_shard(ShardId::from_raw(40)),
            Err(Error::ShardRouting { .. })
        ));
        assert!(matches!(r.pool_id_for_id("garbage"), Err(Error::InvalidId { .. })));
    }

    #[test]
    fn test_partition_covers_every_id_once() {
        let r = router(&["a", "b", "c", "d"], 64, 16);
        let ids: Vec<String> = (0..64).map(|s| format!("{}-body{}", s, s)).collect();

        let partitions = r.partition_by_pool(&ids).unwrap();
        assert_eq!(partitions.len(), 4);

        let mut seen = HashSet::new();
        let mut total = 0;
        for (pool, members) in &partitions {
            for id in members {
                assert_eq!(r.pool_id_for_id(id).unwrap(), *pool);
                assert!(seen.insert(id.clone()), "{id} appears twice");
                total += 1;
            }
        }
        assert_eq!(total, ids.len());
        assert_eq!(seen, ids.into_iter().collect::<HashSet<_>>());
    }

    #[test]
    fn test_shared_endpoints_are_canonicalised() {
        let r = router(&["a", "b", "a", "b"], 64, 16);
        assert_eq!(r.canonical(PoolId::from_raw(2)), PoolId::from_raw(0));
        assert_eq!(r.active_pools(), vec![PoolId::from_raw(0), PoolId::from_raw(1)]);

        let partitions = r.partition_by_pool(["1-x", "33-y", "17-z"]).unwrap();
        assert_eq!(partitions[&PoolId::from_raw(0)], vec!["1-x", "33-y"]);
        assert_eq!(partitions[&PoolId::from_raw(1)], vec!["17-z"]);
    }

    #[test]
    fn test_active_pools_follow_resolver_range() {
        let r = router(&["a", "b", "c", "d"], 20, 16);
        assert_eq!(r.active_pools(), vec![PoolId::from_raw(0), PoolId::from_raw(1)]);
    }
}
