//! # Cluster
//!
//! The composition root. A [`Cluster`] owns the pools, the router, the
//! fan-out workers, the connection affinity map and the cache backend, and
//! hands out one [`ShardedDao`] per entity kind. Nothing in the crate is
//! global: two clusters in one process are fully independent.
//!
//! ```text
//!                       ┌──────────── Cluster ─────────────┐
//!  ClusterConfig ─────► │ resolver ─► router ─► pools[..]  │
//!   or builder          │ fan-out workers (rayon)          │
//!                       │ connection affinity              │
//!                       │ cache backend                    │
//!                       └───────┬──────────────┬───────────┘
//!                         dao(user)       dao(order)
//! ```
//!
//! Daos of one cluster share the affinity map, so a request context that
//! touches several entities still holds one connection per pool.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheBackend, CacheFront, LruCacheBackend, NoopCache};
use crate::config::ClusterConfig;
use crate::context::{ConnectionAffinity, Outcome, RequestContext};
use crate::dao::ShardedDao;
use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::fanout::FanOut;
use crate::pool::{PhysicalPool, PoolConfig, DEFAULT_ACQUIRE_TIMEOUT};
use crate::resolver::ShardResolver;
use crate::router::ShardRouter;
use crate::schema;
use crate::types::PoolId;

/// Shared handles for every dao of one sharded deployment.
#[derive(Debug, Clone)]
pub struct Cluster {
    router: Arc<ShardRouter>,
    affinity: Arc<ConnectionAffinity>,
    fanout: FanOut,
    cache: Arc<dyn CacheBackend>,
}

impl Cluster {
    /// Starts a programmatic cluster definition.
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }

    /// Builds a cluster from configuration.
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = Cluster::builder()
            .resolver(config.resolver.build()?)
            .shards_per_pool(config.shards_per_pool)
            .workers(config.workers)
            .acquire_timeout(config.acquire_timeout());
        if let Some(cache) = &config.cache {
            builder = builder.cache(Arc::new(LruCacheBackend::new(cache.capacity)?));
        }
        for pool in &config.pools {
            builder = builder.pool(pool.clone());
        }
        builder.build()
    }

    /// Returns the router.
    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// Returns the physical pools.
    pub fn pools(&self) -> &[Arc<PhysicalPool>] {
        self.router.pools()
    }

    /// Returns the fan-out executor.
    pub fn fanout(&self) -> &FanOut {
        &self.fanout
    }

    /// Returns the connection affinity map.
    pub fn affinity(&self) -> &Arc<ConnectionAffinity> {
        &self.affinity
    }

    /// Creates `entity`'s tables on every physical database.
    pub fn provision(&self, entity: &EntityKind) -> Result<usize> {
        schema::provision(self.router.pools(), entity)
    }

    /// Returns a dao for `entity`.
    pub fn dao(&self, entity: EntityKind) -> ShardedDao {
        let cache = CacheFront::new(Arc::clone(&self.cache), entity.name());
        ShardedDao::new(entity, self.fanout.clone(), Arc::clone(&self.affinity), cache)
    }

    /// Commits or rolls back every pool `ctx` touched, through any dao, and
    /// releases its connections.
    pub fn finish(&self, ctx: &RequestContext, outcome: Outcome) -> Result<()> {
        let completed = self.affinity.complete_all(&self.fanout, ctx, outcome);
        self.affinity.release(ctx)?;
        completed
    }
}

/// Builder for [`Cluster`].
#[derive(Debug)]
pub struct ClusterBuilder {
    resolver: Option<Arc<dyn ShardResolver>>,
    pools: Vec<PoolConfig>,
    shards_per_pool: u32,
    workers: usize,
    acquire_timeout: Duration,
    cache: Arc<dyn CacheBackend>,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self {
            resolver: None,
            pools: Vec::new(),
            shards_per_pool: 1,
            workers: 0,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            cache: Arc::new(NoopCache),
        }
    }
}

impl ClusterBuilder {
    /// Sets the shard resolver.
    pub fn resolver(mut self, resolver: Arc<dyn ShardResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Appends a pool; pools get ids in the order they are added.
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pools.push(config);
        self
    }

    /// Sets the shards-per-pool ratio.
    pub fn shards_per_pool(mut self, n: u32) -> Self {
        self.shards_per_pool = n;
        self
    }

    /// Sets the fan-out worker count (0 = CPU count).
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    /// Sets how long callers wait for a pooled connection.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the cache backend.
    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = cache;
        self
    }

    /// Builds the cluster. No connection is opened yet.
    pub fn build(self) -> Result<Cluster> {
        let resolver = self
            .resolver
            .ok_or_else(|| Error::Config("a shard resolver is required".into()))?;
        let pools = self
            .pools
            .into_iter()
            .enumerate()
            .map(|(i, config)| PhysicalPool::new(PoolId::from_raw(i as u32), config, self.acquire_timeout))
            .collect::<Result<Vec<_>>>()?;

        let router = Arc::new(ShardRouter::new(resolver, pools, self.shards_per_pool)?);
        let fanout = FanOut::new(Arc::clone(&router), self.workers)?;
        tracing::info!(
            pools = router.pools().len(),
            active = router.active_pools().len(),
            shards_per_pool = router.shards_per_pool(),
            workers = fanout.worker_count(),
            "cluster ready"
        );

        Ok(Cluster {
            router,
            affinity: Arc::new(ConnectionAffinity::new()),
            fanout,
            cache: self.cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::HashShardResolver;

    #[test]
    fn test_builder_requires_resolver() {
        let err = Cluster::builder().pool(PoolConfig::new("a")).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_config() {
        let config = ClusterConfig::from_toml_str(
            r#"
shards_per_pool = 2
workers = 2
pools = [{ endpoint = "/tmp/a.db" }, { endpoint = "/tmp/b.db" }]

[resolver]
kind = "hash"
shards = 4

[cache]
capacity = 10
"#,
        )
        .unwrap();
        let cluster = Cluster::from_config(&config).unwrap();
        assert_eq!(cluster.pools().len(), 2);
        assert_eq!(cluster.fanout().worker_count(), 2);
        assert_eq!(cluster.router().active_pools().len(), 2);
    }

    #[test]
    fn test_daos_share_affinity() {
        let cluster = Cluster::builder()
            .resolver(Arc::new(HashShardResolver::new(4).unwrap()))
            .shards_per_pool(4)
            .pool(PoolConfig::new("/tmp/unused.db"))
            .workers(1)
            .build()
            .unwrap();
        let users = cluster.dao(EntityKind::new("user").unwrap());
        let orders = cluster.dao(EntityKind::new("order").unwrap());
        assert_eq!(users.entity().name(), "user");
        assert_eq!(orders.entity().name(), "order");
        assert_eq!(cluster.affinity().pinned_count(), 0);
    }
}
