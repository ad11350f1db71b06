//! # dbshard - Sharded Data Access over SQLite Pools
//!
//! dbshard spreads the records of an application across many physical
//! databases and hides the spread behind one data-access object per entity:
//!
//! - **Shard resolution**: hash or time-window based choice of a logical shard
//! - **Routing**: logical shards map onto physical pools, many to one
//! - **Fan-out**: multi-pool queries run concurrently and are merged
//! - **Caching**: read-through cache that remembers absent records too
//! - **Request affinity**: one connection per pool for a whole request
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 ShardStore (async) / ShardedDao                 │
//! │          lookup, create, update, delete, index queries          │
//! └──────────────┬──────────────────────────────┬───────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐     ┌──────────────────────────────┐
//! │      CacheFront          │     │   ShardRouter                │
//! │  Absent | Object | Index │     │   id ─► shard ─► pool        │
//! └──────────────────────────┘     └──────────────┬───────────────┘
//!                                                 │
//!                                                 ▼
//!                     ┌───────────────────────────────────────────┐
//!                     │ FanOut (rayon)  +  ConnectionAffinity     │
//!                     └──────┬──────────────┬──────────────┬──────┘
//!                            ▼              ▼              ▼
//!                      ┌──────────┐   ┌──────────┐   ┌──────────┐
//!                      │  pool 0  │   │  pool 1  │   │  pool N  │
//!                      │ (SQLite) │   │ (SQLite) │   │ (SQLite) │
//!                      └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Stable placement**: an id's shard is encoded in the id and never changes
//! 2. **One endpoint, one query**: pools sharing an endpoint are queried once
//! 3. **Ordered bulk reads**: bulk lookups return records in request order
//! 4. **Remembered absence**: a confirmed miss is cached and not re-queried
//! 5. **Affinity**: within a request, each pool is used through one connection
//!
//! ## Module Organization
//!
//! - [`error`]: Error types for every failure mode
//! - [`types`]: Ids, records and lookup values
//! - [`resolver`]: Hash and time-window shard resolvers
//! - [`pool`]: Bounded SQLite connection pools
//! - [`router`]: Shard to pool routing
//! - [`context`]: Request contexts and connection affinity
//! - [`fanout`]: Concurrent multi-pool execution
//! - [`cache`]: Cache backends and the sentinel-aware front
//! - [`entity`]: Entity and index table declarations
//! - [`schema`]: Table provisioning
//! - [`dao`]: The sharded data-access object
//! - [`cluster`]: Composition root
//! - [`config`]: TOML configuration
//! - [`api`]: Async facade (main entry point for async callers)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for dbshard operations.
///
/// A single error enum covers id parsing, routing, pool, cache and
/// fan-out failures.
pub mod error;

/// Domain types.
///
/// Shard and pool ids use the newtype pattern; [`types::ObjectId`] encodes
/// its shard in its textual form.
pub mod types;

/// Shard resolvers.
pub mod resolver;

/// Physical connection pools.
///
/// Each pool owns a bounded set of SQLite connections to one endpoint and
/// knows whether its connections run in autocommit mode.
pub mod pool;

/// Routing from shards and ids to pools.
pub mod router;

/// Request contexts and per-request connection pinning.
pub mod context;

/// Concurrent execution across pools on a shared worker pool.
pub mod fanout;

/// Cache backends and the cache front used by the dao.
pub mod cache;

/// Statically declared entities and index tables.
pub mod entity;

/// Creates entity tables on every physical database.
pub mod schema;

/// The sharded data-access object.
///
/// [`ShardedDao`](dao::ShardedDao) routes single-record operations to one
/// pool, fans bulk and index operations out across pools and keeps the
/// cache in step with its writes.
pub mod dao;

/// Composition root tying pools, router, workers and cache together.
pub mod cluster;

/// Cluster configuration loaded from TOML.
pub mod config;

/// Async API over the blocking dao.
///
/// The main entry point for async callers is [`ShardStore`](api::ShardStore).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{SharedContext, ShardStore};
pub use cache::{CacheBackend, CacheEntry, LruCacheBackend, NoopCache};
pub use cluster::{Cluster, ClusterBuilder};
pub use config::{ClusterConfig, ResolverConfig};
pub use context::{Outcome, RequestContext};
pub use dao::{FromRow, MetricsSnapshot, Paging, ShardedDao, Target};
pub use entity::{ColumnType, EntityKind, IndexDef};
pub use error::{Error, Result};
pub use pool::PoolConfig;
pub use resolver::{Granularity, HashShardResolver, ShardResolver, TimedShardResolver};
pub use types::{FieldValue, IndexedData, ObjectData, ObjectId, PoolId, Shardable, ShardId};
