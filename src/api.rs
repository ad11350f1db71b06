//! # Async Facade
//!
//! [`ShardedDao`] is blocking: every call may wait on a pooled connection,
//! run SQLite statements and fan out over the rayon workers. [`ShardStore`]
//! lets async applications call it without stalling the runtime.
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  Tokio Runtime                  │
//! │   task1 ─┐                                      │
//! │   task2 ─┼─► ShardStore (Clone) ─► spawn_blocking
//! │   task3 ─┘                              │       │
//! └─────────────────────────────────────────┼───────┘
//!                                           ▼
//!                          ┌────────────────────────────┐
//!                          │  blocking thread           │
//!                          │  ShardedDao ─► FanOut ─► pools
//!                          └────────────────────────────┘
//! ```
//!
//! A blocking closure must own everything it touches, so the facade takes
//! owned arguments and shares request contexts as `Arc<RequestContext>`.
//!
//! ## Rust Concepts
//!
//! - **spawn_blocking**: runs synchronous work on tokio's blocking pool
//! - **'static closures**: the task may outlive the caller's stack frame
//! - **JoinError**: a panicked blocking task surfaces as [`Error::Worker`]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::cluster::Cluster;
use crate::context::{Outcome, RequestContext};
use crate::dao::{MetricsSnapshot, Paging, ShardedDao, Target};
use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::types::{FieldValue, IndexedData, ObjectData};

/// Shared request context for async callers.
pub type SharedContext = Arc<RequestContext>;

/// Async handle to one entity's dao.
///
/// # Thread Safety
///
/// `ShardStore` is `Clone`, `Send` and `Sync`. All clones share one dao,
/// so cache, metrics and connection affinity are common to them.
#[derive(Debug, Clone)]
pub struct ShardStore {
    dao: Arc<ShardedDao>,
}

impl ShardStore {
    /// Wraps an existing dao.
    pub fn new(dao: ShardedDao) -> Self {
        Self { dao: Arc::new(dao) }
    }

    /// Builds a store for `entity` on `cluster`.
    pub fn open(cluster: &Cluster, entity: EntityKind) -> Self {
        Self::new(cluster.dao(entity))
    }

    /// Returns the underlying blocking dao.
    pub fn dao(&self) -> &Arc<ShardedDao> {
        &self.dao
    }

    /// Returns the dao's request counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.dao.metrics()
    }

    /// Runs `f` against the dao on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ShardedDao) -> Result<T> + Send + 'static,
    {
        let dao = Arc::clone(&self.dao);
        tokio::task::spawn_blocking(move || f(&dao))
            .await
            .map_err(|e| Error::Worker(format!("blocking task failed: {}", e)))?
    }

    /// Inserts a record. See [`ShardedDao::create`].
    pub async fn create(&self, ctx: Option<SharedContext>, record: ObjectData) -> Result<ObjectData> {
        self.blocking(move |dao| dao.create(ctx.as_deref(), record)).await
    }

    /// Replaces a record's payload. See [`ShardedDao::update`].
    pub async fn update(&self, ctx: Option<SharedContext>, record: ObjectData) -> Result<Option<ObjectData>> {
        self.blocking(move |dao| dao.update(ctx.as_deref(), record)).await
    }

    /// Deletes a record.
    pub async fn delete(&self, ctx: Option<SharedContext>, id: impl Into<String>) -> Result<bool> {
        let id = id.into();
        self.blocking(move |dao| dao.delete(ctx.as_deref(), &id)).await
    }

    /// Deletes many records.
    pub async fn delete_many(&self, ctx: Option<SharedContext>, ids: Vec<String>) -> Result<usize> {
        self.blocking(move |dao| dao.delete_many(ctx.as_deref(), &ids)).await
    }

    /// Looks up one record.
    pub async fn lookup(&self, ctx: Option<SharedContext>, id: impl Into<String>) -> Result<Option<ObjectData>> {
        let id = id.into();
        self.blocking(move |dao| dao.lookup(ctx.as_deref(), &id)).await
    }

    /// Looks up many records in `ids` order.
    pub async fn lookup_many(&self, ctx: Option<SharedContext>, ids: Vec<String>) -> Result<Vec<ObjectData>> {
        self.blocking(move |dao| dao.lookup_many(ctx.as_deref(), &ids)).await
    }

    /// Looks up many records keyed by id.
    pub async fn lookup_map(
        &self,
        ctx: Option<SharedContext>,
        ids: Vec<String>,
    ) -> Result<HashMap<String, ObjectData>> {
        self.blocking(move |dao| dao.lookup_map(ctx.as_deref(), &ids)).await
    }

    /// Lists records newest first.
    pub async fn scan(&self, ctx: Option<SharedContext>, paging: Paging) -> Result<Vec<ObjectData>> {
        self.blocking(move |dao| dao.scan(ctx.as_deref(), paging)).await
    }

    /// Counts records across pools.
    pub async fn count(&self, ctx: Option<SharedContext>) -> Result<i64> {
        self.blocking(move |dao| dao.count(ctx.as_deref())).await
    }

    /// Writes one index row.
    pub async fn create_index_row(
        &self,
        ctx: Option<SharedContext>,
        index: impl Into<String>,
        row: IndexedData,
    ) -> Result<()> {
        let index = index.into();
        self.blocking(move |dao| dao.create_index_row(ctx.as_deref(), &index, &row))
            .await
    }

    /// Removes the index rows of `id`.
    pub async fn delete_index_row(
        &self,
        ctx: Option<SharedContext>,
        index: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<usize> {
        let (index, id) = (index.into(), id.into());
        self.blocking(move |dao| dao.delete_index_row(ctx.as_deref(), &index, &id))
            .await
    }

    /// Finds index rows. See [`ShardedDao::index_lookup`].
    pub async fn index_lookup(
        &self,
        ctx: Option<SharedContext>,
        index: impl Into<String>,
        values: BTreeMap<String, FieldValue>,
        paging: Paging,
        target: Target,
    ) -> Result<Vec<IndexedData>> {
        let index = index.into();
        self.blocking(move |dao| dao.index_lookup(ctx.as_deref(), &index, &values, paging, target))
            .await
    }

    /// Counts index rows.
    pub async fn index_count(
        &self,
        ctx: Option<SharedContext>,
        index: impl Into<String>,
        values: BTreeMap<String, FieldValue>,
        target: Target,
    ) -> Result<i64> {
        let index = index.into();
        self.blocking(move |dao| dao.index_count(ctx.as_deref(), &index, &values, target))
            .await
    }

    /// Finds index rows and resolves them to records.
    pub async fn index_objects(
        &self,
        ctx: Option<SharedContext>,
        index: impl Into<String>,
        values: BTreeMap<String, FieldValue>,
        paging: Paging,
    ) -> Result<Vec<ObjectData>> {
        let index = index.into();
        self.blocking(move |dao| dao.index_objects(ctx.as_deref(), &index, &values, paging, Target::All))
            .await
    }

    /// Commits or rolls back every pool `ctx` touched and releases its
    /// connections.
    pub async fn finish(&self, ctx: SharedContext, outcome: Outcome) -> Result<()> {
        self.blocking(move |dao| dao.finish(&ctx, outcome)).await
    }
}

// =============================================================================
// Tests
// =============================================================================
