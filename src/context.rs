//! # Request Contexts and Connection Affinity
//!
//! A [`RequestContext`] correlates all work of one logical request. While it
//! lives, every operation on a given pool reuses the same connection, so a
//! non-autocommit pool sees the whole request as one transaction.
//!
//! ```text
//!   RequestContext #7                  ConnectionAffinity
//!   ┌──────────────────┐               ┌──────────────────────────────┐
//!   │ setup_lock       │               │ (7, pool 0) → conn ──┐       │
//!   │ touched {0, 2}   │               │ (7, pool 2) → conn   │ one   │
//!   └──────────────────┘               │ (9, pool 0) → conn   │ each  │
//!                                      └──────────────────────┴───────┘
//! ```
//!
//! ## Two Lock Scopes
//!
//! - The context's `setup_lock` serialises find-or-create for that context, so
//!   two threads sharing a context never open two connections to one pool.
//! - The affinity map has its own lock, held only for lookups and inserts.
//!   Opening a connection happens outside it, so one context's slow setup
//!   never blocks other contexts.
//!
//! ## Lifecycle
//!
//! The application creates the context and ends it through
//! [`ShardedDao::finish`](crate::dao::ShardedDao::finish) (or `commit`,
//! `rollback`, `close`), which completes every touched pool and then
//! [`release`](ConnectionAffinity::release)s the pinned connections.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::fanout::FanOut;
use crate::pool::{PhysicalPool, PooledConnection};
use crate::types::PoolId;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Request Context
// =============================================================================

/// Token for one logical unit of work.
///
/// Cheap to create. Share it by reference across the threads serving the
/// request; it is `Sync`.
#[derive(Debug)]
pub struct RequestContext {
    id: u64,
    setup_lock: Mutex<()>,
    touched: Mutex<BTreeSet<PoolId>>,
}

impl RequestContext {
    /// Creates a context with a process-unique id.
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            setup_lock: Mutex::new(()),
            touched: Mutex::new(BTreeSet::new()),
        }
    }

    /// Returns the context id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pools this context holds a connection to, in ascending order.
    pub fn touched_pools(&self) -> Vec<PoolId> {
        self.touched
            .lock()
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    fn mark_touched(&self, pool: PoolId) {
        if let Ok(mut touched) = self.touched.lock() {
            touched.insert(pool);
        }
    }

    fn clear_touched(&self) {
        if let Ok(mut touched) = self.touched.lock() {
            touched.clear();
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// How a request ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Commit every touched pool.
    Commit,
    /// Roll back every touched pool.
    Rollback,
}

// =============================================================================
// Leases
// =============================================================================

type SharedConnection = Arc<Mutex<PooledConnection>>;

/// A connection handed to one operation.
///
/// `Pinned` connections belong to a request context and stay checked out
/// after the lease is dropped. `Owned` connections go back to the pool as
/// soon as the lease is dropped.
#[derive(Debug)]
pub enum Lease {
    /// The context's connection for this pool.
    Pinned(SharedConnection),
    /// A fresh autocommit connection for a context-free call.
    Owned(PooledConnection),
}

impl Lease {
    /// Runs `f` with exclusive access to the connection.
    pub fn with_conn<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PooledConnection) -> Result<T>,
    {
        match self {
            Lease::Owned(conn) => f(conn),
            Lease::Pinned(shared) => {
                let mut conn = shared
                    .lock()
                    .map_err(|_| Error::Worker("pinned connection lock poisoned".into()))?;
                f(&mut conn)
            }
        }
    }

    /// Returns true for a context-pinned connection.
    pub fn is_pinned(&self) -> bool {
        matches!(self, Lease::Pinned(_))
    }
}

// =============================================================================
// Connection Affinity
// =============================================================================

/// Pins at most one connection per (request context, pool).
#[derive(Debug, Default)]
pub struct ConnectionAffinity {
    connections: Mutex<HashMap<(u64, PoolId), SharedConnection>>,
}

impl ConnectionAffinity {
    /// Creates an empty affinity map.
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, key: (u64, PoolId)) -> Result<Option<SharedConnection>> {
        let map = self
            .connections
            .lock()
            .map_err(|_| Error::Worker("affinity map lock poisoned".into()))?;
        Ok(map.get(&key).cloned())
    }

    /// Returns a connection to `pool` for the given context.
    ///
    /// With a context, the first call per pool opens a connection in the
    /// pool's configured commit mode and pins it; later calls return the same
    /// connection. Without a context, a fresh autocommit connection is
    /// returned and goes back to the pool when the lease drops.
    pub fn acquire(&self, ctx: Option<&RequestContext>, pool: &Arc<PhysicalPool>) -> Result<Lease> {
        let Some(ctx) = ctx else {
            return Ok(Lease::Owned(pool.get(true)?));
        };

        let key = (ctx.id, pool.id());
        if let Some(conn) = self.lookup(key)? {
            return Ok(Lease::Pinned(conn));
        }

        let _setup = ctx
            .setup_lock
            .lock()
            .map_err(|_| Error::Worker("context setup lock poisoned".into()))?;
        // another thread of this context may have won the race
        if let Some(conn) = self.lookup(key)? {
            return Ok(Lease::Pinned(conn));
        }

        let conn = Arc::new(Mutex::new(pool.get(pool.autocommit())?));
        self.connections
            .lock()
            .map_err(|_| Error::Worker("affinity map lock poisoned".into()))?
            .insert(key, Arc::clone(&conn));
        ctx.mark_touched(pool.id());

        tracing::debug!(ctx = ctx.id, pool = %pool.id(), autocommit = pool.autocommit(), "pinned connection");
        Ok(Lease::Pinned(conn))
    }

    /// Commits or rolls back the context's connection to `pool`, if any.
    pub fn complete(&self, ctx: &RequestContext, pool: PoolId, outcome: Outcome) -> Result<()> {
        let Some(shared) = self.lookup((ctx.id, pool))? else {
            return Ok(());
        };
        let mut conn = shared
            .lock()
            .map_err(|_| Error::Worker("pinned connection lock poisoned".into()))?;
        match outcome {
            Outcome::Commit => conn.commit(),
            Outcome::Rollback => conn.rollback(),
        }
    }

    /// Commits or rolls back every pool `ctx` touched, in parallel.
    pub fn complete_all(&self, fanout: &FanOut, ctx: &RequestContext, outcome: Outcome) -> Result<()> {
        let touched = ctx.touched_pools();
        if touched.is_empty() {
            return Ok(());
        }
        fanout.run_all(touched, |pool| self.complete(ctx, pool.id(), outcome))?;
        tracing::debug!(ctx = ctx.id, ?outcome, "completed request");
        Ok(())
    }

    /// Drops every connection pinned by `ctx` and returns how many there were.
    ///
    /// Connections with an open transaction roll back as they return to
    /// their pool.
    pub fn release(&self, ctx: &RequestContext) -> Result<usize> {
        let released: Vec<SharedConnection> = {
            let mut map = self
                .connections
                .lock()
                .map_err(|_| Error::Worker("affinity map lock poisoned".into()))?;
            let keys: Vec<(u64, PoolId)> =
                map.keys().filter(|(id, _)| *id == ctx.id).copied().collect();
            keys.into_iter().filter_map(|k| map.remove(&k)).collect()
        };
        ctx.clear_touched();

        let count = released.len();
        if count > 0 {
            tracing::debug!(ctx = ctx.id, connections = count, "released request connections");
        }
        Ok(count)
    }

    /// Number of connections pinned across all contexts.
    pub fn pinned_count(&self) -> usize {
        self.connections.lock().map(|m| m.len()).unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================
