//! # Physical Connection Pools
//!
//! A physical pool is a bounded set of SQLite connections to one database
//! file. Many logical shards share one pool; the [`router`](crate::router)
//! decides which.
//!
//! ## Connection Lifecycle
//!
//! ```text
//!           get()                       drop
//!  ┌──────┐ ─────► ┌──────────────────┐ ────► ┌──────┐
//!  │ idle │        │ PooledConnection │       │ idle │
//!  └──────┘ ◄──── │ (checked out)    │       └──────┘
//!    open new      └──────────────────┘  open txn rolled back first
//!    if < size
//! ```
//!
//! ## Commit Mode
//!
//! SQLite is autocommit unless a transaction is open. A connection handed out
//! with `autocommit = false` therefore issues `BEGIN` lazily before its first
//! statement, and stays inside that transaction until [`commit`] or
//! [`rollback`]; the next statement starts a new one.
//!
//! [`commit`]: PooledConnection::commit
//! [`rollback`]: PooledConnection::rollback

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::PoolId;

// =============================================================================
// Configuration
// =============================================================================

/// Default number of connections per pool.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Default time a caller waits for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long SQLite waits on a locked database file before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_autocommit() -> bool {
    true
}

/// Static configuration of one physical pool.
///
/// `endpoint` is the SQLite database path. Two pools configured with the same
/// endpoint are the same physical database.
#[derive(Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Database location.
    pub endpoint: String,

    /// Login name, for backends that need one.
    #[serde(default)]
    pub username: Option<String>,

    /// Login secret, never printed.
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum number of open connections.
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Commit mode for request-scoped connections.
    #[serde(default = "default_autocommit")]
    pub autocommit: bool,
}

impl PoolConfig {
    /// Creates an autocommit pool config with the default size.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: None,
            password: None,
            size: DEFAULT_POOL_SIZE,
            autocommit: true,
        }
    }

    /// Sets the commit mode.
    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    /// Sets the pool size.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("size", &self.size)
            .field("autocommit", &self.autocommit)
            .finish()
    }
}

// =============================================================================
// Physical Pool
// =============================================================================

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

/// A bounded pool of connections to one physical database.
///
/// # Thread Safety
///
/// `PhysicalPool` is shared as `Arc<PhysicalPool>`. Checkout and return go
/// through one mutex plus a condvar for callers waiting on a full pool.
/// Connections themselves are never shared: a `PooledConnection` is owned by
/// exactly one caller (or one request context) at a time.
pub struct PhysicalPool {
    id: PoolId,
    config: PoolConfig,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PhysicalPool {
    /// Creates a pool. No connection is opened until the first checkout.
    pub fn new(id: PoolId, config: PoolConfig, acquire_timeout: Duration) -> Result<Arc<Self>> {
        if config.size == 0 {
            return Err(Error::Config(format!("pool {} has size 0", id)));
        }
        if config.endpoint.is_empty() {
            return Err(Error::Config(format!("pool {} has no endpoint", id)));
        }
        Ok(Arc::new(Self {
            id,
            config,
            acquire_timeout,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
            }),
            available: Condvar::new(),
        }))
    }

    /// Returns this pool's id.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Returns the database endpoint.
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Returns the configured commit mode for request-scoped connections.
    pub fn autocommit(&self) -> bool {
        self.config.autocommit
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of connections currently open (idle or checked out).
    pub fn open_connections(&self) -> usize {
        self.state.lock().map(|s| s.open).unwrap_or(0)
    }

    /// Number of idle connections.
    pub fn idle_connections(&self) -> usize {
        self.state.lock().map(|s| s.idle.len()).unwrap_or(0)
    }

    /// Checks out a connection with the given commit mode.
    ///
    /// Reuses an idle connection when one exists, opens a new one while the
    /// pool is below its size, and otherwise waits up to the acquire timeout.
    pub fn get(self: &Arc<Self>, autocommit: bool) -> Result<PooledConnection> {
        let started = Instant::now();
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Worker(format!("pool {} lock poisoned", self.id)))?;

        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection::new(conn, Arc::clone(self), autocommit));
            }
            if state.open < self.config.size {
                state.open += 1;
                drop(state);
                return match self.open_connection() {
                    Ok(conn) => Ok(PooledConnection::new(conn, Arc::clone(self), autocommit)),
                    Err(e) => {
                        self.release_slot();
                        Err(e)
                    }
                };
            }

            let waited = started.elapsed();
            if waited >= self.acquire_timeout {
                return Err(Error::PoolExhausted {
                    pool: self.id,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, self.acquire_timeout - waited)
                .map_err(|_| Error::Worker(format!("pool {} lock poisoned", self.id)))?;
            state = guard;
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.config.endpoint)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL keeps readers on other connections unblocked by an open writer
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        tracing::debug!(pool = %self.id, endpoint = %self.config.endpoint, "opened connection");
        Ok(conn)
    }

    fn release_slot(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.open = state.open.saturating_sub(1);
        }
        self.available.notify_one();
    }

    fn give_back(&self, conn: Connection) {
        if let Ok(mut state) = self.state.lock() {
            state.idle.push(conn);
        }
        self.available.notify_one();
    }
}

impl fmt::Debug for PhysicalPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPool")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Pooled Connection
// =============================================================================

/// A checked-out connection. Returns itself to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PhysicalPool>,
    autocommit: bool,
    in_txn: bool,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<PhysicalPool>, autocommit: bool) -> Self {
        Self {
            conn: Some(conn),
            pool,
            autocommit,
            in_txn: false,
        }
    }

    /// Returns the pool this connection belongs to.
    pub fn pool_id(&self) -> PoolId {
        self.pool.id
    }

    /// Returns the commit mode.
    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Returns true while a transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        self.in_txn
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Worker("connection already released".into()))
    }

    /// Opens the implicit transaction of a non-autocommit connection.
    fn begin_if_needed(&mut self) -> Result<()> {
        if !self.autocommit && !self.in_txn {
            self.conn()?.execute_batch("BEGIN")?;
            self.in_txn = true;
        }
        Ok(())
    }

    /// Executes a parameterised statement, returning the affected row count.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        self.begin_if_needed()?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))?)
    }

    /// Runs a parameterised query and maps every row.
    pub fn query<T, F>(&mut self, sql: &str, params: &[Value], mut map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.begin_if_needed()?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| map(row))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Streams rows through `visit` without collecting them.
    pub fn for_each_row<F>(&mut self, sql: &str, params: &[Value], mut visit: F) -> Result<()>
    where
        F: FnMut(&Row<'_>) -> Result<()>,
    {
        self.begin_if_needed()?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            visit(row)?;
        }
        Ok(())
    }

    /// Commits the open transaction, if any.
    pub fn commit(&mut self) -> Result<()> {
        if self.in_txn {
            self.conn()?.execute_batch("COMMIT")?;
            self.in_txn = false;
        }
        Ok(())
    }

    /// Rolls back the open transaction, if any.
    pub fn rollback(&mut self) -> Result<()> {
        if self.in_txn {
            self.conn()?.execute_batch("ROLLBACK")?;
            self.in_txn = false;
        }
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.in_txn {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!(pool = %self.pool.id, error = %e, "rollback on release failed, discarding connection");
                drop(conn);
                self.pool.release_slot();
                return;
            }
        }
        self.pool.give_back(conn);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.id)
            .field("autocommit", &self.autocommit)
            .field("in_txn", &self.in_txn)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
