//! # Error Handling for dbshard
//!
//! This module defines the error types used throughout dbshard. A single error
//! enum ([`Error`]) covers every failure mode of the sharding layer, so callers
//! get one type to match on regardless of which component failed.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from `#[from]`
//! - Source chaining comes from `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Addressing | `InvalidId`, `ShardRouting` | Reject the request, the id is bad |
//! | Backend | `Sql`, `PoolExhausted` | Propagate; no retry happens in this layer |
//! | Cache | `Cache` | Reads degrade to a backend query, writes surface |
//! | Fan-out | `FanOut` | One pool failed; siblings already ran to completion |
//! | Setup | `Config`, `InvalidField`, `Payload`, `Io`, `Worker` | Fix the configuration or caller |

use thiserror::Error;

use crate::types::{PoolId, ShardId};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in dbshard operations.
///
/// # Example
///
/// ```rust,ignore
/// use dbshard::{Error, ObjectId};
///
/// match ObjectId::parse("no-prefix-here") {
///     Err(Error::InvalidId { id, .. }) => eprintln!("bad id {id}"),
///     _ => {}
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Addressing Errors
    // =========================================================================

    /// The id string does not carry a decodable shard prefix.
    ///
    /// Decoding never touches a datasource, so this is always a caller bug or
    /// corrupted input, never a transient condition.
    #[error("invalid object id '{id}': {reason}")]
    InvalidId {
        /// The offending id as received
        id: String,
        /// What was wrong with it
        reason: &'static str,
    },

    /// A shard number lies outside the resolver's currently valid range, or
    /// maps to a pool that is not configured.
    #[error("shard {shard} is not routable: {reason}")]
    ShardRouting {
        /// The shard that could not be routed
        shard: ShardId,
        /// Why routing failed
        reason: String,
    },

    // =========================================================================
    // Backend Errors
    // =========================================================================

    /// SQL execution or connectivity failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// Any `rusqlite::Error` converts automatically with `?`. These errors are
    /// propagated verbatim and never retried.
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// No connection became available within the pool's acquire timeout.
    #[error("pool {pool} exhausted: no connection available after {waited_ms}ms")]
    PoolExhausted {
        /// Pool that ran out of connections
        pool: PoolId,
        /// How long the caller waited
        waited_ms: u64,
    },

    // =========================================================================
    // Cache Errors
    // =========================================================================

    /// The cache backend failed.
    ///
    /// Read paths log this and fall back to the database. Write paths return
    /// it, because a lost write would leave a stale entry behind.
    #[error("cache backend error: {0}")]
    Cache(String),

    // =========================================================================
    // Fan-out Errors
    // =========================================================================

    /// One unit of a parallel fan-out failed.
    ///
    /// All sibling units ran to completion before this was raised. `pool`
    /// names the first failure observed, `failed` counts all failing units.
    #[error("fan-out unit on pool {pool} failed ({failed} of {total} units failed): {source}")]
    FanOut {
        /// Pool whose unit failed first
        pool: PoolId,
        /// Number of failed units
        failed: usize,
        /// Number of units that ran
        total: usize,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Setup Errors
    // =========================================================================

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A field or column name cannot be used in generated SQL.
    #[error("invalid field name '{0}'")]
    InvalidField(String),

    /// A record payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Writing an export stream failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A background worker failed to run the operation.
    #[error("worker error: {0}")]
    Worker(String),
}

impl Error {
    /// Builds an [`Error::InvalidId`].
    pub(crate) fn invalid_id(id: &str, reason: &'static str) -> Self {
        Error::InvalidId {
            id: id.to_string(),
            reason,
        }
    }

    /// Returns the innermost error, looking through [`Error::FanOut`] wrappers.
    ///
    /// Useful when a caller wants to react to the SQL failure itself rather
    /// than to the fact that it happened inside a fan-out.
    pub fn root(&self) -> &Error {
        match self {
            Error::FanOut { source, .. } => source.root(),
            other => other,
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
