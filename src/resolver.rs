//! # Shard Resolution
//!
//! A resolver decides which logical shard a new record lands on, and which
//! shard numbers are currently valid. Two families exist:
//!
//! ```text
//! Hash-based                         Time-windowed
//! ┌───────────────────────────┐      ┌──────────────────────────────────────┐
//! │ shard = hash % shard_count│      │ shard = whole windows since `start`  │
//! │ shard_count fixed         │      │ shard_count = shard(now) + 1         │
//! └───────────────────────────┘      └──────────────────────────────────────┘
//!   uniform spread, no growth          grows with wall-clock time, history
//!                                      never needs pre-provisioning
//! ```
//!
//! ## Time Windows
//!
//! All calendar arithmetic is done in UTC with `chrono`. A timestamp exactly
//! on a window boundary belongs to the new window. Timestamps before `start`
//! clamp to shard 0.
//!
//! | Granularity | Window |
//! |-------------|--------|
//! | `FixedInterval` | `interval_ms` milliseconds |
//! | `Daily` | one calendar day |
//! | `Weekly` | `weeks` calendar weeks, aligned on `start` |
//! | `Monthly` | one calendar month (variable length) |
//! | `Yearly` | one calendar year (leap years handled) |

use std::fmt;

use chrono::{DateTime, Datelike, Days, Months, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::types::{current_time_ms, ShardId, Shardable};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

// =============================================================================
// Resolver Trait
// =============================================================================

/// Chooses shards and bounds the valid shard range.
///
/// # Rust Pattern: Trait Objects
///
/// The cluster holds an `Arc<dyn ShardResolver>`, so the resolver family is a
/// configuration choice rather than a type parameter threaded through every
/// component.
pub trait ShardResolver: Send + Sync + fmt::Debug {
    /// Returns the shard a candidate belongs on.
    fn resolve(&self, candidate: &dyn Shardable) -> ShardId;

    /// Returns the number of currently valid shards.
    ///
    /// Valid shards are `0..shard_count()`. For time-windowed resolvers this
    /// grows as time passes.
    fn shard_count(&self) -> u32;

    /// Checks that `shard` is inside the currently valid range.
    fn validate(&self, shard: ShardId) -> Result<()> {
        let count = self.shard_count();
        if shard.as_raw() < count {
            Ok(())
        } else {
            Err(Error::ShardRouting {
                shard,
                reason: format!("resolver allows shards 0..{}", count),
            })
        }
    }
}

// =============================================================================
// Hash-based Resolver
// =============================================================================

/// Fixed shard count, `shard = hash % shard_count`.
#[derive(Debug, Clone)]
pub struct HashShardResolver {
    shard_count: u32,
}

impl HashShardResolver {
    /// Creates a resolver over `shard_count` shards.
    pub fn new(shard_count: u32) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::Config("hash resolver needs at least one shard".into()));
        }
        Ok(Self { shard_count })
    }

    /// Returns the shard for a raw hash value.
    pub fn shard_for_hash(&self, hash: u64) -> ShardId {
        ShardId::from_raw((hash % self.shard_count as u64) as u32)
    }
}

impl ShardResolver for HashShardResolver {
    fn resolve(&self, candidate: &dyn Shardable) -> ShardId {
        self.shard_for_hash(candidate.shard_hash())
    }

    fn shard_count(&self) -> u32 {
        self.shard_count
    }
}

// =============================================================================
// Time-windowed Resolver
// =============================================================================

/// Width of one time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Fixed width in milliseconds.
    FixedInterval { interval_ms: i64 },
    /// One calendar day.
    Daily,
    /// `weeks` calendar weeks.
    Weekly { weeks: u32 },
    /// One calendar month.
    Monthly,
    /// One calendar year.
    Yearly,
}

impl Granularity {
    /// Weekly windows of the default width (one week).
    pub const WEEKLY: Granularity = Granularity::Weekly { weeks: 1 };
}

/// Shards records by the time window their creation time falls into.
#[derive(Debug, Clone)]
pub struct TimedShardResolver {
    start: DateTime<Utc>,
    granularity: Granularity,
}

impl TimedShardResolver {
    /// Creates a resolver whose shard 0 starts at `start`.
    pub fn new(start: DateTime<Utc>, granularity: Granularity) -> Result<Self> {
        match granularity {
            Granularity::FixedInterval { interval_ms } if interval_ms <= 0 => {
                return Err(Error::Config(format!(
                    "fixed interval must be positive, got {}ms",
                    interval_ms
                )));
            }
            Granularity::Weekly { weeks: 0 } => {
                return Err(Error::Config("weekly window needs at least one week".into()));
            }
            _ => {}
        }
        Ok(Self { start, granularity })
    }

    /// Creates a resolver from a start given in Unix milliseconds.
    pub fn from_millis(start_ms: i64, granularity: Granularity) -> Result<Self> {
        let start = Utc
            .timestamp_millis_opt(start_ms)
            .single()
            .ok_or_else(|| Error::Config(format!("invalid start time {}ms", start_ms)))?;
        Self::new(start, granularity)
    }

    /// Returns the start of shard 0.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Returns the window width.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Returns the shard whose window contains `t` (Unix ms).
    ///
    /// `None` (or `0`) means "now". Times before the start clamp to shard 0.
    pub fn shard_for_time(&self, t: Option<i64>) -> ShardId {
        let t = match t {
            Some(t) if t != 0 => t,
            _ => current_time_ms(),
        };
        let start_ms = self.start.timestamp_millis();
        if t <= start_ms {
            return ShardId::FIRST;
        }

        let elapsed = match self.granularity {
            Granularity::FixedInterval { interval_ms } => (t - start_ms) / interval_ms,
            Granularity::Daily => (t - start_ms) / MS_PER_DAY,
            Granularity::Weekly { weeks } => (t - start_ms) / (MS_PER_DAY * 7 * weeks as i64),
            Granularity::Monthly => self.calendar_windows(t, 1),
            Granularity::Yearly => self.calendar_windows(t, 12),
        };

        ShardId::from_raw(elapsed.clamp(0, u32::MAX as i64) as u32)
    }

    /// Counts whole calendar windows of `months_per_window` months between
    /// the start and `t`.
    ///
    /// The month difference is a first guess; it overshoots by one when `t`
    /// sits earlier in its month (or year) than the start does.
    fn calendar_windows(&self, t: i64, months_per_window: i64) -> i64 {
        let Some(at) = Utc.timestamp_millis_opt(t).single() else {
            return 0;
        };
        let months = (at.year() as i64 - self.start.year() as i64) * 12
            + (at.month() as i64 - self.start.month() as i64);
        let mut windows = months.div_euclid(months_per_window).max(0);

        while windows > 0 && self.window_start_ms(windows) > t {
            windows -= 1;
        }
        windows
    }

    /// Start (Unix ms) of window `n`, saturating at the end of chrono's range.
    fn window_start_ms(&self, n: i64) -> i64 {
        let n = n.max(0) as u32;
        let start = match self.granularity {
            Granularity::FixedInterval { interval_ms } => {
                return self.start.timestamp_millis().saturating_add(interval_ms.saturating_mul(n as i64));
            }
            Granularity::Daily => self.start.checked_add_days(Days::new(n as u64)),
            Granularity::Weekly { weeks } => self
                .start
                .checked_add_days(Days::new(n as u64 * 7 * weeks as u64)),
            Granularity::Monthly => self.start.checked_add_months(Months::new(n)),
            Granularity::Yearly => n
                .checked_mul(12)
                .and_then(|months| self.start.checked_add_months(Months::new(months))),
        };
        start.map(|s| s.timestamp_millis()).unwrap_or(i64::MAX)
    }

    /// Returns the start (Unix ms) of `shard`'s window.
    ///
    /// Inverse of [`shard_for_time`](Self::shard_for_time):
    /// `shard_start(shard_for_time(t)) <= t < shard_start(shard_for_time(t) + 1)`.
    pub fn shard_start(&self, shard: ShardId) -> i64 {
        self.window_start_ms(shard.as_raw() as i64)
    }

    /// Returns the start (Unix ms) of the window containing `t`.
    pub fn window_start_for(&self, t: i64) -> i64 {
        self.shard_start(self.shard_for_time(Some(t)))
    }

    /// Number of shards that exist at `reference` (Unix ms).
    pub fn shard_count_at(&self, reference: i64) -> u32 {
        self.shard_for_time(Some(reference)).as_raw().saturating_add(1)
    }
}

impl ShardResolver for TimedShardResolver {
    fn resolve(&self, candidate: &dyn Shardable) -> ShardId {
        self.shard_for_time(candidate.created_ms())
    }

    fn shard_count(&self) -> u32 {
        self.shard_for_time(None).as_raw().saturating_add(1)
    }
}

// =============================================================================
// Tests
// =============================================================================
