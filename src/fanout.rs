//! # Fan-out Executor
//!
//! Runs one unit of work against several physical pools and merges the
//! results.
//!
//! ```text
//!   targets [0, 2, 2', 3]        (2' shares 2's endpoint)
//!        │ canonicalise + dedup
//!        ▼
//!   [0, 2, 3] ──► rayon scope ──┬─ unit(pool 0) ─┐
//!                               ├─ unit(pool 2) ─┼─► Mutex<Vec<(PoolId, T)>>
//!                               └─ unit(pool 3) ─┘
//! ```
//!
//! ## Failure Policy
//!
//! Units are never cancelled. Every unit runs to completion; afterwards the
//! first failure observed is returned as [`Error::FanOut`], naming its pool.
//! Writes on sibling pools are therefore not undone when one pool fails.
//!
//! A single target skips the worker pool entirely and its error comes back
//! unwrapped.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::pool::PhysicalPool;
use crate::router::ShardRouter;
use crate::types::PoolId;

/// Parallel executor over the pools of one router.
#[derive(Debug, Clone)]
pub struct FanOut {
    workers: Arc<rayon::ThreadPool>,
    router: Arc<ShardRouter>,
}

impl FanOut {
    /// Creates an executor with its own worker pool of `workers` threads.
    ///
    /// `workers == 0` lets rayon pick the CPU count.
    pub fn new(router: Arc<ShardRouter>, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("dbshard-fanout-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("fan-out worker pool: {e}")))?;
        Ok(Self::with_workers(router, Arc::new(pool)))
    }

    /// Creates an executor on an existing worker pool.
    pub fn with_workers(router: Arc<ShardRouter>, workers: Arc<rayon::ThreadPool>) -> Self {
        Self { workers, router }
    }

    /// Returns the router.
    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.current_num_threads()
    }

    fn resolve_targets<I>(&self, targets: I) -> Result<Vec<&Arc<PhysicalPool>>>
    where
        I: IntoIterator<Item = PoolId>,
    {
        let distinct: BTreeSet<PoolId> = targets
            .into_iter()
            .map(|p| self.router.canonical(p))
            .collect();
        distinct.into_iter().map(|p| self.router.pool(p)).collect()
    }

    /// Runs `unit` once per distinct target pool and collects the results.
    ///
    /// Results are ordered by pool id. See the module docs for the failure
    /// policy.
    pub fn run_all<I, T, F>(&self, targets: I, unit: F) -> Result<Vec<(PoolId, T)>>
    where
        I: IntoIterator<Item = PoolId>,
        T: Send,
        F: Fn(&Arc<PhysicalPool>) -> Result<T> + Sync,
    {
        let pools = self.resolve_targets(targets)?;
        match pools.as_slice() {
            [] => return Ok(Vec::new()),
            [only] => return Ok(vec![(only.id(), unit(*only)?)]),
            _ => {}
        }

        let total = pools.len();
        let results: Mutex<Vec<(PoolId, T)>> = Mutex::new(Vec::with_capacity(total));
        let failures: Mutex<Vec<(PoolId, Error)>> = Mutex::new(Vec::new());

        self.workers.scope(|s| {
            for &pool in &pools {
                let (unit, results, failures) = (&unit, &results, &failures);
                s.spawn(move |_| {
                    let outcome = unit(pool);
                    match outcome {
                        Ok(value) => {
                            if let Ok(mut r) = results.lock() {
                                r.push((pool.id(), value));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(pool = %pool.id(), error = %e, "fan-out unit failed");
                            if let Ok(mut f) = failures.lock() {
                                f.push((pool.id(), e));
                            }
                        }
                    }
                });
            }
        });

        let mut failures = failures
            .into_inner()
            .map_err(|_| Error::Worker("fan-out failure list poisoned".into()))?;
        if !failures.is_empty() {
            let failed = failures.len();
            let (pool, source) = failures.swap_remove(0);
            return Err(Error::FanOut {
                pool,
                failed,
                total,
                source: Box::new(source),
            });
        }

        let mut results = results
            .into_inner()
            .map_err(|_| Error::Worker("fan-out result list poisoned".into()))?;
        results.sort_by_key(|(pool, _)| *pool);
        Ok(results)
    }

    /// Runs `unit` on every active pool. See [`ShardRouter::active_pools`].
    pub fn for_each_pool<T, F>(&self, unit: F) -> Result<Vec<(PoolId, T)>>
    where
        T: Send,
        F: Fn(&Arc<PhysicalPool>) -> Result<T> + Sync,
    {
        self.run_all(self.router.active_pools(), unit)
    }

    /// Runs `unit` on each distinct target in pool order, on the calling
    /// thread, stopping at the first failure.
    ///
    /// For streaming work that writes into one shared sink.
    pub fn run_sequential<I, F>(&self, targets: I, mut unit: F) -> Result<()>
    where
        I: IntoIterator<Item = PoolId>,
        F: FnMut(&Arc<PhysicalPool>) -> Result<()>,
    {
        for pool in self.resolve_targets(targets)? {
            unit(pool)?;
        }
        Ok(())
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fan_out(endpoints: &[&str]) -> FanOut {
        let pools = endpoints
            .iter()
            .enumerate()
            .map(|(i, e)| {
                PhysicalPool::new(PoolId::from_raw(i as u32), PoolConfig::new(*e), DEFAULT_ACQUIRE_TIMEOUT)
                    .unwrap()
            })
            .collect();
        let resolver = Arc::new(HashShardResolver::new(endpoints.len() as u32 * 4).unwrap());
        let router = Arc::new(ShardRouter::new(resolver, pools, 4).unwrap());
        FanOut::new(router, 4).unwrap()
    }

    fn ids(raw: &[u32]) -> Vec<PoolId> {
        raw.iter().copied().map(PoolId::from_raw).collect()
    }

    #[test]
    fn test_results_from_every_pool() {
        let f = fan_out(&["a", "b", "c", "d"]);
        let out = f.for_each_pool(|pool| Ok(pool.id().as_raw() * 10)).unwrap();
        assert_eq!(
            out.into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
            vec![0, 10, 20, 30]
        );
    }

    #[test]
    fn test_shared_endpoint_runs_once() {
        let f = fan_out(&["a", "b", "a", "b"]);
        let calls = AtomicUsize::new(0);
        let out = f
            .run_all(ids(&[0, 1, 2, 3]), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_waits_for_siblings() {
        let f = fan_out(&["a", "b", "c", "d"]);
        let finished = AtomicUsize::new(0);
        let err = f
            .run_all(ids(&[0, 1, 2, 3]), |pool| {
                if pool.id().as_raw() == 1 {
                    return Err(Error::Cache("boom".into()));
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        match err {
            Error::FanOut { pool, failed, total, .. } => {
                assert_eq!(pool, PoolId::from_raw(1));
                assert_eq!((failed, total), (1, 4));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_single_target_error_is_unwrapped() {
        let f = fan_out(&["a", "b"]);
        let err = f
            .run_all(ids(&[1]), |_| Err::<(), _>(Error::Cache("boom".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Cache(_)));
    }

    #[test]
    fn test_sequential_stops_at_first_failure() {
        let f = fan_out(&["a", "b", "c"]);
        let mut seen = Vec::new();
        let err = f.run_sequential(ids(&[2, 0, 1]), |pool| {
            seen.push(pool.id().as_raw());
            if pool.id().as_raw() == 1 {
                Err(Error::Cache("stop".into()))
            } else {
                Ok(())
            }
        });
        assert!(err.is_err());
        assert_eq!(seen, vec![0, 1]);
    }
}
