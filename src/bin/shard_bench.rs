//! dbshard Benchmark Binary
//!
//! Drives a sharded cluster with concurrent writes and reads and reports
//! throughput plus the dao's cache and fan-out counters.
//! Run with: `cargo run --bin shard_bench -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default: 4 pools, 10000 records, 16 concurrent tasks, 100k entry cache
//! cargo run --release --bin shard_bench
//!
//! # Against a configured cluster
//! cargo run --release --bin shard_bench -- --config cluster.toml --records 50000
//!
//! # Without a cache, to see raw backend cost
//! cargo run --release --bin shard_bench -- --cache 0
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use rusqlite::types::Value;

use dbshard::{
    Cluster, ClusterConfig, ColumnType, EntityKind, FieldValue, HashShardResolver, IndexDef,
    IndexedData, LruCacheBackend, ObjectData, Paging, PoolConfig, Result, ShardStore, Target,
};

const INDEX: &str = "bench_item_bucket";

/// Benchmark settings.
#[derive(Parser, Debug)]
#[command(name = "shard_bench")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster configuration file; a temporary cluster is built when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pools of the temporary cluster.
    #[arg(short, long, default_value_t = 4)]
    pools: u32,

    /// Shards per pool of the temporary cluster.
    #[arg(long, default_value_t = 4)]
    shards_per_pool: u32,

    /// Records to create.
    #[arg(short, long, default_value_t = 10_000)]
    records: usize,

    /// Concurrent tasks.
    #[arg(short = 'j', long, default_value_t = 16)]
    concurrency: usize,

    /// Distinct index buckets.
    #[arg(long, default_value_t = 32)]
    buckets: i64,

    /// Cache capacity of the temporary cluster; 0 disables the cache.
    #[arg(long, default_value_t = 100_000)]
    cache: usize,

    /// Log filter (overrides RUST_LOG).
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(level: Option<&str>) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn temporary_cluster(args: &Args) -> Result<(Cluster, PathBuf)> {
    let dir = std::env::temp_dir().join(format!("dbshard-bench-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;

    let shards = args.pools.max(1) * args.shards_per_pool.max(1);
    let mut builder = Cluster::builder()
        .resolver(Arc::new(HashShardResolver::new(shards)?))
        .shards_per_pool(args.shards_per_pool.max(1));
    for i in 0..args.pools.max(1) {
        let path = dir.join(format!("pool{}.db", i));
        builder = builder.pool(PoolConfig::new(path.to_string_lossy()));
    }
    if args.cache > 0 {
        builder = builder.cache(Arc::new(LruCacheBackend::new(args.cache)?));
    }
    Ok((builder.build()?, dir))
}

fn entity() -> Result<EntityKind> {
    Ok(EntityKind::new("bench_item")?.with_index(IndexDef::new(INDEX, &[("bucket", ColumnType::Integer)])?))
}

fn per_sec(n: usize, secs: f64) -> f64 {
    if secs > 0.0 {
        n as f64 / secs
    } else {
        0.0
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let (cluster, temp_dir) = match &args.config {
        Some(path) => (Cluster::from_config(&ClusterConfig::load(path)?)?, None),
        None => {
            let (cluster, dir) = temporary_cluster(&args)?;
            (cluster, Some(dir))
        }
    };
    let entity = entity()?;
    cluster.provision(&entity)?;
    let store = ShardStore::open(&cluster, entity);

    println!("dbshard Benchmark");
    println!("=================");
    println!("Pools:       {}", cluster.pools().len());
    println!("Active:      {}", cluster.router().active_pools().len());
    println!("Workers:     {}", cluster.fanout().worker_count());
    println!("Records:     {}", args.records);
    println!("Concurrency: {}", args.concurrency);
    println!();

    // Writes
    let concurrency = args.concurrency.max(1);
    let per_task = args.records / concurrency;
    let buckets = args.buckets.max(1);
    let start = Instant::now();
    let mut handles = Vec::with_capacity(concurrency);
    for task in 0..concurrency {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::with_capacity(per_task);
            for i in 0..per_task {
                let n = (task * per_task + i) as i64;
                let record = store
                    .create(None, ObjectData::new("", format!(r#"{{"n":{}}}"#, n)))
                    .await?;
                let mut fields = BTreeMap::new();
                fields.insert("bucket".to_string(), Value::Integer(n % buckets));
                store
                    .create_index_row(
                        None,
                        INDEX,
                        IndexedData {
                            id: record.id.clone(),
                            created: record.created,
                            fields,
                        },
                    )
                    .await?;
                ids.push(record.id);
            }
            Ok::<_, dbshard::Error>(ids)
        }));
    }
    let mut ids = Vec::with_capacity(args.records);
    for handle in handles {
        let task_ids = handle
            .await
            .map_err(|e| dbshard::Error::Worker(e.to_string()))??;
        ids.extend(task_ids);
    }
    let write_secs = start.elapsed().as_secs_f64();

    // Reads: cold bulk, warm bulk, repeated misses
    let start = Instant::now();
    let cold = store.lookup_many(None, ids.clone()).await?;
    let cold_secs = start.elapsed().as_secs_f64();

    let start = Instant::now();
    let warm = store.lookup_many(None, ids.clone()).await?;
    let warm_secs = start.elapsed().as_secs_f64();

    let missing: Vec<String> = ids.iter().take(100).map(|id| format!("{}x", id)).collect();
    for _ in 0..2 {
        store.lookup_many(None, missing.clone()).await?;
    }

    // Index fan-out
    let mut indexed = 0i64;
    for bucket in 0..buckets {
        let mut values = BTreeMap::new();
        values.insert("bucket".to_string(), FieldValue::from(bucket));
        indexed += store.index_count(None, INDEX, values, Target::All).await?;
    }
    let newest = store.scan(None, Paging::first(10)).await?;
    let total = store.count(None).await?;

    let metrics = store.metrics();
    println!("Results");
    println!("-------");
    println!("Created:          {} ({:.2}/sec)", ids.len(), per_sec(ids.len(), write_secs));
    println!("Cold bulk read:   {} ({:.2}/sec)", cold.len(), per_sec(cold.len(), cold_secs));
    println!("Warm bulk read:   {} ({:.2}/sec)", warm.len(), per_sec(warm.len(), warm_secs));
    println!("Indexed rows:     {}", indexed);
    println!("Stored records:   {}", total);
    println!("Newest page:      {}", newest.len());
    println!();
    println!("Backend queries:  {}", metrics.backend_queries);
    println!("Cache hits:       {}", metrics.cache_hits);
    println!("Sentinel hits:    {}", metrics.sentinel_hits);
    println!("Fan-out rounds:   {}", metrics.fanout_rounds);

    if args.config.is_none() && (indexed as usize != ids.len() || cold.len() != ids.len()) {
        tracing::error!(created = ids.len(), indexed, read = cold.len(), "count mismatch");
    }

    if let Some(dir) = temp_dir {
        drop(store);
        drop(cluster);
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}
