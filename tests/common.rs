#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use dbshard::{
    CacheBackend, Cluster, ColumnType, EntityKind, HashShardResolver, IndexDef, IndexedData,
    LruCacheBackend, ObjectData, PoolConfig, ShardResolver,
};

pub const EMAIL_INDEX: &str = "user_email";
pub const ORG_INDEX: &str = "user_org";

/// Entity used across the integration tests.
pub fn user_entity() -> EntityKind {
    EntityKind::new("user")
        .expect("valid entity")
        .with_index(IndexDef::new(EMAIL_INDEX, &[("email", ColumnType::Text)]).expect("valid index"))
        .with_index(
            IndexDef::new(ORG_INDEX, &[("org.id", ColumnType::Integer), ("active", ColumnType::Boolean)])
                .expect("valid index"),
        )
}

/// A cluster on temporary SQLite files. Keep `dir` alive for the pools.
pub struct TestCluster {
    pub cluster: Cluster,
    pub dir: tempfile::TempDir,
    pub paths: Vec<PathBuf>,
}

pub struct Options {
    pub pools: usize,
    pub shards_per_pool: u32,
    pub autocommit: bool,
    pub cache: Option<Arc<dyn CacheBackend>>,
    pub resolver: Option<Arc<dyn ShardResolver>>,
    /// Endpoint index per pool; pools with equal values share a file.
    pub endpoints: Option<Vec<usize>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pools: 3,
            shards_per_pool: 2,
            autocommit: true,
            cache: None,
            resolver: None,
            endpoints: None,
        }
    }
}

pub fn lru(capacity: usize) -> Arc<dyn CacheBackend> {
    Arc::new(LruCacheBackend::new(capacity).expect("valid capacity"))
}

pub fn test_cluster(options: Options) -> TestCluster {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let resolver = options.resolver.unwrap_or_else(|| {
        Arc::new(
            HashShardResolver::new(options.pools as u32 * options.shards_per_pool).expect("valid resolver"),
        )
    });

    let mut builder = Cluster::builder()
        .resolver(resolver)
        .shards_per_pool(options.shards_per_pool)
        .workers(4);
    if let Some(cache) = options.cache {
        builder = builder.cache(cache);
    }

    let mut paths = Vec::with_capacity(options.pools);
    for i in 0..options.pools {
        let file = options.endpoints.as_ref().map(|e| e[i]).unwrap_or(i);
        let path = dir.path().join(format!("pool{}.db", file));
        builder = builder.pool(PoolConfig::new(path.to_string_lossy()).with_autocommit(options.autocommit));
        paths.push(path);
    }

    let cluster = builder.build().expect("build cluster");
    cluster.provision(&user_entity()).expect("provision tables");
    TestCluster { cluster, dir, paths }
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

/// Row count of `table` in one database file, read around the pools.
pub fn count_rows(path: &Path, table: &str) -> i64 {
    open_read_only(path)
        .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| row.get(0))
        .expect("count rows")
}

pub fn ids_in(path: &Path, table: &str) -> Vec<String> {
    let conn = open_read_only(path);
    let mut stmt = conn
        .prepare(&format!("SELECT id FROM \"{}\" ORDER BY id", table))
        .expect("prepare");
    stmt.query_map([], |row| row.get(0))
        .expect("query")
        .collect::<Result<Vec<String>, _>>()
        .expect("collect ids")
}

pub fn user(name: &str) -> ObjectData {
    ObjectData::new("", format!(r#"{{"name":"{}"}}"#, name))
}

pub fn index_row(id: &str, created: i64, fields: &[(&str, Value)]) -> IndexedData {
    let fields: BTreeMap<String, Value> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    IndexedData {
        id: id.to_string(),
        created,
        fields,
    }
}
