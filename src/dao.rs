//! # Sharded Dao
//!
//! [`ShardedDao`] is the engine the application talks to. It owns nothing but
//! handles: the router, the connection affinity map, the fan-out executor
//! and a cache front. One dao serves one [`EntityKind`].
//!
//! ## Read Path
//!
//! ```text
//!  lookup(ids)
//!     │
//!     ├─► cache.get_bulk ──► hits ───────────────────────────────┐
//!     │                                                          │
//!     └─► misses ─► partition_by_pool ─► fan-out: one IN query   │
//!                                        per pool                ▼
//!                        found ──────────────────────► merge in caller order
//!                        still missing ─► cache Absent
//! ```
//!
//! ## Write Path
//!
//! Writes route by the id's shard, run on the request's pinned connection
//! (or a fresh autocommit one) and then write the cache: the new record on
//! create and update, the absent sentinel on delete. Cache writes happen when
//! the statement runs, not when the request commits.
//!
//! ## Index Lookups
//!
//! Lookups on index tables build a parameterised predicate from a
//! `field -> value` map (see [`FieldValue`]). Results are ordered newest
//! first, merged across pools and cached under the lookup's composed key.
//! Writing an index row invalidates the unpaged key for that row's values;
//! paged results of the same query stay cached until evicted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheEntry, CacheFront};
use crate::context::{ConnectionAffinity, Outcome, RequestContext};
use crate::entity::{quote, EntityKind, IndexDef};
use crate::error::{Error, Result};
use crate::fanout::FanOut;
use crate::pool::{PhysicalPool, PooledConnection};
use crate::router::ShardRouter;
use crate::types::{current_time_ms, FieldValue, IndexedData, ObjectData, ObjectId, PoolId, Shardable};

/// Upper bound on ids bound into one `IN (...)` list.
const IN_CHUNK: usize = 500;

const OBJECT_COLUMNS: &str = "id, created, updated, version, json";

// =============================================================================
// Typed Row Decoding
// =============================================================================

/// Decodes one result row into a value.
///
/// # Rust Pattern: Static Dispatch
///
/// The row type is a type parameter of the query methods, so the decoder is
/// chosen at compile time: `dao.query_all::<ObjectData>(..)`.
pub trait FromRow: Sized {
    /// Builds `Self` from the current row.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

impl FromRow for ObjectData {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ObjectData {
            id: row.get("id")?,
            created: row.get("created")?,
            updated: row.get("updated")?,
            version: row.get("version")?,
            payload: row.get("json")?,
        })
    }
}

impl FromRow for IndexedData {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut id = None;
        let mut created = 0;
        let mut fields = BTreeMap::new();
        for (i, name) in row.as_ref().column_names().into_iter().enumerate() {
            match name {
                "id" => id = Some(row.get(i)?),
                "created" => created = row.get(i)?,
                other => {
                    fields.insert(other.to_string(), row.get::<_, Value>(i)?);
                }
            }
        }
        let id = id.ok_or_else(|| rusqlite::Error::InvalidColumnName("id".into()))?;
        Ok(IndexedData { id, created, fields })
    }
}

impl FromRow for i64 {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        row.get(0)
    }
}

impl FromRow for String {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        row.get(0)
    }
}

impl FromRow for Value {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        row.get(0)
    }
}

// =============================================================================
// Paging and Targets
// =============================================================================

/// Window over a newest-first listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Paging {
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows to return; `None` returns everything after `offset`.
    pub limit: Option<usize>,
}

impl Paging {
    /// Everything.
    pub const ALL: Paging = Paging {
        offset: 0,
        limit: None,
    };

    /// `limit` rows starting at `offset`.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// The newest `limit` rows.
    pub fn first(limit: usize) -> Self {
        Self::new(0, limit)
    }

    fn is_all(&self) -> bool {
        self.offset == 0 && self.limit.is_none()
    }

    /// Rows each pool must return so the merged page is complete.
    ///
    /// `None` when unbounded or when the bound does not fit an SQLite integer.
    fn per_pool(&self) -> Option<usize> {
        self.limit
            .and_then(|l| self.offset.checked_add(l))
            .filter(|n| i64::try_from(*n).is_ok())
    }

    fn cache_suffix(&self) -> String {
        if self.is_all() {
            String::new()
        } else {
            format!(
                ":{}:{}",
                self.offset,
                self.limit.map(|l| l.to_string()).unwrap_or_else(|| "*".into())
            )
        }
    }
}

/// Which pools an index query runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every active pool.
    All,
    /// One pool.
    Pool(PoolId),
}

impl Target {
    fn cache_suffix(&self) -> String {
        match self {
            Target::All => String::new(),
            Target::Pool(p) => format!("@{}", p),
        }
    }
}

/// Rows listed newest first: created descending, then id ascending.
trait Listed {
    fn created(&self) -> i64;
    fn id(&self) -> &str;
}

impl Listed for ObjectData {
    fn created(&self) -> i64 {
        self.created
    }
    fn id(&self) -> &str {
        &self.id
    }
}

impl Listed for IndexedData {
    fn created(&self) -> i64 {
        self.created
    }
    fn id(&self) -> &str {
        &self.id
    }
}

fn merge_newest_first<T: Listed>(parts: Vec<(PoolId, Vec<T>)>, paging: Paging) -> Vec<T> {
    let mut rows: Vec<T> = parts.into_iter().flat_map(|(_, rows)| rows).collect();
    rows.sort_by(|a, b| b.created().cmp(&a.created()).then_with(|| a.id().cmp(b.id())));
    let rows = rows.into_iter().skip(paging.offset);
    match paging.limit {
        Some(limit) => rows.take(limit).collect(),
        None => rows.collect(),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn text_params(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|id| Value::Text(id.clone())).collect()
}

// =============================================================================
// Metrics
// =============================================================================

/// Counters describing how a dao's requests were served.
#[derive(Debug, Default)]
pub struct DaoMetrics {
    backend_queries: AtomicU64,
    cache_hits: AtomicU64,
    sentinel_hits: AtomicU64,
    fanout_rounds: AtomicU64,
}

/// Point-in-time copy of [`DaoMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Statements sent to a pool.
    pub backend_queries: u64,
    /// Reads answered from a cached value.
    pub cache_hits: u64,
    /// Reads answered from the absent sentinel.
    pub sentinel_hits: u64,
    /// Multi-pool rounds started.
    pub fanout_rounds: u64,
}

impl DaoMetrics {
    /// Returns the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backend_queries: self.backend_queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            sentinel_hits: self.sentinel_hits.load(Ordering::Relaxed),
            fanout_rounds: self.fanout_rounds.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

// =============================================================================
// SQL
// =============================================================================

#[derive(Debug)]
struct ObjectSql {
    table: String,
    insert: String,
    update: String,
    select_one: String,
    delete_one: String,
}

impl ObjectSql {
    fn new(entity: &EntityKind) -> Self {
        let table = quote(entity.name());
        Self {
            insert: format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?)",
                table, OBJECT_COLUMNS
            ),
            update: format!(
                "UPDATE {} SET updated = ?, version = version + 1, json = ? WHERE id = ? RETURNING created, version",
                table
            ),
            select_one: format!("SELECT {} FROM {} WHERE id = ?", OBJECT_COLUMNS, table),
            delete_one: format!("DELETE FROM {} WHERE id = ?", table),
            table,
        }
    }
}

/// A `WHERE` clause and its bound values.
#[derive(Debug, PartialEq)]
struct Predicate {
    clause: String,
    params: Vec<Value>,
}

/// Builds the predicate of an index lookup, or `None` if it can never match.
fn build_predicate(index: &IndexDef, values: &BTreeMap<String, FieldValue>) -> Result<Option<Predicate>> {
    let fields = index.resolve_fields(values)?;
    if fields.iter().any(|(_, v)| v.is_empty_set()) {
        return Ok(None);
    }

    let mut clauses = Vec::with_capacity(fields.len());
    let mut params = Vec::new();
    for (column, value) in fields {
        let column = quote(&column);
        match value {
            FieldValue::One(Value::Null) => clauses.push(format!("{} IS NULL", column)),
            FieldValue::One(v) => {
                clauses.push(format!("{} = ?", column));
                params.push(v.clone());
            }
            FieldValue::Many(vs) => {
                clauses.push(format!("{} IN ({})", column, placeholders(vs.len())));
                params.extend(vs.iter().cloned());
            }
        }
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    Ok(Some(Predicate { clause, params }))
}

// =============================================================================
// Dao
// =============================================================================

/// Sharded data access for one entity kind.
///
/// Every operation takes an optional [`RequestContext`]. With a context, all
/// statements on a pool share the context's pinned connection; without one,
/// each statement runs on a fresh autocommit connection.
#[derive(Debug)]
pub struct ShardedDao {
    entity: EntityKind,
    router: Arc<ShardRouter>,
    affinity: Arc<ConnectionAffinity>,
    fanout: FanOut,
    cache: CacheFront,
    metrics: DaoMetrics,
    sql: ObjectSql,
}

impl ShardedDao {
    /// Creates a dao. Usually called through [`Cluster::dao`](crate::cluster::Cluster::dao).
    pub fn new(
        entity: EntityKind,
        fanout: FanOut,
        affinity: Arc<ConnectionAffinity>,
        cache: CacheFront,
    ) -> Self {
        let sql = ObjectSql::new(&entity);
        Self {
            router: Arc::clone(fanout.router()),
            entity,
            affinity,
            fanout,
            cache,
            metrics: DaoMetrics::default(),
            sql,
        }
    }

    /// Returns the entity this dao serves.
    pub fn entity(&self) -> &EntityKind {
        &self.entity
    }

    /// Returns the router.
    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// Returns the request counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs `f` on the connection for `pool`, counting one backend query.
    fn run_on<T, F>(&self, ctx: Option<&RequestContext>, pool: &Arc<PhysicalPool>, f: F) -> Result<T>
    where
        F: FnOnce(&mut PooledConnection) -> Result<T>,
    {
        DaoMetrics::bump(&self.metrics.backend_queries, 1);
        let mut lease = self.affinity.acquire(ctx, pool)?;
        lease.with_conn(f)
    }

    fn fan_out<I, T, F>(&self, targets: I, unit: F) -> Result<Vec<(PoolId, T)>>
    where
        I: IntoIterator<Item = PoolId>,
        T: Send,
        F: Fn(&Arc<PhysicalPool>) -> Result<T> + Sync,
    {
        DaoMetrics::bump(&self.metrics.fanout_rounds, 1);
        self.fanout.run_all(targets, unit)
    }

    fn canonical_target(&self, target: Target) -> Target {
        match target {
            Target::All => Target::All,
            Target::Pool(p) => Target::Pool(self.router.canonical(p)),
        }
    }

    fn targets(&self, target: Target) -> Vec<PoolId> {
        match target {
            Target::All => self.router.active_pools(),
            Target::Pool(p) => vec![p],
        }
    }

    // =========================================================================
    // Ids
    // =========================================================================

    /// Picks a shard for `candidate` and generates a fresh id on it.
    ///
    /// Fails with [`Error::ShardRouting`] if no pool serves that shard.
    pub fn generate_id(&self, candidate: &dyn Shardable) -> Result<ObjectId> {
        let shard = self.router.resolver().resolve(candidate);
        self.router.pool_id_for_shard(shard)?;
        Ok(ObjectId::generate(shard))
    }

    // =========================================================================
    // Single-record Operations
    // =========================================================================

    /// Inserts `record` and caches it.
    ///
    /// An empty id is generated by the resolver from the record itself; a
    /// zero `created` is stamped with the current time first.
    pub fn create(&self, ctx: Option<&RequestContext>, mut record: ObjectData) -> Result<ObjectData> {
        if record.created == 0 {
            record.created = current_time_ms();
        }
        if record.updated == 0 {
            record.updated = record.created;
        }
        if record.id.is_empty() {
            record.id = self.generate_id(&record)?.to_string();
        }

        let pool = self.router.pool_for_id(&record.id)?;
        let params = [
            Value::Text(record.id.clone()),
            Value::Integer(record.created),
            Value::Integer(record.updated),
            Value::Integer(record.version as i64),
            Value::Text(record.payload.clone()),
        ];
        self.run_on(ctx, pool, |c| c.execute(&self.sql.insert, &params))?;
        tracing::debug!(entity = self.entity.name(), id = %record.id, pool = %pool.id(), "created record");

        self.cache.set(&record.id, CacheEntry::Object(record.clone()))?;
        Ok(record)
    }

    /// Stores a new payload for `record.id`, stamping `updated` and bumping
    /// the version.
    ///
    /// Returns the stored record, or `None` when no record has that id.
    pub fn update(&self, ctx: Option<&RequestContext>, mut record: ObjectData) -> Result<Option<ObjectData>> {
        let pool = self.router.pool_for_id(&record.id)?;
        record.updated = current_time_ms();
        let params = [
            Value::Integer(record.updated),
            Value::Text(record.payload.clone()),
            Value::Text(record.id.clone()),
        ];
        let rows: Vec<(i64, i32)> = self.run_on(ctx, pool, |c| {
            c.query(&self.sql.update, &params, |row| Ok((row.get(0)?, row.get(1)?)))
        })?;

        match rows.into_iter().next() {
            Some((created, version)) => {
                record.created = created;
                record.version = version;
                self.cache.set(&record.id, CacheEntry::Object(record.clone()))?;
                Ok(Some(record))
            }
            None => {
                self.cache.set(&record.id, CacheEntry::Absent)?;
                Ok(None)
            }
        }
    }

    /// Deletes one record and caches its absence. Returns true if a row was
    /// removed.
    pub fn delete(&self, ctx: Option<&RequestContext>, id: &str) -> Result<bool> {
        let pool = self.router.pool_for_id(id)?;
        let removed = self.run_on(ctx, pool, |c| {
            c.execute(&self.sql.delete_one, &[Value::Text(id.to_string())])
        })?;
        self.cache.set(id, CacheEntry::Absent)?;
        tracing::debug!(entity = self.entity.name(), id, removed, "deleted record");
        Ok(removed > 0)
    }

    /// Looks up one record, cache first.
    pub fn lookup(&self, ctx: Option<&RequestContext>, id: &str) -> Result<Option<ObjectData>> {
        let pool = self.router.pool_for_id(id)?;

        match self.cache.get(id) {
            Some(CacheEntry::Absent) => {
                DaoMetrics::bump(&self.metrics.sentinel_hits, 1);
                return Ok(None);
            }
            Some(CacheEntry::Object(data)) => {
                DaoMetrics::bump(&self.metrics.cache_hits, 1);
                return Ok(Some(data));
            }
            _ => {}
        }

        let mut rows: Vec<ObjectData> = self.run_on(ctx, pool, |c| {
            c.query(&self.sql.select_one, &[Value::Text(id.to_string())], ObjectData::from_row)
        })?;
        let found = rows.pop();
        let entry = match &found {
            Some(data) => CacheEntry::Object(data.clone()),
            None => CacheEntry::Absent,
        };
        self.cache.set(id, entry)?;
        Ok(found)
    }

    // =========================================================================
    // Multi-record Operations
    // =========================================================================

    /// Fetches records by id from the backend, batched per pool.
    fn fetch_by_ids(&self, ctx: Option<&RequestContext>, ids: &[String]) -> Result<Vec<ObjectData>> {
        let partitions = self.router.partition_by_pool(ids)?;
        let parts = self.fan_out(partitions.keys().copied(), |pool| {
            let Some(ids) = partitions.get(&pool.id()) else {
                return Ok(Vec::new());
            };
            self.run_on(ctx, pool, |c| {
                let mut out = Vec::with_capacity(ids.len());
                for chunk in ids.chunks(IN_CHUNK) {
                    let sql = format!(
                        "SELECT {} FROM {} WHERE id IN ({})",
                        OBJECT_COLUMNS,
                        self.sql.table,
                        placeholders(chunk.len())
                    );
                    out.extend(c.query(&sql, &text_params(chunk), ObjectData::from_row)?);
                }
                Ok(out)
            })
        })?;
        Ok(parts.into_iter().flat_map(|(_, rows)| rows).collect())
    }

    /// Resolves `ids` through the cache and one fan-out round, keyed by id.
    fn lookup_found(&self, ctx: Option<&RequestContext>, ids: &[String]) -> Result<HashMap<String, ObjectData>> {
        let mut found: HashMap<String, ObjectData> = HashMap::with_capacity(ids.len());
        if ids.is_empty() {
            return Ok(found);
        }

        let cached = self.cache.get_bulk(ids);
        let mut seen = HashSet::new();
        let mut misses = Vec::new();
        for id in ids {
            match cached.get(id) {
                Some(CacheEntry::Object(data)) => {
                    DaoMetrics::bump(&self.metrics.cache_hits, 1);
                    found.insert(id.clone(), data.clone());
                }
                Some(CacheEntry::Absent) => DaoMetrics::bump(&self.metrics.sentinel_hits, 1),
                _ => {
                    if seen.insert(id.as_str()) {
                        misses.push(id.clone());
                    }
                }
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let fetched = self.fetch_by_ids(ctx, &misses)?;
        let mut entries = Vec::with_capacity(misses.len());
        for data in fetched {
            entries.push((data.id.clone(), CacheEntry::Object(data.clone())));
            found.insert(data.id.clone(), data);
        }
        for id in &misses {
            if !found.contains_key(id) {
                entries.push((id.clone(), CacheEntry::Absent));
            }
        }
        tracing::debug!(
            entity = self.entity.name(),
            requested = ids.len(),
            misses = misses.len(),
            "bulk lookup"
        );
        self.cache.set_bulk(entries)?;
        Ok(found)
    }

    /// Looks up many records.
    ///
    /// The result follows the order of `ids`; ids without a record are left
    /// out.
    pub fn lookup_many(&self, ctx: Option<&RequestContext>, ids: &[String]) -> Result<Vec<ObjectData>> {
        let found = self.lookup_found(ctx, ids)?;
        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }

    /// Looks up many records, keyed by id.
    pub fn lookup_map(&self, ctx: Option<&RequestContext>, ids: &[String]) -> Result<HashMap<String, ObjectData>> {
        self.lookup_found(ctx, ids)
    }

    /// Deletes many records with one batched delete per pool and caches
    /// their absence. Returns the number of rows removed.
    pub fn delete_many(&self, ctx: Option<&RequestContext>, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let partitions = self.router.partition_by_pool(ids)?;
        let parts = self.fan_out(partitions.keys().copied(), |pool| {
            let Some(ids) = partitions.get(&pool.id()) else {
                return Ok(0);
            };
            self.run_on(ctx, pool, |c| {
                let mut removed = 0;
                for chunk in ids.chunks(IN_CHUNK) {
                    let sql = format!(
                        "DELETE FROM {} WHERE id IN ({})",
                        self.sql.table,
                        placeholders(chunk.len())
                    );
                    removed += c.execute(&sql, &text_params(chunk))?;
                }
                Ok(removed)
            })
        })?;

        self.cache
            .set_bulk(ids.iter().map(|id| (id.clone(), CacheEntry::Absent)).collect())?;
        Ok(parts.into_iter().map(|(_, n)| n).sum())
    }

    /// Lists every record, newest first.
    pub fn scan(&self, ctx: Option<&RequestContext>, paging: Paging) -> Result<Vec<ObjectData>> {
        let mut sql = format!(
            "SELECT {} FROM {} ORDER BY created DESC, id",
            OBJECT_COLUMNS, self.sql.table
        );
        if let Some(n) = paging.per_pool() {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        let parts = self.fan_out(self.router.active_pools(), |pool| {
            self.run_on(ctx, pool, |c| c.query(&sql, &[], ObjectData::from_row))
        })?;
        Ok(merge_newest_first(parts, paging))
    }

    /// Counts every record.
    pub fn count(&self, ctx: Option<&RequestContext>) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.sql.table);
        let parts = self.fan_out(self.router.active_pools(), |pool| {
            self.run_on(ctx, pool, |c| c.query(&sql, &[], i64::from_row))
        })?;
        Ok(parts.into_iter().flat_map(|(_, n)| n).sum())
    }

    // =========================================================================
    // Typed Payloads
    // =========================================================================

    /// Serializes `bean` as the payload of a new record.
    pub fn create_bean<T: Serialize>(&self, ctx: Option<&RequestContext>, bean: &T) -> Result<ObjectData> {
        let payload = serde_json::to_string(bean)?;
        self.create(ctx, ObjectData::new("", payload))
    }

    /// Looks up a record and deserializes its payload.
    pub fn get_bean<T: DeserializeOwned>(&self, ctx: Option<&RequestContext>, id: &str) -> Result<Option<T>> {
        self.lookup(ctx, id)?
            .map(|data| serde_json::from_str(&data.payload).map_err(Error::from))
            .transpose()
    }

    /// Replaces the payload of `id` with `bean`.
    pub fn update_bean<T: Serialize>(
        &self,
        ctx: Option<&RequestContext>,
        id: &str,
        bean: &T,
    ) -> Result<Option<ObjectData>> {
        let payload = serde_json::to_string(bean)?;
        let mut record = ObjectData::new(id, payload);
        record.created = 0;
        self.update(ctx, record)
    }

    /// Looks up many records and deserializes their payloads, in id order.
    pub fn list_beans<T: DeserializeOwned>(&self, ctx: Option<&RequestContext>, ids: &[String]) -> Result<Vec<T>> {
        self.lookup_many(ctx, ids)?
            .iter()
            .map(|data| serde_json::from_str(&data.payload).map_err(Error::from))
            .collect()
    }

    // =========================================================================
    // Index Tables
    // =========================================================================

    fn index_key(&self, index: &IndexDef, values: &BTreeMap<String, FieldValue>) -> String {
        format!("ix:{}", index.lookup_key(values))
    }

    fn count_key(&self, index: &IndexDef, values: &BTreeMap<String, FieldValue>) -> String {
        format!("n:{}", index.lookup_key(values))
    }

    /// Keys to drop when a row with `fields` is written to or removed from
    /// `pool`.
    fn invalidation_keys(&self, index: &IndexDef, pool: PoolId, fields: &BTreeMap<String, Value>) -> Vec<String> {
        let values: BTreeMap<String, FieldValue> = fields
            .iter()
            .map(|(k, v)| (k.clone(), FieldValue::One(v.clone())))
            .collect();
        let index_key = self.index_key(index, &values);
        let count_key = self.count_key(index, &values);
        let on_pool = Target::Pool(pool).cache_suffix();
        vec![
            format!("{}{}", index_key, on_pool),
            format!("{}{}", count_key, on_pool),
            index_key,
            count_key,
        ]
    }

    fn invalidate(&self, keys: Vec<String>) -> Result<()> {
        for key in keys {
            self.cache.delete(&key)?;
        }
        Ok(())
    }

    /// Writes one row to index table `index` on the pool that stores
    /// `row.id`, then drops the cached lookup for the row's values.
    pub fn create_index_row(&self, ctx: Option<&RequestContext>, index: &str, row: &IndexedData) -> Result<()> {
        let def = self.entity.index(index)?;
        let pool = self.router.pool_for_id(&row.id)?;

        let mut columns = vec!["id".to_string(), "created".to_string()];
        let created = if row.created == 0 { current_time_ms() } else { row.created };
        let mut params = vec![Value::Text(row.id.clone()), Value::Integer(created)];
        let mut fields = BTreeMap::new();
        for (field, value) in &row.fields {
            let column = crate::entity::column_name(field)?;
            if def.column_type(&column).is_none() || column == "id" || column == "created" {
                return Err(Error::InvalidField(format!("{}.{}", def.table(), field)));
            }
            columns.push(quote(&column));
            params.push(value.clone());
            fields.insert(column, value.clone());
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(def.table()),
            columns.join(", "),
            placeholders(params.len())
        );
        self.run_on(ctx, pool, |c| c.execute(&sql, &params))?;
        self.invalidate(self.invalidation_keys(def, pool.id(), &fields))
    }

    /// Removes every row of index table `index` that points at `id`.
    ///
    /// Returns the number of rows removed.
    pub fn delete_index_row(&self, ctx: Option<&RequestContext>, index: &str, id: &str) -> Result<usize> {
        let def = self.entity.index(index)?;
        let pool = self.router.pool_for_id(id)?;
        let table = quote(def.table());
        let params = [Value::Text(id.to_string())];

        let (rows, removed) = self.run_on(ctx, pool, |c| {
            let rows = c.query(
                &format!("SELECT * FROM {} WHERE id = ?", table),
                &params,
                IndexedData::from_row,
            )?;
            let removed = c.execute(&format!("DELETE FROM {} WHERE id = ?", table), &params)?;
            Ok((rows, removed))
        })?;

        for row in rows {
            self.invalidate(self.invalidation_keys(def, pool.id(), &row.fields))?;
        }
        Ok(removed)
    }

    /// Finds index rows matching `values`, newest first.
    ///
    /// A [`FieldValue::Many`] matches any of its values; an empty one matches
    /// nothing and returns without touching the database.
    pub fn index_lookup(
        &self,
        ctx: Option<&RequestContext>,
        index: &str,
        values: &BTreeMap<String, FieldValue>,
        paging: Paging,
        target: Target,
    ) -> Result<Vec<IndexedData>> {
        let def = self.entity.index(index)?;
        let Some(predicate) = build_predicate(def, values)? else {
            return Ok(Vec::new());
        };
        let target = self.canonical_target(target);

        let key = format!(
            "{}{}{}",
            self.index_key(def, values),
            target.cache_suffix(),
            paging.cache_suffix()
        );
        if let Some(CacheEntry::Index(rows)) = self.cache.get(&key) {
            DaoMetrics::bump(&self.metrics.cache_hits, 1);
            return Ok(rows);
        }

        let mut sql = format!(
            "SELECT * FROM {}{} ORDER BY created DESC, id",
            quote(def.table()),
            predicate.clause
        );
        if let Some(n) = paging.per_pool() {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        let parts = self.fan_out(self.targets(target), |pool| {
            self.run_on(ctx, pool, |c| c.query(&sql, &predicate.params, IndexedData::from_row))
        })?;
        let rows = merge_newest_first(parts, paging);

        self.cache.set(&key, CacheEntry::Index(rows.clone()))?;
        Ok(rows)
    }

    /// Counts index rows matching `values`.
    pub fn index_count(
        &self,
        ctx: Option<&RequestContext>,
        index: &str,
        values: &BTreeMap<String, FieldValue>,
        target: Target,
    ) -> Result<i64> {
        let def = self.entity.index(index)?;
        let Some(predicate) = build_predicate(def, values)? else {
            return Ok(0);
        };
        let target = self.canonical_target(target);

        let key = format!("{}{}", self.count_key(def, values), target.cache_suffix());
        if let Some(CacheEntry::Count(n)) = self.cache.get(&key) {
            DaoMetrics::bump(&self.metrics.cache_hits, 1);
            return Ok(n);
        }

        let sql = format!("SELECT COUNT(*) FROM {}{}", quote(def.table()), predicate.clause);
        let parts = self.fan_out(self.targets(target), |pool| {
            self.run_on(ctx, pool, |c| c.query(&sql, &predicate.params, i64::from_row))
        })?;
        let total: i64 = parts.into_iter().flat_map(|(_, n)| n).sum();

        self.cache.set(&key, CacheEntry::Count(total))?;
        Ok(total)
    }

    /// Runs an index lookup and resolves the matched ids to records.
    pub fn index_objects(
        &self,
        ctx: Option<&RequestContext>,
        index: &str,
        values: &BTreeMap<String, FieldValue>,
        paging: Paging,
        target: Target,
    ) -> Result<Vec<ObjectData>> {
        let rows = self.index_lookup(ctx, index, values, paging, target)?;
        let mut seen = HashSet::new();
        let ids: Vec<String> = rows
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .map(|r| r.id)
            .collect();
        self.lookup_many(ctx, &ids)
    }

    // =========================================================================
    // Raw Statements
    // =========================================================================

    /// Runs a read on one pool and decodes every row as `T`.
    pub fn query_pool<T: FromRow>(
        &self,
        ctx: Option<&RequestContext>,
        pool: PoolId,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<T>> {
        let pool = self.router.pool(self.router.canonical(pool))?;
        self.run_on(ctx, pool, |c| c.query(sql, params, T::from_row))
    }

    /// Runs a read on every active pool and concatenates the rows in pool
    /// order.
    pub fn query_all<T: FromRow + Send>(
        &self,
        ctx: Option<&RequestContext>,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<T>> {
        let parts = self.fan_out(self.router.active_pools(), |pool| {
            self.run_on(ctx, pool, |c| c.query(sql, params, T::from_row))
        })?;
        Ok(parts.into_iter().flat_map(|(_, rows)| rows).collect())
    }

    /// Runs a write on every active pool and returns the total affected row
    /// count.
    ///
    /// The cache is not touched; callers that change cached rows should
    /// delete or re-read them.
    pub fn update_all(&self, ctx: Option<&RequestContext>, sql: &str, params: &[Value]) -> Result<usize> {
        let parts = self.fan_out(self.router.active_pools(), |pool| {
            self.run_on(ctx, pool, |c| c.execute(sql, params))
        })?;
        Ok(parts.into_iter().map(|(_, n)| n).sum())
    }

    // =========================================================================
    // Export
    // =========================================================================

    /// Streams every payload into `out`, one line per record, pool by pool.
    ///
    /// With `fields`, each line holds the named top-level JSON fields
    /// separated by tabs, `NULL` standing in for missing or null ones.
    /// Without, each line is the whole payload. Returns the number of lines
    /// written.
    pub fn export<W: Write>(
        &self,
        ctx: Option<&RequestContext>,
        out: &mut W,
        fields: Option<&[&str]>,
    ) -> Result<usize> {
        let sql = format!("SELECT json FROM {} ORDER BY created, id", self.sql.table);
        let mut lines = 0usize;
        self.fanout.run_sequential(self.router.active_pools(), |pool| {
            self.run_on(ctx, pool, |c| {
                c.for_each_row(&sql, &[], |row| {
                    let payload: String = row.get(0)?;
                    match fields {
                        None => writeln!(out, "{}", payload)?,
                        Some(fields) => writeln!(out, "{}", export_line(&payload, fields)?)?,
                    }
                    lines += 1;
                    Ok(())
                })
            })
        })?;
        out.flush()?;
        tracing::info!(entity = self.entity.name(), lines, "export finished");
        Ok(lines)
    }

    // =========================================================================
    // Request Completion
    // =========================================================================

    /// Commits every pool `ctx` touched. Connections stay pinned.
    pub fn commit(&self, ctx: &RequestContext) -> Result<()> {
        self.affinity.complete_all(&self.fanout, ctx, Outcome::Commit)
    }

    /// Rolls back every pool `ctx` touched. Connections stay pinned.
    pub fn rollback(&self, ctx: &RequestContext) -> Result<()> {
        self.affinity.complete_all(&self.fanout, ctx, Outcome::Rollback)
    }

    /// Releases every connection `ctx` pinned. Open transactions roll back.
    pub fn close(&self, ctx: &RequestContext) -> Result<usize> {
        self.affinity.release(ctx)
    }

    /// Commits or rolls back, then releases. The connections are released
    /// even when completion fails.
    pub fn finish(&self, ctx: &RequestContext, outcome: Outcome) -> Result<()> {
        let completed = self.affinity.complete_all(&self.fanout, ctx, outcome);
        self.affinity.release(ctx)?;
        completed
    }
}

fn export_line(payload: &str, fields: &[&str]) -> Result<String> {
    let doc: serde_json::Value = serde_json::from_str(payload)?;
    let parts: Vec<String> = fields
        .iter()
        .map(|f| match doc.get(*f) {
            None | Some(serde_json::Value::Null) => "NULL".to_string(),
            Some(serde_json::Value::String(s)) => s.replace('\t', "\\t").replace('\n', "\\n"),
            Some(other) => other.to_string(),
        })
        .collect();
    Ok(parts.join("\t"))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ColumnType;

    fn email_index() -> IndexDef {
        IndexDef::new("user_email", &[("email", ColumnType::Text), ("org.id", ColumnType::Integer)]).unwrap()
    }

    #[test]
    fn test_predicate_shapes() {
        let mut values = BTreeMap::new();
        values.insert("email".to_string(), FieldValue::from("a@b"));
        values.insert("org.id".to_string(), FieldValue::from(vec![1i64, 2, 3]));

        let p = build_predicate(&email_index(), &values).unwrap().unwrap();
        assert_eq!(p.clause, " WHERE \"email\" = ? AND \"org__id\" IN (?, ?, ?)");
        assert_eq!(p.params.len(), 4);
    }

    #[test]
    fn test_predicate_null_and_empty_set() {
        let mut values = BTreeMap::new();
        values.insert("email".to_string(), FieldValue::One(Value::Null));
        let p = build_predicate(&email_index(), &values).unwrap().unwrap();
        assert_eq!(p.clause, " WHERE \"email\" IS NULL");
        assert!(p.params.is_empty());

        values.insert("org.id".to_string(), FieldValue::from(Vec::<i64>::new()));
        assert_eq!(build_predicate(&email_index(), &values).unwrap(), None);
    }

    #[test]
    fn test_predicate_rejects_unknown_field() {
        let mut values = BTreeMap::new();
        values.insert("phone".to_string(), FieldValue::from("1"));
        assert!(matches!(
            build_predicate(&email_index(), &values),
            Err(Error::InvalidField(_))
        ));
    }

    #[test]
    fn test_merge_orders_newest_first_and_pages() {
        let row = |id: &str, created: i64| IndexedData {
            id: id.to_string(),
            created,
            fields: BTreeMap::new(),
        };
        let parts = vec![
            (PoolId::from_raw(0), vec![row("0-a", 50), row("0-b", 10)]),
            (PoolId::from_raw(1), vec![row("1-c", 40), row("1-d", 40), row("1-e", 5)]),
        ];

        let all = merge_newest_first(parts.clone(), Paging::ALL);
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["0-a", "1-c", "1-d", "0-b", "1-e"]);

        let page = merge_newest_first(parts, Paging::new(1, 2));
        let ids: Vec<&str> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1-c", "1-d"]);
    }

    #[test]
    fn test_paging_cache_suffix() {
        assert_eq!(Paging::ALL.cache_suffix(), "");
        assert_eq!(Paging::new(20, 10).cache_suffix(), ":20:10");
        assert_eq!(Paging::new(0, 5).per_pool(), Some(5));
        assert_eq!(Paging::new(20, 10).per_pool(), Some(30));
        assert_eq!(Paging::new(usize::MAX, 1).per_pool(), None);
        assert_eq!(Paging::first(usize::MAX).per_pool(), None);
    }

    #[test]
    fn test_export_line() {
        let line = export_line(r#"{"name":"ann","age":31,"tags":["x"],"gone":null}"#, &["name", "age", "gone", "missing", "tags"])
            .unwrap();
        assert_eq!(line, "ann\t31\tNULL\tNULL\t[\"x\"]");
        assert!(export_line("not json", &["a"]).is_err());
    }
}
