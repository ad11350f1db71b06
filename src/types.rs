//! # Domain Types for dbshard
//!
//! This module defines the core types shared by every component: shard and pool
//! numbers, the object identifier that carries a shard inside it, the stored
//! record, and the values used to build index predicates.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Shard numbers and pool numbers are both small integers, and mixing them up
//! is the classic sharding bug (querying pool 5 when you meant shard 5). Each
//! gets its own newtype so the compiler rejects the mix-up.
//!
//! ## Identifier Layout
//!
//! ```text
//!   "17-9f86d081884c7d659a2feaa0c55ad015"
//!    ──┬ ┬ ───────────────┬───────────────
//!      │ │                └─ body (opaque, ASCII, non-empty)
//!      │ └─ separator (first '-')
//!      └─ shard number (decimal ASCII digits)
//! ```
//!
//! Decoding is pure string work. Two ids with the same prefix always route to
//! the same pool, no datasource involved.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Value;

use crate::error::{Error, Result};

/// Returns the current wall-clock time in Unix milliseconds.
pub fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Shard and Pool Numbers
// =============================================================================

/// A logical shard number.
///
/// Shards are cheap: there are typically many more of them than physical pools,
/// and a resolver hands them out either by hash or by time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(u32);

impl ShardId {
    /// The first shard.
    pub const FIRST: ShardId = ShardId(0);

    /// Creates a ShardId from a raw value.
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a physical connection pool.
///
/// `PoolId(n)` owns shards `n * shards_per_pool .. (n + 1) * shards_per_pool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(u32);

impl PoolId {
    /// Creates a PoolId from a raw value.
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u32 {
        self.0
    }

    /// Returns the raw value as an index into the pool table.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Object Identifier
// =============================================================================

const ID_SEPARATOR: char = '-';

/// A record id with its shard number embedded.
///
/// # Contract
///
/// [`ObjectId::parse`] and [`ObjectId::format`] are pure and inverse to each
/// other: `parse(format(s, b)) == (s, b)` for every valid body.
///
/// # Example
///
/// ```rust
/// use dbshard::types::{ObjectId, ShardId};
///
/// let id = ObjectId::new(ShardId::from_raw(17), "abc").unwrap();
/// assert_eq!(id.to_string(), "17-abc");
///
/// let parsed = ObjectId::parse("17-abc").unwrap();
/// assert_eq!(parsed.shard(), ShardId::from_raw(17));
/// assert_eq!(parsed.body(), "abc");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    shard: ShardId,
    body: String,
}

impl ObjectId {
    /// Creates an id from a shard and a body, validating the body.
    pub fn new(shard: ShardId, body: impl Into<String>) -> Result<Self> {
        let body = body.into();
        if body.is_empty() {
            return Err(Error::invalid_id(&body, "empty body"));
        }
        if !body.is_ascii() {
            return Err(Error::invalid_id(&body, "body is not ASCII"));
        }
        Ok(Self { shard, body })
    }

    /// Creates an id on `shard` with a freshly generated body.
    pub fn generate(shard: ShardId) -> Self {
        Self {
            shard,
            body: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Creates a fresh id that lives on the same shard as `other`.
    ///
    /// Used to colocate dependent records with their parent.
    pub fn with_same_shard(other: &ObjectId) -> Self {
        Self::generate(other.shard)
    }

    /// Decodes an id string into its shard number and body.
    pub fn parse(raw: &str) -> Result<Self> {
        if !raw.is_ascii() {
            return Err(Error::invalid_id(raw, "id is not ASCII"));
        }
        let (prefix, body) = raw
            .split_once(ID_SEPARATOR)
            .ok_or_else(|| Error::invalid_id(raw, "missing shard prefix"))?;

        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid_id(raw, "malformed shard prefix"));
        }
        if prefix.len() > 1 && prefix.starts_with('0') {
            return Err(Error::invalid_id(raw, "shard prefix has leading zeros"));
        }
        let shard: u32 = prefix
            .parse()
            .map_err(|_| Error::invalid_id(raw, "shard prefix out of range"))?;
        if body.is_empty() {
            return Err(Error::invalid_id(raw, "empty body"));
        }

        Ok(Self {
            shard: ShardId(shard),
            body: body.to_string(),
        })
    }

    /// Encodes a shard number and body into an id string.
    pub fn format(shard: ShardId, body: &str) -> String {
        format!("{}{}{}", shard, ID_SEPARATOR, body)
    }

    /// Returns the embedded shard number.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Returns the body (everything after the separator).
    pub fn body(&self) -> &str {
        &self.body
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.shard, ID_SEPARATOR, self.body)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Shard Candidates
// =============================================================================

/// Something a [`ShardResolver`](crate::resolver::ShardResolver) can place.
///
/// Hash resolvers use [`shard_hash`](Shardable::shard_hash); time-windowed
/// resolvers use [`created_ms`](Shardable::created_ms), where `None` means
/// "now".
pub trait Shardable {
    /// Stable hash of the candidate's identity.
    fn shard_hash(&self) -> u64;

    /// Creation time in Unix milliseconds, if known.
    fn created_ms(&self) -> Option<i64> {
        None
    }
}

impl Shardable for u64 {
    fn shard_hash(&self) -> u64 {
        *self
    }
}

impl Shardable for String {
    fn shard_hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.as_bytes())
    }
}

// =============================================================================
// Stored Records
// =============================================================================

/// One stored record: an immutable id, timestamps, a version and an opaque
/// payload (JSON text by convention).
///
/// # Columns
///
/// Maps 1:1 onto the object table: `id`, `created`, `updated`, `version`,
/// `json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectData {
    /// Shard-carrying id, immutable after creation.
    pub id: String,
    /// Creation time (Unix ms).
    pub created: i64,
    /// Last update time (Unix ms).
    pub updated: i64,
    /// Bumped on every update.
    pub version: i32,
    /// Serialized document.
    pub payload: String,
}

impl ObjectData {
    /// Creates a record stamped with the current time and version 1.
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        let now = current_time_ms();
        Self {
            id: id.into(),
            created: now,
            updated: now,
            version: 1,
            payload: payload.into(),
        }
    }

    /// Parses the id of this record.
    pub fn object_id(&self) -> Result<ObjectId> {
        ObjectId::parse(&self.id)
    }
}

impl Shardable for ObjectData {
    fn shard_hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.payload.as_bytes())
    }

    fn created_ms(&self) -> Option<i64> {
        if self.created == 0 {
            None
        } else {
            Some(self.created)
        }
    }
}

/// A row of an index table: the indexed record's id, its creation time and
/// the indexed columns.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedData {
    /// Id of the record this index row points at.
    pub id: String,
    /// Creation time of the index row (Unix ms).
    pub created: i64,
    /// Remaining columns by name.
    pub fields: BTreeMap<String, Value>,
}

// =============================================================================
// Predicate Values
// =============================================================================

/// The value side of one `field -> value` predicate in an index lookup.
///
/// `One` becomes `col = ?` (or `col IS NULL`), `Many` becomes `col IN (...)`.
/// An empty `Many` can never match, and lookups short-circuit on it without
/// issuing SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A single scalar value.
    One(Value),
    /// A set of alternatives.
    Many(Vec<Value>),
}

impl FieldValue {
    /// Returns true for an empty `Many`.
    pub fn is_empty_set(&self) -> bool {
        matches!(self, FieldValue::Many(values) if values.is_empty())
    }

    /// Renders the value for use inside a cache key.
    pub(crate) fn signature(&self) -> String {
        match self {
            FieldValue::One(v) => value_signature(v),
            FieldValue::Many(vs) => {
                let parts: Vec<String> = vs.iter().map(value_signature).collect();
                format!("[{}]", parts.join(","))
            }
        }
    }
}

fn value_signature(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => format!("'{}'", s),
        Value::Blob(b) => format!("x{}", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::One(v)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::One(Value::Text(s.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::One(Value::Text(s))
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::One(Value::Integer(i))
    }
}

impl From<i32> for FieldValue {
    fn from(i: i32) -> Self {
        FieldValue::One(Value::Integer(i as i64))
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::One(Value::Integer(b as i64))
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::One(Value::Real(f))
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(items: Vec<T>) -> Self {
        let values = items
            .into_iter()
            .flat_map(|item| match item.into() {
                FieldValue::One(v) => vec![v],
                FieldValue::Many(vs) => vs,
            })
            .collect();
        FieldValue::Many(values)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_are_inverse() {
        let raw = ObjectId::format(ShardId::from_raw(42), "deadbeef");
        assert_eq!(raw, "42-deadbeef");

        let id = ObjectId::parse(&raw).unwrap();
        assert_eq!(id.shard(), ShardId::from_raw(42));
        assert_eq!(id.body(), "deadbeef");
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn test_body_may_contain_separator() {
        let id = ObjectId::parse("3-a-b-c").unwrap();
        assert_eq!(id.shard().as_raw(), 3);
        assert_eq!(id.body(), "a-b-c");
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        for raw in ["", "abc", "-abc", "x1-abc", "+1-abc", "12-", "99999999999-abc", "1-é", "01-abc", "00-x"] {
            let err = ObjectId::parse(raw).unwrap_err();
            assert!(matches!(err, Error::InvalidId { .. }), "{raw} should be invalid");
        }
    }

    #[test]
    fn test_generated_ids_keep_shard() {
        let parent = ObjectId::generate(ShardId::from_raw(9));
        let child = ObjectId::with_same_shard(&parent);

        assert_eq!(child.shard(), parent.shard());
        assert_ne!(child.body(), parent.body());
        assert_eq!(ObjectId::parse(&child.to_string()).unwrap(), child);
    }

    #[test]
    fn test_object_data_created_zero_means_now() {
        let mut data = ObjectData::new("1-a", "{}");
        assert!(data.created_ms().is_some());
        data.created = 0;
        assert_eq!(data.created_ms(), None);
    }

    #[test]
    fn test_field_value_from_vec() {
        let v: FieldValue = vec!["a", "b"].into();
        assert_eq!(
            v,
            FieldValue::Many(vec![Value::Text("a".into()), Value::Text("b".into())])
        );
        assert!(!v.is_empty_set());
        assert!(FieldValue::from(Vec::<i64>::new()).is_empty_set());
        assert_eq!(v.signature(), "['a','b']");
    }
}
