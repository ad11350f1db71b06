//! # Table Provisioning
//!
//! The dao never issues DDL. Tables are created up front by the composition
//! root (see [`Cluster::provision`](crate::cluster::Cluster::provision)) on
//! every physical database, once per distinct endpoint.
//!
//! ## Table Layout
//!
//! ```text
//!  <entity>                         <index table>
//!  ┌────────────────────┐           ┌────────────────────┐
//!  │ id TEXT (PK)       │◄──────────│ id TEXT            │
//!  │ created INTEGER    │           │ created INTEGER    │
//!  │ updated INTEGER    │           │ <declared columns> │
//!  │ version INTEGER    │           └────────────────────┘
//!  │ json TEXT          │
//!  └────────────────────┘
//! ```
//!
//! Both kinds of table are indexed on `created` because every listing is
//! ordered newest first. Index tables are additionally indexed on their
//! declared columns (unique when the index says so) and on `id` for deletes.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::entity::{quote, EntityKind, IndexDef};
use crate::error::Result;
use crate::pool::PhysicalPool;

/// DDL for an entity's object table.
pub fn object_table_ddl(entity: &EntityKind) -> Vec<String> {
    let table = entity.name();
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
    id      TEXT PRIMARY KEY,
    created INTEGER NOT NULL,
    updated INTEGER NOT NULL,
    version INTEGER NOT NULL,
    json    TEXT NOT NULL
)",
            quote(table)
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}(created)",
            quote(&format!("{}_created", table)),
            quote(table)
        ),
    ]
}

/// DDL for one index table.
pub fn index_table_ddl(index: &IndexDef) -> Vec<String> {
    let table = index.table();
    let mut columns = vec![
        "    id      TEXT NOT NULL".to_string(),
        "    created INTEGER NOT NULL".to_string(),
    ];
    for (name, ty) in index.columns() {
        columns.push(format!("    {} {}", quote(name), ty.sql_type()));
    }

    let mut ddl = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            quote(table),
            columns.join(",\n")
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}(id)",
            quote(&format!("{}_id", table)),
            quote(table)
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}(created)",
            quote(&format!("{}_created", table)),
            quote(table)
        ),
    ];

    if !index.columns().is_empty() {
        let cols: Vec<String> = index.columns().iter().map(|(n, _)| quote(n)).collect();
        ddl.push(format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {}({})",
            if index.is_unique() { "UNIQUE " } else { "" },
            quote(&format!("{}_cols", table)),
            quote(table),
            cols.join(", ")
        ));
    }
    ddl
}

/// Creates the entity's tables on one pool. Idempotent.
pub fn provision_pool(pool: &Arc<PhysicalPool>, entity: &EntityKind) -> Result<()> {
    let mut conn = pool.get(true)?;
    let statements = object_table_ddl(entity)
        .into_iter()
        .chain(entity.indexes().iter().flat_map(index_table_ddl));
    for sql in statements {
        conn.execute(&sql, &[])?;
    }
    Ok(())
}

/// Creates the entity's tables on every distinct endpoint among `pools`.
///
/// Returns the number of databases provisioned.
pub fn provision(pools: &[Arc<PhysicalPool>], entity: &EntityKind) -> Result<usize> {
    let mut done: BTreeSet<&str> = BTreeSet::new();
    for pool in pools {
        if !done.insert(pool.endpoint()) {
            continue;
        }
        provision_pool(pool, entity)?;
        tracing::info!(entity = entity.name(), pool = %pool.id(), endpoint = pool.endpoint(), "provisioned tables");
    }
    Ok(done.len())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ColumnType;
    use crate::pool::{PoolConfig, DEFAULT_ACQUIRE_TIMEOUT};
    use crate::types::PoolId;

    fn user_kind() -> EntityKind {
        EntityKind::new("user")
            .unwrap()
            .with_index(
                IndexDef::new("user_email", &[("email", ColumnType::Text)])
                    .unwrap()
                    .unique(),
            )
    }

    fn table_names(pool: &Arc<PhysicalPool>) -> Vec<String> {
        pool.get(true)
            .unwrap()
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                &[],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_provision_creates_tables_once_per_endpoint() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let a = dir.path().join("a.db").to_string_lossy().into_owned();
        let b = dir.path().join("b.db").to_string_lossy().into_owned();
        let pools: Vec<_> = [&a, &b, &a]
            .iter()
            .enumerate()
            .map(|(i, e)| {
                PhysicalPool::new(PoolId::from_raw(i as u32), PoolConfig::new(e.as_str()), DEFAULT_ACQUIRE_TIMEOUT)
                    .unwrap()
            })
            .collect();

        assert_eq!(provision(&pools, &user_kind()).unwrap(), 2);
        assert_eq!(table_names(&pools[0]), vec!["user", "user_email"]);
        assert_eq!(table_names(&pools[1]), vec!["user", "user_email"]);

        // second run is a no-op
        assert_eq!(provision(&pools, &user_kind()).unwrap(), 2);
    }

    #[test]
    fn test_unique_index_is_enforced() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("u.db");
        let pool = PhysicalPool::new(
            PoolId::from_raw(0),
            PoolConfig::new(path.to_string_lossy()),
            DEFAULT_ACQUIRE_TIMEOUT,
        )
        .unwrap();
        provision_pool(&pool, &user_kind()).unwrap();

        let mut conn = pool.get(true).unwrap();
        let insert = "INSERT INTO \"user_email\" (id, created, \"email\") VALUES ('0-a', 1, 'x@y')";
        conn.execute(insert, &[]).unwrap();
        assert!(conn.execute(insert, &[]).is_err());
    }
}
