mod common;

use common::{count_rows, test_cluster, user, user_entity, Options};
use dbshard::{EntityKind, ObjectData, ObjectId, Outcome, RequestContext, ShardId};

fn transactional() -> common::TestCluster {
    test_cluster(Options {
        pools: 3,
        shards_per_pool: 2,
        autocommit: false,
        ..Options::default()
    })
}

fn total_rows(tc: &common::TestCluster, table: &str) -> i64 {
    tc.paths.iter().map(|p| count_rows(p, table)).sum()
}

#[test]
fn test_one_connection_per_pool_per_request() {
    let tc = transactional();
    let dao = tc.cluster.dao(user_entity());
    let ctx = RequestContext::new();

    for i in 0..30 {
        dao.create(Some(&ctx), user(&format!("c{}", i))).unwrap();
    }
    dao.count(Some(&ctx)).unwrap();

    let touched = ctx.touched_pools();
    assert!(!touched.is_empty());
    assert_eq!(tc.cluster.affinity().pinned_count(), touched.len());
    for pool in tc.cluster.pools() {
        assert!(pool.open_connections() <= 1, "pool {} opened more than one", pool.id());
    }

    dao.finish(&ctx, Outcome::Commit).unwrap();
    assert_eq!(tc.cluster.affinity().pinned_count(), 0);
    assert!(ctx.touched_pools().is_empty());
}

#[test]
fn test_commit_makes_writes_visible() {
    let tc = transactional();
    let dao = tc.cluster.dao(user_entity());
    let ctx = RequestContext::new();

    for i in 0..10 {
        dao.create(Some(&ctx), user(&format!("v{}", i))).unwrap();
    }

    // the request sees its own writes before commit
    assert_eq!(dao.count(Some(&ctx)).unwrap(), 10);
    assert_eq!(total_rows(&tc, "user"), 0);

    dao.commit(&ctx).unwrap();
    assert_eq!(total_rows(&tc, "user"), 10);
    // the count pinned every pool
    assert_eq!(dao.close(&ctx).unwrap(), 3);
}

#[test]
fn test_rollback_discards_writes_on_every_pool() {
    let tc = transactional();
    let dao = tc.cluster.dao(user_entity());
    let ctx = RequestContext::new();

    for shard in 0..6 {
        let id = ObjectId::format(ShardId::from_raw(shard), "r");
        dao.create(Some(&ctx), ObjectData::new(id, "{}")).unwrap();
    }
    assert_eq!(ctx.touched_pools().len(), 3);

    dao.finish(&ctx, Outcome::Rollback).unwrap();
    assert_eq!(total_rows(&tc, "user"), 0);
    assert_eq!(dao.count(None).unwrap(), 0);
}

#[test]
fn test_close_without_commit_rolls_back() {
    let tc = transactional();
    let dao = tc.cluster.dao(user_entity());
    let ctx = RequestContext::new();

    dao.create(Some(&ctx), user("lost")).unwrap();
    assert_eq!(dao.close(&ctx).unwrap(), 1);
    assert_eq!(total_rows(&tc, "user"), 0);

    // the connection went back to its pool and is reusable
    let kept = dao.create(None, user("kept")).unwrap();
    assert_eq!(dao.lookup(None, &kept.id).unwrap().unwrap().id, kept.id);
    assert_eq!(total_rows(&tc, "user"), 1);
}

#[test]
fn test_context_spans_entities() {
    let tc = transactional();
    let orders = EntityKind::new("orders").unwrap();
    tc.cluster.provision(&orders).unwrap();

    let users = tc.cluster.dao(user_entity());
    let orders = tc.cluster.dao(orders);
    let ctx = RequestContext::new();

    let id = ObjectId::format(ShardId::from_raw(1), "same");
    users.create(Some(&ctx), ObjectData::new(id.clone(), "{}")).unwrap();
    orders.create(Some(&ctx), ObjectData::new(id, "{}")).unwrap();

    // both entities share the one pinned connection to pool 0
    assert_eq!(tc.cluster.affinity().pinned_count(), 1);
    assert_eq!(tc.cluster.pools()[0].open_connections(), 1);

    tc.cluster.finish(&ctx, Outcome::Commit).unwrap();
    assert_eq!(total_rows(&tc, "user"), 1);
    assert_eq!(total_rows(&tc, "orders"), 1);
}

#[test]
fn test_contexts_are_isolated() {
    let tc = transactional();
    let dao = tc.cluster.dao(user_entity());
    let a = RequestContext::new();
    let b = RequestContext::new();
    assert_ne!(a.id(), b.id());

    dao.create(Some(&a), ObjectData::new(ObjectId::format(ShardId::from_raw(0), "a"), "{}"))
        .unwrap();
    dao.create(Some(&b), ObjectData::new(ObjectId::format(ShardId::from_raw(2), "b"), "{}"))
        .unwrap();
    assert_eq!(tc.cluster.affinity().pinned_count(), 2);

    dao.finish(&a, Outcome::Commit).unwrap();
    dao.finish(&b, Outcome::Rollback).unwrap();
    assert_eq!(count_rows(&tc.paths[0], "user"), 1);
    assert_eq!(count_rows(&tc.paths[1], "user"), 0);
}

#[test]
fn test_autocommit_pools_ignore_completion() {
    let tc = test_cluster(Options::default());
    let dao = tc.cluster.dao(user_entity());
    let ctx = RequestContext::new();

    dao.create(Some(&ctx), user("auto")).unwrap();
    assert_eq!(total_rows(&tc, "user"), 1);

    dao.finish(&ctx, Outcome::Rollback).unwrap();
    assert_eq!(total_rows(&tc, "user"), 1);
}
