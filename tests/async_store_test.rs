mod common;

use std::sync::Arc;

use common::{count_rows, lru, test_cluster, user, user_entity, Options};
use dbshard::{Outcome, Paging, RequestContext, ShardStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_share_one_store() {
    let tc = test_cluster(Options {
        cache: Some(lru(10_000)),
        ..Options::default()
    });
    let store = ShardStore::open(&tc.cluster, user_entity());

    let mut handles = Vec::new();
    for task in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..25 {
                let record = store
                    .create(None, user(&format!("t{}-{}", task, i)))
                    .await
                    .unwrap();
                ids.push(record.id);
            }
            ids
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.extend(h.await.unwrap());
    }

    assert_eq!(store.count(None).await.unwrap(), 200);
    let found = store.lookup_many(None, ids.clone()).await.unwrap();
    assert_eq!(found.len(), 200);
    assert_eq!(store.metrics().cache_hits, 200);

    let newest = store.scan(None, Paging::first(5)).await.unwrap();
    assert_eq!(newest.len(), 5);
    assert!(newest.windows(2).all(|w| w[0].created >= w[1].created));
}

#[tokio::test]
async fn test_request_context_across_awaits() {
    let tc = test_cluster(Options {
        autocommit: false,
        ..Options::default()
    });
    let store = ShardStore::open(&tc.cluster, user_entity());
    let ctx = Arc::new(RequestContext::new());

    for i in 0..6 {
        store
            .create(Some(Arc::clone(&ctx)), user(&format!("a{}", i)))
            .await
            .unwrap();
    }
    let total: i64 = tc.paths.iter().map(|p| count_rows(p, "user")).sum();
    assert_eq!(total, 0);

    store.finish(Arc::clone(&ctx), Outcome::Commit).await.unwrap();
    let total: i64 = tc.paths.iter().map(|p| count_rows(p, "user")).sum();
    assert_eq!(total, 6);
    assert_eq!(tc.cluster.affinity().pinned_count(), 0);
}
