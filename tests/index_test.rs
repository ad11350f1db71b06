mod common;

use std::collections::BTreeMap;

use common::{index_row, lru, test_cluster, user, user_entity, Options, EMAIL_INDEX, ORG_INDEX};
use dbshard::{Error, FieldValue, ObjectData, Paging, ShardedDao, Target};
use rusqlite::types::Value;

fn by_email(email: impl Into<FieldValue>) -> BTreeMap<String, FieldValue> {
    let mut values = BTreeMap::new();
    values.insert("email".to_string(), email.into());
    values
}

fn add_user(dao: &ShardedDao, email: &str, created: i64) -> ObjectData {
    let record = dao.create(None, user(email)).unwrap();
    dao.create_index_row(
        None,
        EMAIL_INDEX,
        &index_row(&record.id, created, &[("email", Value::Text(email.to_string()))]),
    )
    .unwrap();
    record
}

#[test]
fn test_in_lookup_merges_pools_newest_first() {
    let tc = test_cluster(Options::default());
    let dao = tc.cluster.dao(user_entity());

    let users: Vec<ObjectData> = (0..9)
        .map(|i| add_user(&dao, &format!("e{}@x", i), 100 + i as i64))
        .collect();

    let rows = dao
        .index_lookup(
            None,
            EMAIL_INDEX,
            &by_email(vec!["e1@x", "e4@x", "e7@x", "nobody@x"]),
            Paging::ALL,
            Target::All,
        )
        .unwrap();
    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec![users[7].id.as_str(), users[4].id.as_str(), users[1].id.as_str()]);
    assert_eq!(rows[0].fields["email"], Value::Text("e7@x".into()));
    assert_eq!(rows[0].created, 107);

    let page = dao
        .index_lookup(
            None,
            EMAIL_INDEX,
            &by_email(vec!["e1@x", "e4@x", "e7@x"]),
            Paging::new(1, 1),
            Target::All,
        )
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, users[4].id);

    let count = dao
        .index_count(None, EMAIL_INDEX, &by_email(vec!["e1@x", "e4@x"]), Target::All)
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn test_empty_set_matches_nothing_without_sql() {
    let tc = test_cluster(Options::default());
    let dao = tc.cluster.dao(user_entity());
    add_user(&dao, "a@x", 1);

    let before = dao.metrics();
    let empty = FieldValue::from(Vec::<String>::new());
    assert!(dao
        .index_lookup(None, EMAIL_INDEX, &by_email(empty.clone()), Paging::ALL, Target::All)
        .unwrap()
        .is_empty());
    assert_eq!(dao.index_count(None, EMAIL_INDEX, &by_email(empty), Target::All).unwrap(), 0);
    assert_eq!(dao.metrics(), before);
}

#[test]
fn test_null_and_multi_column_lookups() {
    let tc = test_cluster(Options::default());
    let dao = tc.cluster.dao(user_entity());

    let a = dao.create(None, user("a")).unwrap();
    let b = dao.create(None, user("b")).unwrap();
    dao.create_index_row(None, EMAIL_INDEX, &index_row(&a.id, 5, &[("email", Value::Null)]))
        .unwrap();
    dao.create_index_row(
        None,
        ORG_INDEX,
        &index_row(&a.id, 5, &[("org.id", Value::Integer(7)), ("active", Value::Integer(1))]),
    )
    .unwrap();
    dao.create_index_row(
        None,
        ORG_INDEX,
        &index_row(&b.id, 6, &[("org.id", Value::Integer(7)), ("active", Value::Integer(0))]),
    )
    .unwrap();

    let nulls = dao
        .index_lookup(None, EMAIL_INDEX, &by_email(Value::Null), Paging::ALL, Target::All)
        .unwrap();
    assert_eq!(nulls.len(), 1);
    assert_eq!(nulls[0].id, a.id);

    let mut values = BTreeMap::new();
    values.insert("org.id".to_string(), FieldValue::from(7i64));
    values.insert("active".to_string(), FieldValue::from(true));
    let active = dao
        .index_lookup(None, ORG_INDEX, &values, Paging::ALL, Target::All)
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].fields["org__id"], Value::Integer(7));

    values.remove("active");
    let objects = dao
        .index_objects(None, ORG_INDEX, &values, Paging::ALL, Target::All)
        .unwrap();
    assert_eq!(objects.iter().map(|o| o.id.clone()).collect::<Vec<_>>(), vec![b.id, a.id]);
}

#[test]
fn test_pool_target_limits_the_search() {
    let tc = test_cluster(Options::default());
    let dao = tc.cluster.dao(user_entity());
    let router = tc.cluster.router();

    let users: Vec<ObjectData> = (0..12).map(|i| add_user(&dao, "same@x", i)).collect();
    let pool = router.pool_id_for_id(&users[0].id).unwrap();
    let on_pool = users
        .iter()
        .filter(|u| router.pool_id_for_id(&u.id).unwrap() == pool)
        .count();

    let rows = dao
        .index_lookup(None, EMAIL_INDEX, &by_email("same@x"), Paging::ALL, Target::Pool(pool))
        .unwrap();
    assert_eq!(rows.len(), on_pool);
    assert!(rows.iter().all(|r| router.pool_id_for_id(&r.id).unwrap() == pool));

    assert_eq!(
        dao.index_count(None, EMAIL_INDEX, &by_email("same@x"), Target::Pool(pool))
            .unwrap(),
        on_pool as i64
    );
    assert_eq!(
        dao.index_count(None, EMAIL_INDEX, &by_email("same@x"), Target::All)
            .unwrap(),
        12
    );
}

#[test]
fn test_index_writes_invalidate_unpaged_results_only() {
    let tc = test_cluster(Options {
        cache: Some(lru(1000)),
        ..Options::default()
    });
    let dao = tc.cluster.dao(user_entity());
    let values = by_email("s@x");

    let first = add_user(&dao, "s@x", 10);
    assert_eq!(
        dao.index_lookup(None, EMAIL_INDEX, &values, Paging::ALL, Target::All)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        dao.index_lookup(None, EMAIL_INDEX, &values, Paging::first(10), Target::All)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(dao.index_count(None, EMAIL_INDEX, &values, Target::All).unwrap(), 1);

    // repeated reads come from the cache
    let queries = dao.metrics().backend_queries;
    dao.index_lookup(None, EMAIL_INDEX, &values, Paging::ALL, Target::All)
        .unwrap();
    assert_eq!(dao.metrics().backend_queries, queries);

    add_user(&dao, "s@x", 20);
    assert_eq!(
        dao.index_lookup(None, EMAIL_INDEX, &values, Paging::ALL, Target::All)
            .unwrap()
            .len(),
        2
    );
    assert_eq!(dao.index_count(None, EMAIL_INDEX, &values, Target::All).unwrap(), 2);

    // paged results keep their cached value until evicted
    assert_eq!(
        dao.index_lookup(None, EMAIL_INDEX, &values, Paging::first(10), Target::All)
            .unwrap()
            .len(),
        1
    );

    assert_eq!(dao.delete_index_row(None, EMAIL_INDEX, &first.id).unwrap(), 1);
    let rows = dao
        .index_lookup(None, EMAIL_INDEX, &values, Paging::ALL, Target::All)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].created, 20);
}

#[test]
fn test_unknown_index_and_field_are_rejected() {
    let tc = test_cluster(Options::default());
    let dao = tc.cluster.dao(user_entity());
    let record = dao.create(None, user("z")).unwrap();

    assert!(matches!(
        dao.index_lookup(None, "user_phone", &by_email("x"), Paging::ALL, Target::All),
        Err(Error::InvalidField(_))
    ));

    let mut values = BTreeMap::new();
    values.insert("phone".to_string(), FieldValue::from("1"));
    assert!(matches!(
        dao.index_lookup(None, EMAIL_INDEX, &values, Paging::ALL, Target::All),
        Err(Error::InvalidField(_))
    ));

    assert!(matches!(
        dao.create_index_row(None, EMAIL_INDEX, &index_row(&record.id, 1, &[("phone", Value::Null)])),
        Err(Error::InvalidField(_))
    ));
}
