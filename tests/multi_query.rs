use std::sync::Arc;
use trellis::commands::InsertCommand;
use trellis::store::memory::MemoryStore;
use trellis::{
    Connection, Entity, FilterNode, Key, Model, SelectQuery, TrellisConfig, TrellisError, Value,
};
use trellis::model::{Field, FieldType};

fn multi_query_model() -> Model {
    Model::new("multi_query_model")
        .field(Field::new("id", FieldType::Integer).primary_key())
        .field(Field::new("field1", FieldType::Integer))
        .field(Field::new("field2", FieldType::Char))
}

fn connection() -> (Arc<MemoryStore>, Connection) {
    let store = Arc::new(MemoryStore::new());
    let conn = Connection::new(store.clone(), TrellisConfig::default());
    (store, conn)
}

fn create(conn: &Connection, model: &Model, field1: i64, field2: &str) -> Key {
    let entity = Entity::new(Key::partial(model.table(), &conn.namespace))
        .with("field1", field1)
        .with("field2", field2);
    let keys = InsertCommand::new(conn, model, vec![entity])
        .expect("build insert")
        .execute(conn)
        .expect("insert");
    keys.into_iter().next().expect("one key")
}

fn field1_values(results: &[Entity]) -> Vec<i64> {
    results
        .iter()
        .map(|e| match e.get("field1") {
            Some(Value::Integer(v)) => *v,
            other => panic!("unexpected field1 value: {other:?}"),
        })
        .collect()
}

#[test]
fn hundred_branch_in_returns_every_distinct_result() {
    let (_, conn) = connection();
    let model = multi_query_model();
    for i in 0..100 {
        create(&conn, &model, i, "x");
    }

    let values: Vec<Value> = (0..100).map(Value::Integer).collect();
    let query =
        SelectQuery::new(&model, "").filter(FilterNode::in_list("field1", values.clone()));
    let results = query.fetch(&conn).expect("fetch");
    assert_eq!(results.len(), 100);

    let count = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("field1", values))
        .count(&conn)
        .expect("count");
    assert_eq!(count, 100);
}

#[test]
fn hundred_branch_in_is_ordered_in_both_directions() {
    let (_, conn) = connection();
    let model = multi_query_model();
    for i in 0..100 {
        create(&conn, &model, i, "x");
    }
    let values: Vec<Value> = (0..100).map(Value::Integer).collect();

    let ascending = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("field1", values.clone()))
        .order_by(&["field1"])
        .fetch(&conn)
        .expect("fetch asc");
    assert_eq!(field1_values(&ascending), (0..100).collect::<Vec<_>>());

    let descending = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("field1", values))
        .order_by(&["-field1"])
        .fetch(&conn)
        .expect("fetch desc");
    assert_eq!(
        field1_values(&descending),
        (0..100).rev().collect::<Vec<_>>()
    );
}

#[test]
fn branch_ceiling_is_enforced() {
    let (_, conn) = {
        let store = Arc::new(MemoryStore::new());
        let config = TrellisConfig::default().with_max_query_branches(10);
        (store.clone(), Connection::new(store, config))
    };
    let model = multi_query_model();
    for i in 0..11 {
        create(&conn, &model, i, "x");
    }

    let values: Vec<Value> = (0..11).map(Value::Integer).collect();
    let err = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("field1", values))
        .fetch(&conn)
        .expect_err("over the ceiling");
    assert!(matches!(err, TrellisError::NotSupported(_)));
}

#[test]
fn overlapping_branches_deduplicate_by_key() {
    let (_, conn) = connection();
    let model = multi_query_model();
    for i in 0..10 {
        create(&conn, &model, i, "shared");
    }

    // Both branches match every entity with field2 == "shared".
    let tree = FilterNode::or(vec![
        FilterNode::eq("field2", "shared"),
        FilterNode::gte("field1", 0i64),
    ]);
    let results = SelectQuery::new(&model, "")
        .filter(tree)
        .order_by(&["field1"])
        .fetch(&conn)
        .expect("fetch");
    assert_eq!(results.len(), 10);
    assert_eq!(field1_values(&results), (0..10).collect::<Vec<_>>());
}

#[test]
fn offset_and_limit_count_distinct_results_only() {
    let (_, conn) = connection();
    let model = multi_query_model();
    for i in 0..10 {
        create(&conn, &model, i, "shared");
    }

    let tree = FilterNode::or(vec![
        FilterNode::eq("field2", "shared"),
        FilterNode::gte("field1", 5i64),
    ]);
    let results = SelectQuery::new(&model, "")
        .filter(tree)
        .order_by(&["field1"])
        .offset(3)
        .limit(4)
        .fetch(&conn)
        .expect("fetch");
    assert_eq!(field1_values(&results), vec![3, 4, 5, 6]);
}

#[test]
fn per_branch_fetch_limit_covers_the_full_window() {
    let (store, conn) = connection();
    let model = multi_query_model();
    create(&conn, &model, 1, "test");
    create(&conn, &model, 2, "test2");

    store.clear_recorded_queries();
    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list(
            "field2",
            vec![Value::Text("test".into()), Value::Text("test2".into())],
        ))
        .limit(1)
        .fetch(&conn)
        .expect("fetch");
    assert_eq!(results.len(), 1);
    let limits: Vec<_> = store
        .recorded_queries()
        .iter()
        .map(|q| q.limit)
        .collect();
    assert_eq!(limits, vec![Some(1), Some(1)]);

    // With an offset the window widens: every branch could hold the
    // entire result set, so each is fetched with offset + limit.
    store.clear_recorded_queries();
    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list(
            "field2",
            vec![Value::Text("test".into()), Value::Text("test2".into())],
        ))
        .offset(1)
        .limit(1)
        .fetch(&conn)
        .expect("fetch");
    assert_eq!(results.len(), 1);
    let limits: Vec<_> = store
        .recorded_queries()
        .iter()
        .map(|q| q.limit)
        .collect();
    assert_eq!(limits, vec![Some(2), Some(2)]);
}

#[test]
fn slicing_past_the_result_set_is_empty() {
    let (_, conn) = connection();
    let model = multi_query_model();
    let key = create(&conn, &model, 1, "only");

    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("id", vec![Value::Key(key.clone())]))
        .offset(9999)
        .fetch(&conn)
        .expect("fetch");
    assert!(results.is_empty());

    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("id", vec![Value::Key(key)]))
        .offset(9999)
        .limit(1)
        .fetch(&conn)
        .expect("fetch");
    assert!(results.is_empty());
}

#[test]
fn average_is_rejected() {
    let (_, conn) = connection();
    let model = multi_query_model();
    let err = SelectQuery::new(&model, "")
        .average(&conn)
        .expect_err("average unsupported");
    assert!(matches!(err, TrellisError::NotSupported(_)));
}

#[test]
fn count_subtracts_excluded_keys() {
    let (_, conn) = connection();
    let model = multi_query_model();
    let mut keys = Vec::new();
    for i in 0..5 {
        keys.push(create(&conn, &model, i, "x"));
    }

    let count = SelectQuery::new(&model, "")
        .exclude_keys(vec![keys[0].clone(), keys[1].clone()])
        .count(&conn)
        .expect("count");
    assert_eq!(count, 3);
}
