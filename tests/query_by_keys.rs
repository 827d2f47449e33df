use std::sync::Arc;
use trellis::commands::InsertCommand;
use trellis::model::{Field, FieldType};
use trellis::store::memory::MemoryStore;
use trellis::{
    Connection, Entity, FilterNode, Key, KeyId, Model, SelectQuery, TrellisConfig, Value,
};

fn nullable_model() -> Model {
    Model::new("nullable_field_model")
        .field(Field::new("id", FieldType::Integer).primary_key())
        .field(Field::new("nullable", FieldType::Integer))
}

fn connection() -> (Arc<MemoryStore>, Connection) {
    let store = Arc::new(MemoryStore::new());
    let conn = Connection::new(store.clone(), TrellisConfig::default());
    (store, conn)
}

fn create_with_pk(conn: &Connection, model: &Model, id: i64, nullable: Value) {
    let entity = Entity::new(Key::with_id(model.table(), id, &conn.namespace))
        .with("nullable", nullable);
    InsertCommand::new(conn, model, vec![entity])
        .expect("build insert")
        .execute(conn)
        .expect("insert");
}

#[test]
fn missing_keys_are_skipped() {
    let (_, conn) = connection();
    let model = nullable_model();
    create_with_pk(&conn, &model, 1, Value::Null);
    create_with_pk(&conn, &model, 5, Value::Null);

    let values: Vec<Value> = (1..=5).map(Value::Integer).collect();
    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("id", values))
        .order_by(&["nullable"])
        .fetch(&conn)
        .expect("fetch");

    let ids: Vec<i64> = results
        .iter()
        .map(|e| match e.key.id_or_name() {
            Some(KeyId::Id(id)) => *id,
            other => panic!("unexpected id: {other:?}"),
        })
        .collect();
    assert_eq!(ids, vec![1, 5]);
}

#[test]
fn results_sort_in_memory_under_the_requested_ordering() {
    let (_, conn) = connection();
    let model = nullable_model();
    create_with_pk(&conn, &model, 1, Value::Integer(30));
    create_with_pk(&conn, &model, 2, Value::Integer(10));
    create_with_pk(&conn, &model, 3, Value::Integer(20));

    let values: Vec<Value> = (1..=3).map(Value::Integer).collect();
    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("id", values))
        .order_by(&["-nullable"])
        .fetch(&conn)
        .expect("fetch");

    let nullables: Vec<_> = results.iter().map(|e| e.get("nullable").cloned()).collect();
    assert_eq!(
        nullables,
        vec![
            Some(Value::Integer(30)),
            Some(Value::Integer(20)),
            Some(Value::Integer(10)),
        ]
    );
}

#[test]
fn branch_predicates_filter_stale_key_hits() {
    let (_, conn) = connection();
    let model = nullable_model();
    create_with_pk(&conn, &model, 1, Value::Integer(10));
    create_with_pk(&conn, &model, 2, Value::Integer(99));

    // Both branches pin a key; the extra predicate only matches id 1.
    let tree = FilterNode::or(vec![
        FilterNode::and(vec![
            FilterNode::eq("id", 1i64),
            FilterNode::lt("nullable", 50i64),
        ]),
        FilterNode::and(vec![
            FilterNode::eq("id", 2i64),
            FilterNode::lt("nullable", 50i64),
        ]),
    ]);
    let results = SelectQuery::new(&model, "")
        .filter(tree)
        .fetch(&conn)
        .expect("fetch");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key.id_or_name(), Some(&KeyId::Id(1)));
}

#[test]
fn projection_fan_out_stays_under_the_branch_ceiling() {
    let store = Arc::new(MemoryStore::new());
    let config = TrellisConfig::default().with_max_query_branches(10);
    let conn = Connection::new(store.clone(), config);
    let model = nullable_model();
    for id in 1..=3 {
        create_with_pk(&conn, &model, id, Value::Integer(id * 10));
    }

    store.clear_recorded_queries();
    let values: Vec<Value> = (1..=3).map(Value::Integer).collect();
    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("id", values))
        .columns(&["nullable"])
        .order_by(&["nullable"])
        .fetch(&conn)
        .expect("fetch");
    assert_eq!(results.len(), 3);
    // Under the ceiling with a projection: per-key ancestor queries, not
    // one multi-get.
    assert_eq!(store.recorded_queries().len(), 3);
    for entity in &results {
        assert!(entity.get("nullable").is_some());
    }
}

#[test]
fn over_the_ceiling_projection_falls_back_to_multi_get() {
    let store = Arc::new(MemoryStore::new());
    // Three grouped keys is not strictly below the ceiling of three, so
    // the projection fan-out is skipped while normalization still fits.
    let config = TrellisConfig::default().with_max_query_branches(3);
    let conn = Connection::new(store.clone(), config);
    let model = nullable_model();
    for id in 1..=3 {
        create_with_pk(&conn, &model, id, Value::Integer(id * 10));
    }

    store.clear_recorded_queries();
    let values: Vec<Value> = (1..=3).map(Value::Integer).collect();
    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::in_list("id", values))
        .columns(&["nullable"])
        .fetch(&conn)
        .expect("fetch");
    assert_eq!(results.len(), 3);
    assert!(store.recorded_queries().is_empty());
}

#[test]
fn pk_renaming_exposes_identity_as_the_declared_column() {
    let (_, conn) = connection();
    let model = nullable_model();
    create_with_pk(&conn, &model, 7, Value::Null);

    let results = SelectQuery::new(&model, "")
        .filter(FilterNode::eq("id", 7i64))
        .fetch(&conn)
        .expect("fetch");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get("id"), Some(&Value::Integer(7)));
}
