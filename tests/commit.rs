use trellis::{
    Config, CountsKey, KernelVersion, KeyId, LabelId, NodeId, Owner, PropertyValue, RelTypeId,
    Result, StorageEngine, StoreError, TokenKind, TrackingLocks, TransactionState, ANY,
};

fn open_default(dir: &std::path::Path) -> Result<StorageEngine> {
    StorageEngine::open(dir, Config::default(), KernelVersion::LATEST)
}

#[test]
fn commit_node_with_label_and_property() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open_default(dir.path())?;
    let ctx = engine.new_command_creation_context();
    let node = ctx.reserve_node()?;
    let label = ctx.reserve_token()?;
    let key = ctx.reserve_token()?;

    let mut tx = TransactionState::new();
    tx.create_token(TokenKind::Label, label, "A");
    tx.create_token(TokenKind::PropertyKey, key, "name");
    tx.create_node(node);
    tx.add_label(node, LabelId(label));
    tx.add_property(Owner::Node(node), KeyId(key), PropertyValue::Str("x".into()));
    engine.commit(&tx, &TrackingLocks::new())?;

    let reader = engine.new_reader();
    let record = reader.node_record(node)?.expect("node is in use");
    assert!(record.in_use);
    assert_eq!(record.labels.as_slice(), &[LabelId(label)]);

    let props = reader.properties(Owner::Node(node))?;
    assert_eq!(props, vec![(KeyId(key), PropertyValue::Str("x".into()))]);

    assert_eq!(reader.count(CountsKey::node(label as i64)), 1);
    assert_eq!(reader.count(CountsKey::node(ANY)), 1);
    assert_eq!(
        reader.tokens().id(TokenKind::Label, "A"),
        Some(label),
        "token registered during apply"
    );
    Ok(())
}

#[test]
fn deleting_a_node_that_still_has_relationships_is_denied() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open_default(dir.path())?;
    let ctx = engine.new_command_creation_context();
    let n1 = ctx.reserve_node()?;
    let n2 = ctx.reserve_node()?;
    let rel = ctx.reserve_relationship()?;
    let rel_type = ctx.reserve_token()?;

    let mut tx = TransactionState::new();
    tx.create_token(TokenKind::RelType, rel_type, "R");
    tx.create_node(n1);
    tx.create_node(n2);
    tx.create_relationship(rel, RelTypeId(rel_type), n1, n2);
    engine.commit(&tx, &TrackingLocks::new())?;

    let mut tx = TransactionState::new();
    tx.delete_node(n1);
    let err = engine
        .commit(&tx, &TrackingLocks::new())
        .expect_err("deletion must be denied");
    match &err {
        StoreError::Validation(message) => {
            assert!(
                message.contains("Cannot delete")
                    && message.contains("because it still has relationships"),
                "unexpected message: {message}"
            );
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert!(err.is_recoverable());

    // The denied transaction left no trace.
    let reader = engine.new_reader();
    assert!(reader.node_record(n1)?.is_some());
    assert_eq!(reader.count(CountsKey::node(ANY)), 2);

    // Deleting the relationship first makes the node deletable.
    let mut tx = TransactionState::new();
    tx.delete_relationship(rel);
    tx.delete_node(n1);
    engine.commit(&tx, &TrackingLocks::new())?;
    let reader = engine.new_reader();
    assert!(reader.node_record(n1)?.is_none());
    assert!(reader.relationship_record(rel)?.is_none());
    assert_eq!(reader.count(CountsKey::node(ANY)), 1);
    assert_eq!(reader.count(CountsKey::relationship(ANY, ANY, ANY)), 0);
    Ok(())
}

#[test]
fn dense_transition_moves_relationships_into_groups() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        dense_node_threshold: 10,
        ..Config::default()
    };
    let engine = StorageEngine::open(dir.path(), config, KernelVersion::LATEST)?;
    let ctx = engine.new_command_creation_context();
    let hub = ctx.reserve_node()?;
    let rel_type = ctx.reserve_token()?;

    let mut tx = TransactionState::new();
    tx.create_token(TokenKind::RelType, rel_type, "FOLLOWS");
    tx.create_node(hub);
    for _ in 0..10 {
        let other = ctx.reserve_node()?;
        tx.create_node(other);
        let rel = ctx.reserve_relationship()?;
        tx.create_relationship(rel, RelTypeId(rel_type), hub, other);
    }
    engine.commit(&tx, &TrackingLocks::new())?;

    let reader = engine.new_reader();
    let record = reader.node_record(hub)?.expect("hub is in use");
    assert!(record.dense, "hub crossed the dense threshold");

    // All ten relationships reachable through the per-type group chain.
    let degrees = reader.node_degrees(hub)?;
    assert_eq!(degrees.get(&rel_type), Some(&(10, 0)));
    assert_eq!(reader.total_degree(hub)?, 10);
    assert_eq!(
        reader.count(CountsKey::relationship(ANY, rel_type as i64, ANY)),
        10
    );
    Ok(())
}

#[test]
fn property_change_and_removal_maintain_the_chain() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open_default(dir.path())?;
    let ctx = engine.new_command_creation_context();
    let node = ctx.reserve_node()?;
    let name = ctx.reserve_token()?;
    let age = ctx.reserve_token()?;

    let mut tx = TransactionState::new();
    tx.create_token(TokenKind::PropertyKey, name, "name");
    tx.create_token(TokenKind::PropertyKey, age, "age");
    tx.create_node(node);
    tx.add_property(Owner::Node(node), KeyId(name), PropertyValue::Str("a".into()));
    tx.add_property(Owner::Node(node), KeyId(age), PropertyValue::Int(7));
    engine.commit(&tx, &TrackingLocks::new())?;

    let mut tx = TransactionState::new();
    tx.change_property(Owner::Node(node), KeyId(name), PropertyValue::Str("b".into()));
    tx.remove_property(Owner::Node(node), KeyId(age));
    engine.commit(&tx, &TrackingLocks::new())?;

    let reader = engine.new_reader();
    assert_eq!(
        reader.property(Owner::Node(node), KeyId(name))?,
        Some(PropertyValue::Str("b".into()))
    );
    assert_eq!(reader.property(Owner::Node(node), KeyId(age))?, None);
    Ok(())
}

#[test]
fn long_string_values_spill_and_read_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open_default(dir.path())?;
    let ctx = engine.new_command_creation_context();
    let node = ctx.reserve_node()?;
    let key = ctx.reserve_token()?;
    let long = "long-value-".repeat(60);

    let mut tx = TransactionState::new();
    tx.create_token(TokenKind::PropertyKey, key, "bio");
    tx.create_node(node);
    tx.add_property(Owner::Node(node), KeyId(key), PropertyValue::Str(long.clone()));
    engine.commit(&tx, &TrackingLocks::new())?;

    let reader = engine.new_reader();
    assert_eq!(
        reader.property(Owner::Node(node), KeyId(key))?,
        Some(PropertyValue::Str(long))
    );
    Ok(())
}

#[test]
fn loops_connect_once_and_count_on_both_sides() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = open_default(dir.path())?;
    let ctx = engine.new_command_creation_context();
    let node = ctx.reserve_node()?;
    let rel = ctx.reserve_relationship()?;
    let rel_type = ctx.reserve_token()?;

    let mut tx = TransactionState::new();
    tx.create_token(TokenKind::RelType, rel_type, "SELF");
    tx.create_node(node);
    tx.create_relationship(rel, RelTypeId(rel_type), node, node);
    engine.commit(&tx, &TrackingLocks::new())?;

    let reader = engine.new_reader();
    let degrees = reader.node_degrees(node)?;
    assert_eq!(degrees.get(&rel_type), Some(&(1, 1)));

    let mut tx = TransactionState::new();
    tx.delete_relationship(rel);
    tx.delete_node(node);
    engine.commit(&tx, &TrackingLocks::new())?;
    assert!(engine.new_reader().node_record(node)?.is_none());
    Ok(())
}

#[test]
fn read_only_engine_rejects_writes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let engine = open_default(dir.path())?;
        engine.shutdown()?;
    }
    let engine = StorageEngine::open(dir.path(), Config::read_only(), KernelVersion::LATEST)?;
    let mut tx = TransactionState::new();
    tx.create_node(NodeId(0));
    assert!(matches!(
        engine.commit(&tx, &TrackingLocks::new()),
        Err(StoreError::ReadOnly)
    ));
    Ok(())
}
