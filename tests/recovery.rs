use trellis::{
    Config, CountsKey, KernelVersion, KeyId, LabelId, Owner, PropertyValue, RelTypeId, Result,
    StorageEngine, TokenKind, TrackingLocks, TransactionState, ANY,
};

fn seed_graph(engine: &StorageEngine) -> Result<(trellis::NodeId, trellis::NodeId, trellis::RelId)>
{
    let ctx = engine.new_command_creation_context();
    let label = ctx.reserve_token()?;
    let key = ctx.reserve_token()?;
    let rel_type = ctx.reserve_token()?;
    let n1 = ctx.reserve_node()?;
    let n2 = ctx.reserve_node()?;
    let rel = ctx.reserve_relationship()?;

    let mut tx = TransactionState::new();
    tx.create_token(TokenKind::Label, label, "Person");
    tx.create_token(TokenKind::PropertyKey, key, "name");
    tx.create_token(TokenKind::RelType, rel_type, "KNOWS");
    tx.create_node(n1);
    tx.create_node(n2);
    tx.add_label(n1, LabelId(label));
    tx.add_property(Owner::Node(n1), KeyId(key), PropertyValue::Str("ada".into()));
    tx.create_relationship(rel, RelTypeId(rel_type), n1, n2);
    engine.commit(&tx, &TrackingLocks::new())?;
    Ok((n1, n2, rel))
}

#[test]
fn crash_before_flush_recovers_from_the_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (n1, n2, rel) = {
        let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
        // No flush, no shutdown: the page cache content dies with the
        // process; only the log survives.
        seed_graph(&engine)?
    };

    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
    let reader = engine.new_reader();
    assert!(reader.node_record(n1)?.is_some());
    assert!(reader.node_record(n2)?.is_some());
    assert!(reader.relationship_record(rel)?.is_some());
    assert_eq!(
        reader.property(Owner::Node(n1), KeyId(1))?,
        Some(PropertyValue::Str("ada".into()))
    );
    assert_eq!(reader.count(CountsKey::node(ANY)), 2);
    assert_eq!(reader.count(CountsKey::relationship(ANY, ANY, ANY)), 1);
    assert_eq!(
        reader.tokens().id(TokenKind::Label, "Person"),
        Some(0),
        "token registry reloaded after replay"
    );
    Ok(())
}

#[test]
fn replaying_the_log_twice_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (n1, ..) = {
        let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
        seed_graph(&engine)?
    };

    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
    let before_nodes = engine.new_reader().count(CountsKey::node(ANY));
    let before_rels = engine
        .new_reader()
        .count(CountsKey::relationship(ANY, ANY, ANY));
    let before_props = engine.new_reader().properties(Owner::Node(n1))?;

    // A second full replay of the same segment must change nothing.
    engine.recover()?;
    let reader = engine.new_reader();
    assert_eq!(reader.count(CountsKey::node(ANY)), before_nodes);
    assert_eq!(
        reader.count(CountsKey::relationship(ANY, ANY, ANY)),
        before_rels
    );
    assert_eq!(reader.properties(Owner::Node(n1))?, before_props);
    Ok(())
}

#[test]
fn log_round_trip_reproduces_the_command_stream() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
    seed_graph(&engine)?;

    let first = engine.transaction_log().transactions()?;
    let second = engine.transaction_log().transactions()?;
    assert!(!first.is_empty());
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn counts_match_a_recount_from_the_record_stores() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
    let (n1, _, rel) = seed_graph(&engine)?;

    // Mutate some more: another node, then drop the relationship.
    let ctx = engine.new_command_creation_context();
    let n3 = ctx.reserve_node()?;
    let mut tx = TransactionState::new();
    tx.create_node(n3);
    tx.add_label(n3, LabelId(0));
    tx.delete_relationship(rel);
    engine.commit(&tx, &TrackingLocks::new())?;
    engine.flush_and_force()?;

    let computed = engine.compute_counts()?;
    let counts = engine.counts_accessor();
    for (key, expected) in &computed {
        assert_eq!(counts.get(*key), *expected, "mismatch for {key:?}");
    }
    // And nothing extra survives in the store.
    let snapshot = counts.snapshot();
    assert_eq!(snapshot.len(), computed.len());

    // n1 keeps its label count.
    let reader = engine.new_reader();
    assert_eq!(reader.count(CountsKey::node(0)), 2);
    assert!(reader.node_record(n1)?.is_some());
    Ok(())
}

#[test]
fn freed_ids_are_reused_only_after_the_checkpoint_barrier() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
    let ctx = engine.new_command_creation_context();
    let node = ctx.reserve_node()?;
    let mut tx = TransactionState::new();
    tx.create_node(node);
    engine.commit(&tx, &TrackingLocks::new())?;

    let mut tx = TransactionState::new();
    tx.delete_node(node);
    engine.commit(&tx, &TrackingLocks::new())?;

    // Behind the barrier: a fresh id, not the freed one.
    let next = ctx.reserve_node()?;
    assert_ne!(next, node);

    // The checkpoint advances the barrier past the freeing transaction.
    engine.flush_and_force()?;
    let reused = ctx.reserve_node()?;
    assert_eq!(reused, node);
    Ok(())
}

#[test]
fn reopen_after_clean_shutdown_preserves_everything() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (n1, n2, rel) = {
        let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
        let ids = seed_graph(&engine)?;
        engine.shutdown()?;
        ids
    };
    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
    let reader = engine.new_reader();
    assert!(reader.node_record(n1)?.is_some());
    assert!(reader.node_record(n2)?.is_some());
    assert!(reader.relationship_record(rel)?.is_some());
    assert_eq!(reader.count(CountsKey::node(ANY)), 2);

    // The engine keeps allocating past everything it has seen.
    let ctx = engine.new_command_creation_context();
    let fresh = ctx.reserve_node()?;
    assert!(fresh.0 >= 2);
    Ok(())
}
