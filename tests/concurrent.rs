use std::sync::{Arc, Mutex};

use trellis::{
    Config, CountsKey, IndexEntryUpdate, IndexUpdateListener, KernelVersion, KeyId, LabelId,
    Owner, PropertyValue, Result, StorageEngine, StoreError, TokenKind, TokenScanUpdate,
    TrackingLocks, TransactionState, ANY,
};

#[test]
fn concurrent_commits_serialize_into_the_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Arc::new(StorageEngine::open(
        dir.path(),
        Config::default(),
        KernelVersion::LATEST,
    )?);

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for _ in 0..10 {
                    let ctx = engine.new_command_creation_context();
                    let node = ctx.reserve_node().expect("reserve node");
                    let mut tx = TransactionState::new();
                    tx.create_node(node);
                    engine.commit(&tx, &TrackingLocks::new()).expect("commit");
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("committer panicked");
    }

    let reader = engine.new_reader();
    assert_eq!(reader.count(CountsKey::node(ANY)), 40);

    // Log append order is transaction id order; ids are unique.
    let frames = engine.transaction_log().transactions()?;
    assert_eq!(frames.len(), 40);
    let tx_ids: Vec<u64> = frames.iter().map(|(tx_id, ..)| *tx_id).collect();
    let mut sorted = tx_ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(tx_ids, sorted, "log order is ascending committed order");
    Ok(())
}

struct CapturingIndexListener {
    updates: Arc<Mutex<Vec<IndexEntryUpdate>>>,
}

impl IndexUpdateListener for CapturingIndexListener {
    fn apply_updates(&mut self, updates: Vec<IndexEntryUpdate>) -> Result<()> {
        self.updates.lock().expect("listener lock").extend(updates);
        Ok(())
    }
}

struct CapturingTokenListener {
    updates: Arc<Mutex<Vec<TokenScanUpdate>>>,
}

impl trellis::EntityTokenUpdateListener for CapturingTokenListener {
    fn apply_token_updates(&mut self, updates: Vec<TokenScanUpdate>) -> Result<()> {
        self.updates.lock().expect("listener lock").extend(updates);
        Ok(())
    }
}

#[test]
fn listeners_receive_updates_and_register_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;

    let index_updates = Arc::new(Mutex::new(Vec::new()));
    let label_updates = Arc::new(Mutex::new(Vec::new()));
    engine.add_index_update_listener(Box::new(CapturingIndexListener {
        updates: Arc::clone(&index_updates),
    }))?;
    engine.add_node_label_update_listener(Box::new(CapturingTokenListener {
        updates: Arc::clone(&label_updates),
    }))?;

    // A second registration of either kind is a configuration error.
    assert!(matches!(
        engine.add_index_update_listener(Box::new(CapturingIndexListener {
            updates: Arc::new(Mutex::new(Vec::new())),
        })),
        Err(StoreError::Configuration(_))
    ));
    assert!(matches!(
        engine.add_node_label_update_listener(Box::new(CapturingTokenListener {
            updates: Arc::new(Mutex::new(Vec::new())),
        })),
        Err(StoreError::Configuration(_))
    ));

    let ctx = engine.new_command_creation_context();
    let node = ctx.reserve_node()?;
    let label = ctx.reserve_token()?;
    let key = ctx.reserve_token()?;
    let mut tx = TransactionState::new();
    tx.create_token(TokenKind::Label, label, "City");
    tx.create_token(TokenKind::PropertyKey, key, "pop");
    tx.create_node(node);
    tx.add_label(node, LabelId(label));
    tx.add_property(Owner::Node(node), KeyId(key), PropertyValue::Int(81));
    engine.commit(&tx, &TrackingLocks::new())?;

    let captured_labels = label_updates.lock().expect("listener lock").clone();
    assert_eq!(
        captured_labels,
        vec![TokenScanUpdate {
            entity: node.0,
            added: vec![label],
            removed: vec![],
        }]
    );

    let captured_index = index_updates.lock().expect("listener lock").clone();
    assert_eq!(
        captured_index,
        vec![IndexEntryUpdate {
            entity: node.0,
            entity_is_node: true,
            key: KeyId(key),
            before: None,
            after: Some(PropertyValue::Int(81)),
        }]
    );

    // Removal flows through as the inverse update.
    let mut tx = TransactionState::new();
    tx.remove_property(Owner::Node(node), KeyId(key));
    engine.commit(&tx, &TrackingLocks::new())?;
    let captured_index = index_updates.lock().expect("listener lock").clone();
    assert_eq!(captured_index.len(), 2);
    assert_eq!(captured_index[1].before, Some(PropertyValue::Int(81)));
    assert_eq!(captured_index[1].after, None);
    Ok(())
}

#[test]
fn commits_fail_fast_once_the_health_monitor_panicked() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::LATEST)?;
    let health = engine.health();
    health.panic(&StoreError::ApplyFailure("induced failure".into()));

    let ctx = engine.new_command_creation_context();
    let node = ctx.reserve_node()?;
    let mut tx = TransactionState::new();
    tx.create_node(node);
    assert!(matches!(
        engine.commit(&tx, &TrackingLocks::new()),
        Err(StoreError::Unhealthy(_))
    ));
    Ok(())
}
