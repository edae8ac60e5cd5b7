use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use trellis::txn::Command;
use trellis::{
    Config, KernelVersion, Resource, ResourceLocker, Result, StorageEngine, TrackingLocks,
    TransactionState,
};

fn commit_new_node(engine: &StorageEngine) -> Result<u64> {
    let ctx = engine.new_command_creation_context();
    let node = ctx.reserve_node()?;
    let mut tx = TransactionState::new();
    tx.create_node(node);
    engine.commit(&tx, &TrackingLocks::new())
}

#[test]
fn first_write_after_runtime_bump_commits_the_upgrade_first() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::V1)?;
    commit_new_node(&engine)?;
    let frames_before = engine.transaction_log().transactions()?.len();

    engine.set_runtime_version(KernelVersion::V2);

    // Reads do not move the store version.
    let _ = engine.new_reader().node_record(trellis::NodeId(0))?;
    assert_eq!(engine.kernel_version()?, KernelVersion::V1);
    // Neither does an empty commit.
    engine.commit(&TransactionState::new(), &TrackingLocks::new())?;
    assert_eq!(engine.kernel_version()?, KernelVersion::V1);

    commit_new_node(&engine)?;
    assert_eq!(engine.kernel_version()?, KernelVersion::V2);

    let frames = engine.transaction_log().transactions()?;
    assert_eq!(frames.len(), frames_before + 2);

    // Everything before the bump is tagged with the old version.
    for (_, version, _) in &frames[..frames_before] {
        assert_eq!(*version, KernelVersion::V1);
    }

    let (upgrade_tx, upgrade_version, upgrade_commands) = &frames[frames_before];
    assert_eq!(*upgrade_version, KernelVersion::V2);
    assert_eq!(upgrade_commands.len(), 1, "upgrade transaction holds one command");
    match &upgrade_commands[0] {
        Command::MetaData { before, after, .. } => {
            assert_eq!(*before, KernelVersion::V1.as_byte() as u64);
            assert_eq!(*after, KernelVersion::V2.as_byte() as u64);
        }
        other => panic!("expected the meta-data upgrade command, got {other:?}"),
    }
    let (user_tx, user_version, user_commands) = &frames[frames_before + 1];
    assert_eq!(*user_version, KernelVersion::V2);
    assert!(user_tx > upgrade_tx, "user write follows the upgrade");
    assert!(user_commands
        .iter()
        .all(|command| !matches!(command, Command::MetaData { .. })));
    Ok(())
}

#[test]
fn automatic_upgrade_can_be_disabled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        allow_single_automatic_upgrade: false,
        ..Config::default()
    };
    let engine = StorageEngine::open(dir.path(), config, KernelVersion::V1)?;
    commit_new_node(&engine)?;
    engine.set_runtime_version(KernelVersion::V2);
    commit_new_node(&engine)?;
    assert_eq!(engine.kernel_version()?, KernelVersion::V1);
    Ok(())
}

#[test]
fn downgraded_runtime_refuses_to_write() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::V2)?;
        commit_new_node(&engine)?;
        engine.shutdown()?;
    }
    let engine = StorageEngine::open(dir.path(), Config::default(), KernelVersion::V1)?;
    let err = commit_new_node(&engine).expect_err("older runtime must refuse to write");
    assert!(matches!(err, trellis::StoreError::FormatMismatch(_)));
    Ok(())
}

/// Resource locker that parks every acquisition until the gate opens.
struct GatedLocks {
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl ResourceLocker for GatedLocks {
    fn acquire_exclusive(&self, _resource: Resource) -> Result<()> {
        let (lock, cvar) = &*self.gate;
        let mut open = lock.lock().expect("gate lock");
        while !*open {
            open = cvar.wait(open).expect("gate wait");
        }
        Ok(())
    }

    fn holds_exclusive(&self, _resource: Resource) -> bool {
        true
    }
}

#[derive(Clone)]
struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("capture lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CaptureWriter {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn conflicting_commit_defers_the_upgrade_to_the_next_write() -> Result<()> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(CaptureWriter(Arc::clone(&captured)))
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempfile::tempdir()?;
    let engine = Arc::new(StorageEngine::open(
        dir.path(),
        Config::default(),
        KernelVersion::V1,
    )?);
    commit_new_node(&engine)?;

    // T1 commits while holding the shared upgrade lock, parked on a user
    // lock until the gate opens.
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let t1_engine = Arc::clone(&engine);
    let t1_gate = Arc::clone(&gate);
    let t1 = std::thread::spawn(move || {
        let ctx = t1_engine.new_command_creation_context();
        let node = ctx.reserve_node().expect("reserve node");
        let mut tx = TransactionState::new();
        tx.create_node(node);
        t1_engine
            .commit(&tx, &GatedLocks { gate: t1_gate })
            .expect("t1 commits")
    });
    std::thread::sleep(Duration::from_millis(100));

    // The runtime bumps while T1 is mid-commit; T2 triggers the upgrade but
    // cannot take the exclusive lock and must defer.
    engine.set_runtime_version(KernelVersion::V2);
    commit_new_node(&engine)?;
    assert_eq!(engine.kernel_version()?, KernelVersion::V1);

    {
        let (lock, cvar) = &*gate;
        *lock.lock().expect("gate lock") = true;
        cvar.notify_all();
    }
    t1.join().expect("t1 thread");
    assert_eq!(engine.kernel_version()?, KernelVersion::V1);

    let logged = String::from_utf8(captured.lock().expect("capture lock").clone())
        .expect("captured logs are UTF-8");
    assert!(
        logged.contains("will retry on next write"),
        "expected the deferral message, got: {logged}"
    );

    // No transaction is tagged with the new version yet.
    for (_, version, _) in engine.transaction_log().transactions()? {
        assert_eq!(version, KernelVersion::V1);
    }

    // The next write retries and succeeds.
    commit_new_node(&engine)?;
    assert_eq!(engine.kernel_version()?, KernelVersion::V2);
    let frames = engine.transaction_log().transactions()?;
    let upgrade_index = frames
        .iter()
        .position(|(_, version, _)| *version == KernelVersion::V2)
        .expect("upgrade frame present");
    assert_eq!(frames[upgrade_index].2.len(), 1);
    assert!(matches!(
        frames[upgrade_index].2[0],
        Command::MetaData { .. }
    ));
    Ok(())
}
