//! Locking seams. The real lock manager lives above the engine; this module
//! states what must be locked and provides an in-process implementation for
//! apply-time record locks plus the shared/exclusive upgrade lock pair.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StoreError};

/// A lockable record-level resource.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Resource {
    Node(u64),
    Relationship(u64),
    Schema,
}

/// Transaction-held locks, acquired during command creation. The engine
/// states what to lock; acquisition order and deadlock detection belong to
/// the caller's lock manager.
pub trait ResourceLocker: Send + Sync {
    fn acquire_exclusive(&self, resource: Resource) -> Result<()>;
    fn holds_exclusive(&self, resource: Resource) -> bool;
}

/// Tracking locker that grants everything; tests and single-writer embedders
/// use this, and lock verification reads back what was acquired.
#[derive(Default, Debug)]
pub struct TrackingLocks {
    held: Mutex<HashSet<Resource>>,
}

impl TrackingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> Vec<Resource> {
        self.held.lock().iter().copied().collect()
    }
}

impl ResourceLocker for TrackingLocks {
    fn acquire_exclusive(&self, resource: Resource) -> Result<()> {
        self.held.lock().insert(resource);
        Ok(())
    }

    fn holds_exclusive(&self, resource: Resource) -> bool {
        self.held.lock().contains(&resource)
    }
}

const APPLY_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct LockTableState {
    held: HashSet<Resource>,
}

/// Apply-time record locks. Normal commit modes lock each mutated node and
/// relationship for the duration of its store write; recovery modes use
/// [`NoOpLockService`] because the pre-crash transactions held the locks.
pub trait LockService: Send + Sync {
    fn lock(&self, resource: Resource) -> Result<LockGuard>;
}

#[derive(Default)]
pub struct RecordLockService {
    state: Arc<(Mutex<LockTableState>, Condvar)>,
}

impl RecordLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockService for RecordLockService {
    fn lock(&self, resource: Resource) -> Result<LockGuard> {
        let (table, cond) = &*self.state;
        let deadline = Instant::now() + APPLY_LOCK_TIMEOUT;
        let mut guard = table.lock();
        while guard.held.contains(&resource) {
            if cond.wait_until(&mut guard, deadline).timed_out() {
                return Err(StoreError::LockTimeout(format!(
                    "record lock on {resource:?}"
                )));
            }
        }
        guard.held.insert(resource);
        Ok(LockGuard {
            state: Some((Arc::clone(&self.state), resource)),
        })
    }
}

/// Lock service that grants everything without tracking.
pub struct NoOpLockService;

impl LockService for NoOpLockService {
    fn lock(&self, _resource: Resource) -> Result<LockGuard> {
        Ok(LockGuard { state: None })
    }
}

pub struct LockGuard {
    state: Option<(Arc<(Mutex<LockTableState>, Condvar)>, Resource)>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some((state, resource)) = self.state.take() {
            let (table, cond) = &*state;
            table.lock().held.remove(&resource);
            cond.notify_all();
        }
    }
}

/// The upgrade lock pair. Every write commit holds the shared side for its
/// duration; only the upgrade injector takes the exclusive side, with a
/// bounded wait so a conflicting commit defers the upgrade instead of
/// deadlocking it.
#[derive(Default, Debug)]
pub struct UpgradeLock {
    inner: RwLock<()>,
}

impl UpgradeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read()
    }

    pub fn try_exclusive(&self, wait: Duration) -> Option<RwLockWriteGuard<'_, ()>> {
        self.inner.try_write_for(wait)
    }
}
