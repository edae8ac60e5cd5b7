//! Kernel-version upgrade protocol. The store version may only trail the
//! runtime version; the first write after a runtime bump injects a synthetic
//! meta-data transaction that promotes the on-disk format, serialized against
//! every other writer by the upgrade lock pair.

use std::time::Duration;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::lock::UpgradeLock;
use crate::store::{MetaDataStore, MetaPosition};
use crate::txn::command::Command;
use crate::types::KernelVersion;
use crate::validate::validate_upgrade;

/// Outcome of comparing the durable store version against the runtime.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VersionCheck {
    UpToDate,
    UpgradeNeeded {
        from: KernelVersion,
        to: KernelVersion,
    },
}

/// `kv > rv` is unwritable: a newer format cannot be mutated by an older
/// runtime.
pub fn check_runtime_version(
    store_version: KernelVersion,
    runtime_version: KernelVersion,
) -> Result<VersionCheck> {
    if store_version == runtime_version {
        return Ok(VersionCheck::UpToDate);
    }
    if store_version > runtime_version {
        return Err(StoreError::FormatMismatch(format!(
            "store version {store_version} is newer than runtime version {runtime_version}, refusing to write"
        )));
    }
    Ok(VersionCheck::UpgradeNeeded {
        from: store_version,
        to: runtime_version,
    })
}

/// The single-command prefix of an upgrade transaction: the kernel-version
/// slot of the meta-data record moving from the current to the target
/// version.
pub fn create_upgrade_commands(
    meta: &MetaDataStore,
    target: KernelVersion,
) -> Result<Vec<Command>> {
    let current = meta.kernel_version()?;
    validate_upgrade(current, target)?;
    Ok(vec![Command::MetaData {
        position: MetaPosition::KernelVersion,
        before: current.as_byte() as u64,
        after: target.as_byte() as u64,
    }])
}

/// Serializes upgrade injection against concurrent commits. Every write
/// commit holds the shared side for its duration; the injector takes the
/// exclusive side within a bounded wait or defers to the next write.
pub struct UpgradeCoordinator {
    lock: UpgradeLock,
    allow_automatic: bool,
    exclusive_wait: Duration,
}

impl UpgradeCoordinator {
    pub fn new(config: &Config) -> Self {
        Self {
            lock: UpgradeLock::new(),
            allow_automatic: config.allow_single_automatic_upgrade,
            exclusive_wait: Duration::from_millis(config.upgrade_lock_timeout_ms),
        }
    }

    pub fn automatic_upgrade_allowed(&self) -> bool {
        self.allow_automatic
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.shared()
    }

    pub fn try_exclusive(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        let guard = self.lock.try_exclusive(self.exclusive_wait);
        if guard.is_none() {
            debug!(
                wait_ms = self.exclusive_wait.as_millis() as u64,
                "exclusive upgrade lock not acquired within the wait window"
            );
        }
        guard
    }
}
