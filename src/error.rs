use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Integrity check failed; the transaction aborts cleanly.
    #[error("{0}")]
    Validation(String),
    /// Schema constraint violated; the transaction aborts cleanly.
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("lock acquisition timed out: {0}")]
    LockTimeout(String),
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    /// Upgrade lost the race for the exclusive upgrade lock; retried on the
    /// next write.
    #[error("upgrade from {from} to {to} deferred due to conflicting transaction")]
    UpgradeConflict {
        from: crate::types::KernelVersion,
        to: crate::types::KernelVersion,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("format mismatch: {0}")]
    FormatMismatch(String),
    #[error("transaction apply failed: {0}")]
    ApplyFailure(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{store} record {id} not in use")]
    NotInUse { store: &'static str, id: u64 },
    #[error("id space exhausted for {}", .0.name())]
    OutOfIds(crate::id::IdType),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("database is read-only")]
    ReadOnly,
    #[error("database is unhealthy: {0}")]
    Unhealthy(String),
}

impl StoreError {
    /// Whether the failure is scoped to one transaction. Everything else
    /// panics the health monitor and poisons subsequent operations.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Validation(_)
                | StoreError::Constraint(_)
                | StoreError::LockTimeout(_)
                | StoreError::Deadlock(_)
                | StoreError::UpgradeConflict { .. }
                | StoreError::NotInUse { .. }
                | StoreError::ReadOnly
        )
    }
}

/// Shared health monitor. Once panicked, every subsequent write is rejected
/// until the database is restarted.
#[derive(Debug, Default)]
pub struct DatabaseHealth {
    panicked: AtomicBool,
    cause: Mutex<Option<String>>,
}

impl DatabaseHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        !self.panicked.load(Ordering::Acquire)
    }

    pub fn panic(&self, cause: &StoreError) {
        error!(%cause, "database panicked, rejecting further writes");
        let mut guard = self.cause.lock();
        if guard.is_none() {
            *guard = Some(cause.to_string());
        }
        self.panicked.store(true, Ordering::Release);
    }

    pub fn assert_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let cause = self
            .cause
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown panic cause".to_owned());
        Err(StoreError::Unhealthy(cause))
    }
}
