//! The applier chain: per-application-mode pipelines that consume command
//! batches and mutate the record stores, counts, schema cache, and listener
//! sinks. The chain for each mode is built once; the only differences
//! between modes are the documented toggles.

pub mod appliers;

use std::sync::Arc;

use crate::config::Config;
use crate::counts::{CountsStore, GroupDegreesStore};
use crate::error::Result;
use crate::id::IdUpdateListener;
use crate::lock::{LockService, NoOpLockService, RecordLockService};
use crate::schema::{SchemaCache, SchemaState, TokenRegistry};
use crate::store::Stores;
use crate::txn::command::{Command, CommandBatch};
use crate::types::{KeyId, PropertyValue};
use crate::worksync::Work;

use appliers::{
    CacheInvalidationApplier, ConsistencyCheckingApplier, CountsApplier, HighIdApplier,
    IndexApplier, NeoStoreApplier,
};

/// How a batch of commands is being applied.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ApplyMode {
    /// Normal commit on this instance.
    Internal,
    /// Apply of a batch produced elsewhere (replication).
    External,
    /// Replay from the log after a crash.
    Recovery,
    /// Undo pass over a partially applied batch.
    ReverseRecovery,
}

impl ApplyMode {
    pub const ALL: [ApplyMode; 4] = [
        ApplyMode::Internal,
        ApplyMode::External,
        ApplyMode::Recovery,
        ApplyMode::ReverseRecovery,
    ];

    pub fn index(self) -> usize {
        match self {
            ApplyMode::Internal => 0,
            ApplyMode::External => 1,
            ApplyMode::Recovery => 2,
            ApplyMode::ReverseRecovery => 3,
        }
    }

    /// Ids observed in the batch were allocated elsewhere and must be
    /// propagated into the generators.
    pub fn needs_high_id_tracking(self) -> bool {
        !matches!(self, ApplyMode::Internal)
    }

    /// Derived caches must be dropped when schema or tokens change under
    /// this mode.
    pub fn needs_cache_invalidation(self) -> bool {
        matches!(self, ApplyMode::External | ApplyMode::Recovery)
    }

    /// Counts, degrees, and index updates ride along with the store writes.
    pub fn needs_auxiliary_stores(self) -> bool {
        !matches!(self, ApplyMode::ReverseRecovery)
    }

    /// Recovery modes run without locks; the pre-crash transactions held
    /// them.
    pub fn is_recovery(self) -> bool {
        matches!(self, ApplyMode::Recovery | ApplyMode::ReverseRecovery)
    }
}

/// One index entry change derived from a property command.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntryUpdate {
    pub entity: u64,
    pub entity_is_node: bool,
    pub key: KeyId,
    pub before: Option<PropertyValue>,
    pub after: Option<PropertyValue>,
}

/// Label or relationship-type membership change for the token scan stores.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenScanUpdate {
    pub entity: u64,
    pub added: Vec<u32>,
    pub removed: Vec<u32>,
}

pub trait IndexUpdateListener: Send + Sync {
    fn apply_updates(&mut self, updates: Vec<IndexEntryUpdate>) -> Result<()>;
}

pub trait EntityTokenUpdateListener: Send + Sync {
    fn apply_token_updates(&mut self, updates: Vec<TokenScanUpdate>) -> Result<()>;
}

pub struct IndexUpdatesWork(pub Vec<IndexEntryUpdate>);

impl Work<Box<dyn IndexUpdateListener>> for IndexUpdatesWork {
    fn apply(self, sink: &mut Box<dyn IndexUpdateListener>) -> Result<()> {
        sink.apply_updates(self.0)
    }
}

pub struct TokenUpdateWork(pub Vec<TokenScanUpdate>);

impl Work<Box<dyn EntityTokenUpdateListener>> for TokenUpdateWork {
    fn apply(self, sink: &mut Box<dyn EntityTokenUpdateListener>) -> Result<()> {
        sink.apply_token_updates(self.0)
    }
}

/// Shared scratch for one batch apply: the id transition listener plus the
/// listener updates accumulated across the batch's transactions.
pub struct BatchContext<'a> {
    pub id_updates: &'a mut dyn IdUpdateListener,
    pub index_updates: Vec<IndexEntryUpdate>,
    pub label_updates: Vec<TokenScanUpdate>,
    pub rel_type_updates: Vec<TokenScanUpdate>,
}

impl<'a> BatchContext<'a> {
    pub fn new(id_updates: &'a mut dyn IdUpdateListener) -> Self {
        Self {
            id_updates,
            index_updates: Vec::new(),
            label_updates: Vec::new(),
            rel_type_updates: Vec::new(),
        }
    }
}

/// A command consumer in the chain. Appliers run per command in declaration
/// order; `close` runs once per transaction after its last command.
pub trait CommandApplier {
    fn apply(&mut self, command: &Command, ctx: &mut BatchContext<'_>) -> Result<()>;

    fn close(&mut self, _ctx: &mut BatchContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Blueprint for one mode's chain, constructed once at engine init.
pub struct ApplierChain {
    mode: ApplyMode,
    consistency_check: bool,
    stores: Arc<Stores>,
    counts: Arc<CountsStore>,
    degrees: Arc<GroupDegreesStore>,
    schema_cache: Arc<SchemaCache>,
    schema_state: Arc<SchemaState>,
    tokens: Arc<TokenRegistry>,
    generators: Arc<crate::id::IdGenerators>,
    lock_service: Arc<dyn LockService>,
}

impl ApplierChain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: ApplyMode,
        config: &Config,
        stores: Arc<Stores>,
        counts: Arc<CountsStore>,
        degrees: Arc<GroupDegreesStore>,
        schema_cache: Arc<SchemaCache>,
        schema_state: Arc<SchemaState>,
        tokens: Arc<TokenRegistry>,
        generators: Arc<crate::id::IdGenerators>,
        record_locks: Arc<RecordLockService>,
    ) -> Self {
        let lock_service: Arc<dyn LockService> = if mode.is_recovery() {
            Arc::new(NoOpLockService)
        } else {
            record_locks
        };
        Self {
            mode,
            consistency_check: config.consistency_check_on_apply,
            stores,
            counts,
            degrees,
            schema_cache,
            schema_state,
            tokens,
            generators,
            lock_service,
        }
    }

    pub fn mode(&self) -> ApplyMode {
        self.mode
    }

    /// Instantiates the appliers for one transaction of a batch, in the
    /// fixed declaration order.
    pub fn start_tx(&self, tx: &CommandBatch) -> Vec<Box<dyn CommandApplier + '_>> {
        let mut appliers: Vec<Box<dyn CommandApplier + '_>> = Vec::with_capacity(6);
        if self.consistency_check && self.mode.needs_auxiliary_stores() {
            appliers.push(Box::new(ConsistencyCheckingApplier::new(&self.stores)));
        }
        appliers.push(Box::new(NeoStoreApplier::new(
            &self.stores,
            &self.schema_cache,
            &self.tokens,
            self.lock_service.as_ref(),
        )));
        if self.mode.needs_high_id_tracking() {
            appliers.push(Box::new(HighIdApplier::new(&self.stores, &self.generators)));
        }
        if self.mode.needs_cache_invalidation() {
            appliers.push(Box::new(CacheInvalidationApplier::new(&self.schema_state)));
        }
        if self.mode.needs_auxiliary_stores() {
            appliers.push(Box::new(CountsApplier::new(
                &self.counts,
                &self.degrees,
                tx.tx_id,
            )));
            appliers.push(Box::new(IndexApplier::new()));
        }
        appliers
    }
}
