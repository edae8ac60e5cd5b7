//! The storage engine facade: wires the stores, id generators, counts,
//! schema cache, applier chains, work-sync coordinators, and the upgrade
//! protocol behind the engine API.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::apply::{
    ApplierChain, ApplyMode, BatchContext, EntityTokenUpdateListener, IndexUpdateListener,
    IndexUpdatesWork, TokenUpdateWork,
};
use crate::config::Config;
use crate::counts::{CountsKey, CountsStore, GroupDegreesStore, ANY};
use crate::error::{DatabaseHealth, Result, StoreError};
use crate::id::{
    EnqueuingIdUpdates, IdGenerator, IdGenerators, IdType, IdUpdateListener, IdUpdateWork,
    IgnoreIdUpdates,
};
use crate::lock::{RecordLockService, ResourceLocker};
use crate::reader::StorageReader;
use crate::schema::{SchemaCache, SchemaState, TokenRegistry};
use crate::store::record::{chain_degree_from_prev, RecordLoad};
use crate::store::{MetaDataStore, StoreFileMetadata, Stores};
use crate::txn::command::{Command, CommandBatch};
use crate::txn::log::TransactionLog;
use crate::txn::state::TransactionRecordState;
use crate::txn::visitor::{CountingVisitor, RecordStateVisitor, TransactionState, TxStateVisitor};
use crate::types::{
    is_null, Direction, KernelVersion, MemoryTracker, NodeId, RelId, SchemaId, NULL_REFERENCE,
};
use crate::upgrade::{check_runtime_version, UpgradeCoordinator, VersionCheck};
use crate::validate::{verify_sufficiently_locked, IntegrityValidator};
use crate::worksync::WorkSync;

/// Wrapper decorating the engine's visitor stack with a caller-provided
/// layer.
pub type VisitorDecorator<'a> =
    &'a dyn for<'v> Fn(&'v mut dyn TxStateVisitor) -> Box<dyn TxStateVisitor + 'v>;

/// Per-transaction scratch space: id reservation and memory accounting.
pub struct CommandCreationContext {
    ids: Arc<IdGenerators>,
    memory: MemoryTracker,
    dense_node_threshold: u32,
    external_dense_degrees: bool,
}

impl CommandCreationContext {
    pub fn reserve_node(&self) -> Result<NodeId> {
        Ok(NodeId(self.ids.allocate(IdType::Node)?))
    }

    pub fn reserve_relationship(&self) -> Result<RelId> {
        Ok(RelId(self.ids.allocate(IdType::Relationship)?))
    }

    pub fn reserve_schema(&self) -> Result<SchemaId> {
        Ok(SchemaId(self.ids.allocate(IdType::Schema)?))
    }

    pub fn reserve_token(&self) -> Result<u32> {
        let id = self.ids.allocate(IdType::Token)?;
        u32::try_from(id).map_err(|_| StoreError::OutOfIds(IdType::Token))
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }
}

type IndexSync = WorkSync<Box<dyn IndexUpdateListener>, IndexUpdatesWork>;
type TokenSync = WorkSync<Box<dyn EntityTokenUpdateListener>, TokenUpdateWork>;

pub struct StorageEngine {
    config: Config,
    /// The runtime format version; bumping it past the store version makes
    /// the next write attempt an upgrade.
    runtime_version: Mutex<KernelVersion>,
    dir: PathBuf,
    stores: Arc<Stores>,
    generators: Arc<IdGenerators>,
    counts: Arc<CountsStore>,
    degrees: Arc<GroupDegreesStore>,
    schema_cache: Arc<SchemaCache>,
    schema_state: Arc<SchemaState>,
    tokens: Arc<TokenRegistry>,
    health: Arc<DatabaseHealth>,
    upgrade: UpgradeCoordinator,
    log: Arc<TransactionLog>,
    chains: Vec<ApplierChain>,
    id_syncs: Vec<Arc<WorkSync<Arc<IdGenerator>, IdUpdateWork>>>,
    index_sync: Mutex<Option<Arc<IndexSync>>>,
    label_sync: Mutex<Option<Arc<TokenSync>>>,
    rel_type_sync: Mutex<Option<Arc<TokenSync>>>,
    /// Serializes log append and apply so log order is apply order.
    commit_lock: Mutex<()>,
    next_tx_id: AtomicU64,
}

impl StorageEngine {
    /// Opens or creates the store set under `dir`, replays the transaction
    /// log, loads tokens and schema, and rebuilds the counts store if its
    /// file is missing.
    pub fn open(dir: &Path, config: Config, runtime_version: KernelVersion) -> Result<Self> {
        let stores = Arc::new(Stores::open(dir, &config, runtime_version)?);
        let generators = Arc::new(IdGenerators::open(dir)?);
        let counts = Arc::new(CountsStore::open(&dir.join("counts.db"))?);
        let degrees = Arc::new(GroupDegreesStore::open(&dir.join("degrees.db"))?);
        let schema_cache = Arc::new(SchemaCache::new());
        let schema_state = Arc::new(SchemaState::new());
        let tokens = Arc::new(TokenRegistry::new());
        let record_locks = Arc::new(RecordLockService::new());

        let mut chains = Vec::with_capacity(ApplyMode::ALL.len());
        for mode in ApplyMode::ALL {
            chains.push(ApplierChain::new(
                mode,
                &config,
                Arc::clone(&stores),
                Arc::clone(&counts),
                Arc::clone(&degrees),
                Arc::clone(&schema_cache),
                Arc::clone(&schema_state),
                Arc::clone(&tokens),
                Arc::clone(&generators),
                Arc::clone(&record_locks),
            ));
        }
        let id_syncs = IdType::ALL
            .iter()
            .map(|&id_type| Arc::new(WorkSync::new(Arc::clone(generators.get(id_type)))))
            .collect();

        let engine = Self {
            runtime_version: Mutex::new(runtime_version),
            dir: dir.to_path_buf(),
            stores,
            generators,
            counts,
            degrees,
            schema_cache,
            schema_state,
            tokens,
            health: Arc::new(DatabaseHealth::new()),
            upgrade: UpgradeCoordinator::new(&config),
            log: Arc::new(TransactionLog::open(&dir.join("tx.log"))?),
            chains,
            id_syncs,
            index_sync: Mutex::new(None),
            label_sync: Mutex::new(None),
            rel_type_sync: Mutex::new(None),
            commit_lock: Mutex::new(()),
            next_tx_id: AtomicU64::new(1),
            config,
        };
        engine.start()?;
        Ok(engine)
    }

    fn start(&self) -> Result<()> {
        self.recover()?;
        self.load_schema_and_tokens()?;
        if self.counts.needs_rebuild() && self.stores.nodes.high_id() > 0 {
            let entries = self.compute_counts()?;
            self.counts
                .rebuild(entries, self.stores.meta.last_committed_tx()?)?;
        }
        let last_committed = self
            .stores
            .meta
            .last_committed_tx()?
            .max(self.next_tx_id.load(Ordering::Acquire).saturating_sub(1));
        self.next_tx_id.store(last_committed + 1, Ordering::Release);
        let version = self.stores.meta.kernel_version()?;
        debug!(
            directory = %self.dir.display(),
            last_committed,
            %version,
            "storage engine started"
        );
        Ok(())
    }

    /// Replays every complete log frame through the recovery applier chain.
    /// Safe to run repeatedly; record writes are rewrites and counter deltas
    /// are gated by transaction id.
    pub fn recover(&self) -> Result<()> {
        let transactions = self.log.transactions()?;
        if transactions.is_empty() {
            return Ok(());
        }
        let mut iter = transactions.into_iter();
        let (tx_id, version, commands) = iter.next().expect("nonempty transactions");
        let mut batch = CommandBatch::new(tx_id, version, commands);
        for (tx_id, version, commands) in iter {
            batch.chain(CommandBatch::new(tx_id, version, commands));
        }
        let last = batch.last_tx_id();
        info!(transactions = batch.iter().count(), last, "replaying transaction log");
        self.apply(&batch, ApplyMode::Recovery)?;
        self.next_tx_id.store(last + 1, Ordering::Release);
        Ok(())
    }

    /// Loads the token registry and schema cache from their stores; the
    /// schema-and-tokens lifecycle hook of the kernel calls this at init.
    pub fn load_schema_and_tokens(&self) -> Result<()> {
        self.tokens.clear();
        self.stores.tokens.scan(|record| {
            if record.in_use {
                self.tokens
                    .register(record.kind, record.id as u32, &record.name);
            }
            Ok(())
        })?;
        let mut rules = Vec::new();
        self.stores.schemas.scan(|record| {
            if record.in_use {
                rules.push(crate::schema::SchemaRule::deserialize(&record.payload)?);
            }
            Ok(())
        })?;
        self.schema_cache.load(rules);
        Ok(())
    }

    // ---- engine API ----

    pub fn new_reader(&self) -> StorageReader {
        StorageReader::new(
            Arc::clone(&self.stores),
            Arc::clone(&self.counts),
            Arc::clone(&self.degrees),
            Arc::clone(&self.schema_cache),
            Arc::clone(&self.tokens),
        )
    }

    pub fn new_command_creation_context(&self) -> CommandCreationContext {
        CommandCreationContext {
            ids: Arc::clone(&self.generators),
            memory: MemoryTracker::new(),
            dense_node_threshold: self.config.dense_node_threshold,
            external_dense_degrees: self.config.relaxed_locking_for_dense_nodes,
        }
    }

    /// Translates the logical transaction state into the ordered command
    /// list, validating integrity along the way.
    pub fn create_commands(
        &self,
        out: &mut Vec<Command>,
        tx_state: &TransactionState,
        reader: &StorageReader,
        ctx: &CommandCreationContext,
        locks: &dyn ResourceLocker,
        decorator: Option<VisitorDecorator<'_>>,
    ) -> Result<()> {
        self.health.assert_healthy()?;
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut record_state = TransactionRecordState::new(
            &self.stores,
            &ctx.ids,
            locks,
            &ctx.memory,
            ctx.dense_node_threshold,
            ctx.external_dense_degrees,
        );
        let record_visitor = RecordStateVisitor::new(&mut record_state);
        let mut counting = CountingVisitor::new(record_visitor, reader, tx_state);
        match decorator {
            Some(decorate) => {
                let mut wrapped = decorate(&mut counting);
                tx_state.accept(wrapped.as_mut())?;
            }
            None => tx_state.accept(&mut counting)?,
        }
        let counts = counting.into_counts();

        let validator = IntegrityValidator::new(&self.tokens);
        validator.validate(&mut record_state)?;
        record_state.extract_commands(out, &counts)?;
        if self.config.lock_verification {
            verify_sufficiently_locked(out, locks)?;
        }
        Ok(())
    }

    /// The single-element upgrade prefix targeting the kernel-version slot.
    pub fn create_upgrade_commands(&self, target: KernelVersion) -> Result<Vec<Command>> {
        crate::upgrade::create_upgrade_commands(&self.stores.meta, target)
    }

    /// Applies a linked batch. Any failure panics the health monitor and
    /// surfaces as an apply failure.
    pub fn apply(&self, batch: &CommandBatch, mode: ApplyMode) -> Result<()> {
        match self.apply_inner(batch, mode) {
            Ok(()) => Ok(()),
            Err(err) => {
                let wrapped = StoreError::ApplyFailure(format!(
                    "failed to apply transaction {}: {err}",
                    batch.tx_id
                ));
                self.health.panic(&wrapped);
                Err(wrapped)
            }
        }
    }

    fn apply_inner(&self, batch: &CommandBatch, mode: ApplyMode) -> Result<()> {
        let chain = &self.chains[mode.index()];
        let reverse = mode == ApplyMode::ReverseRecovery;
        let mut enqueuing = EnqueuingIdUpdates::new();
        let mut ignore = IgnoreIdUpdates;
        let listener: &mut dyn IdUpdateListener = if reverse {
            &mut ignore
        } else {
            &mut enqueuing
        };
        let mut ctx = BatchContext::new(listener);
        for tx in batch.iter() {
            let mut appliers = chain.start_tx(tx);
            for command in &tx.commands {
                for applier in appliers.iter_mut() {
                    applier.apply(command, &mut ctx)?;
                }
            }
            for applier in appliers.iter_mut() {
                applier.close(&mut ctx)?;
            }
            if !reverse && tx.tx_id > self.stores.meta.last_committed_tx()? {
                self.stores.meta.set_last_committed_tx(tx.tx_id)?;
            }
        }
        let index_updates = std::mem::take(&mut ctx.index_updates);
        let label_updates = std::mem::take(&mut ctx.label_updates);
        let rel_type_updates = std::mem::take(&mut ctx.rel_type_updates);
        drop(ctx);

        if mode.needs_auxiliary_stores() {
            if !index_updates.is_empty() {
                let sync = self.index_sync.lock().clone();
                if let Some(sync) = sync {
                    sync.apply(IndexUpdatesWork(index_updates))?;
                }
            }
            if !label_updates.is_empty() {
                let sync = self.label_sync.lock().clone();
                if let Some(sync) = sync {
                    sync.apply(TokenUpdateWork(label_updates))?;
                }
            }
            if !rel_type_updates.is_empty() {
                let sync = self.rel_type_sync.lock().clone();
                if let Some(sync) = sync {
                    sync.apply(TokenUpdateWork(rel_type_updates))?;
                }
            }
        }
        if !reverse {
            let freeing_tx = batch.last_tx_id();
            for (id_type, work) in enqueuing.drain(freeing_tx) {
                self.id_syncs[id_type.index()].apply(work)?;
            }
        }
        Ok(())
    }

    /// Commits one transaction: runs the upgrade state machine, translates
    /// the logical state into commands, appends them to the log, and applies
    /// them internally. Returns the committed transaction id.
    pub fn commit(&self, tx_state: &TransactionState, locks: &dyn ResourceLocker) -> Result<u64> {
        self.health.assert_healthy()?;
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        if tx_state.is_empty() {
            return self.stores.meta.last_committed_tx();
        }

        let runtime_version = *self.runtime_version.lock();
        let mut shared = Some(self.upgrade.shared());
        let version = self.stores.meta.kernel_version()?;
        match check_runtime_version(version, runtime_version)? {
            VersionCheck::UpToDate => {}
            VersionCheck::UpgradeNeeded { from, to } => {
                if self.upgrade.automatic_upgrade_allowed() {
                    shared = None;
                    match self.upgrade.try_exclusive() {
                        Some(_exclusive) => {
                            let current = self.stores.meta.kernel_version()?;
                            if current < to {
                                self.commit_upgrade_transaction(to)?;
                                info!(%from, %to, "kernel version upgrade committed");
                            }
                        }
                        None => {
                            warn!(
                                "Upgrade from {from} to {to} not possible right now due to \
                                 conflicting transaction, will retry on next write"
                            );
                        }
                    }
                    shared = Some(self.upgrade.shared());
                }
            }
        }
        let _shared = shared;
        let version = self.stores.meta.kernel_version()?;

        let ctx = self.new_command_creation_context();
        let reader = self.new_reader();
        let mut commands = Vec::new();
        self.create_commands(&mut commands, tx_state, &reader, &ctx, locks, None)?;
        if commands.is_empty() {
            return self.stores.meta.last_committed_tx();
        }

        let _commit = self.commit_lock.lock();
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::AcqRel);
        self.log.append(tx_id, version, &commands)?;
        let batch = CommandBatch::new(tx_id, version, commands);
        self.apply(&batch, ApplyMode::Internal)?;
        info!(tx_id, %version, "transaction committed");
        Ok(tx_id)
    }

    fn commit_upgrade_transaction(&self, target: KernelVersion) -> Result<u64> {
        let commands = self.create_upgrade_commands(target)?;
        let _commit = self.commit_lock.lock();
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::AcqRel);
        self.log.append(tx_id, target, &commands)?;
        let batch = CommandBatch::new(tx_id, target, commands);
        self.apply(&batch, ApplyMode::Internal)?;
        Ok(tx_id)
    }

    // ---- listener registration (one-shot) ----

    pub fn add_index_update_listener(
        &self,
        listener: Box<dyn IndexUpdateListener>,
    ) -> Result<()> {
        let mut slot = self.index_sync.lock();
        if slot.is_some() {
            return Err(StoreError::Configuration(
                "only one index update listener is supported".into(),
            ));
        }
        *slot = Some(Arc::new(WorkSync::new(listener)));
        Ok(())
    }

    pub fn add_node_label_update_listener(
        &self,
        listener: Box<dyn EntityTokenUpdateListener>,
    ) -> Result<()> {
        let mut slot = self.label_sync.lock();
        if slot.is_some() {
            return Err(StoreError::Configuration(
                "only one node label update listener is supported".into(),
            ));
        }
        *slot = Some(Arc::new(WorkSync::new(listener)));
        Ok(())
    }

    pub fn add_relationship_type_update_listener(
        &self,
        listener: Box<dyn EntityTokenUpdateListener>,
    ) -> Result<()> {
        let mut slot = self.rel_type_sync.lock();
        if slot.is_some() {
            return Err(StoreError::Configuration(
                "only one relationship type update listener is supported".into(),
            ));
        }
        *slot = Some(Arc::new(WorkSync::new(listener)));
        Ok(())
    }

    // ---- checkpoint and file enumeration ----

    /// Checkpoint: counts, then degrees, then the record stores, then the
    /// id generators against the new durable horizon.
    pub fn flush_and_force(&self) -> Result<()> {
        self.counts.checkpoint()?;
        self.degrees.checkpoint()?;
        self.stores.flush_all()?;
        let durable = self.stores.meta.last_committed_tx()?;
        self.generators.checkpoint_all(durable)?;
        debug!(durable, "checkpoint complete");
        Ok(())
    }

    /// `(atomic, replayable)` file listings: counts and degrees cannot be
    /// rebuilt from the log, record stores can.
    pub fn list_storage_files(&self) -> (Vec<StoreFileMetadata>, Vec<StoreFileMetadata>) {
        let atomic = vec![
            StoreFileMetadata {
                path: self.counts.storage_path().to_path_buf(),
                record_size: 0,
                replayable: false,
            },
            StoreFileMetadata {
                path: self.degrees.storage_path().to_path_buf(),
                record_size: 0,
                replayable: false,
            },
        ];
        (atomic, self.stores.replayable_files())
    }

    pub fn store_id(&self) -> Result<u64> {
        self.stores.meta.store_id()
    }

    pub fn metadata_provider(&self) -> &MetaDataStore {
        &self.stores.meta
    }

    pub fn counts_accessor(&self) -> Arc<CountsStore> {
        Arc::clone(&self.counts)
    }

    pub fn schema_state(&self) -> Arc<SchemaState> {
        Arc::clone(&self.schema_state)
    }

    pub fn health(&self) -> Arc<DatabaseHealth> {
        Arc::clone(&self.health)
    }

    pub fn transaction_log(&self) -> Arc<TransactionLog> {
        Arc::clone(&self.log)
    }

    pub fn kernel_version(&self) -> Result<KernelVersion> {
        self.stores.meta.kernel_version()
    }

    pub fn runtime_version(&self) -> KernelVersion {
        *self.runtime_version.lock()
    }

    /// Bumps the runtime format version. Monotone, like the store version
    /// it governs.
    pub fn set_runtime_version(&self, version: KernelVersion) {
        let mut current = self.runtime_version.lock();
        if version > *current {
            info!(from = %*current, to = %version, "runtime version bumped");
            *current = version;
        }
    }

    /// Flushes everything and releases the stores in reverse open order.
    pub fn shutdown(&self) -> Result<()> {
        self.flush_and_force()?;
        self.stores.shutdown()?;
        info!(directory = %self.dir.display(), "storage engine shut down");
        Ok(())
    }

    // ---- maintenance ----

    /// Moves the chain-head degrees of every dense chain into the group
    /// degrees store and flags the groups. Re-runnable: already-flagged
    /// directions are skipped. Must run outside any transaction.
    pub fn convert_dense_chains_to_external_degrees(&self) -> Result<u64> {
        let mut converted = 0u64;
        for group_id in self.stores.groups.reserved_low_ids()..self.stores.groups.high_id() {
            let mut group = self.stores.groups.read(group_id, RecordLoad::Always)?;
            if !group.in_use {
                continue;
            }
            let mut changed = false;
            for direction in [Direction::Outgoing, Direction::Incoming, Direction::Loop] {
                if group.has_external_degrees(direction) {
                    continue;
                }
                let first = group.first(direction);
                if is_null(first) {
                    continue;
                }
                let mut head = self.stores.relationships.read(first, RecordLoad::Normal)?;
                let degree = chain_degree_from_prev(head.chain_prev(group.owning_node));
                self.degrees.increment(group_id, direction, degree as i64);
                head.set_chain_prev(group.owning_node, NULL_REFERENCE);
                self.stores
                    .relationships
                    .write(&head, &mut IgnoreIdUpdates)?;
                group.set_external_degrees(direction, true);
                changed = true;
            }
            if changed {
                self.stores.groups.write(&group, &mut IgnoreIdUpdates)?;
                converted += 1;
            }
        }
        info!(converted, "dense chains converted to external degrees");
        Ok(converted)
    }

    /// Recomputes the counts entries from the record stores. Used by the
    /// rebuild at start and by consistency tests.
    pub fn compute_counts(&self) -> Result<Vec<(CountsKey, i64)>> {
        let mut delta = crate::counts::CountsDelta::new();
        self.stores.nodes.scan(|node| {
            if node.in_use {
                delta.increment(CountsKey::node(ANY), 1);
                for label in &node.labels {
                    delta.increment(CountsKey::node(label.0 as i64), 1);
                }
            }
            Ok(())
        })?;
        let nodes = &self.stores.nodes;
        self.stores.relationships.scan(|rel| {
            if rel.in_use {
                delta.increment(CountsKey::relationship(ANY, ANY, ANY), 1);
                delta.increment(CountsKey::relationship(ANY, rel.rel_type as i64, ANY), 1);
                let src = nodes.read(rel.src, RecordLoad::Normal)?;
                for label in &src.labels {
                    delta.increment(
                        CountsKey::relationship(label.0 as i64, rel.rel_type as i64, ANY),
                        1,
                    );
                }
                let dst = nodes.read(rel.dst, RecordLoad::Normal)?;
                for label in &dst.labels {
                    delta.increment(
                        CountsKey::relationship(ANY, rel.rel_type as i64, label.0 as i64),
                        1,
                    );
                }
            }
            Ok(())
        })?;
        Ok(delta.entries().collect())
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("dir", &self.dir)
            .field("runtime_version", &self.runtime_version)
            .finish_non_exhaustive()
    }
}
