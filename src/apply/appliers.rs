//! The individual appliers of the chain.

use std::collections::HashMap;

use crate::counts::{CountsStore, GroupDegreesStore};
use crate::error::{Result, StoreError};
use crate::id::{IdGenerators, IdType};
use crate::lock::{LockService, Resource};
use crate::reader::decode_property_value;
use crate::schema::{SchemaCache, SchemaState, TokenRegistry};
use crate::store::record::{DynRecord, PropertyRecord, RecordLoad};
use crate::store::Stores;
use crate::txn::command::Command;
use crate::types::{is_null, KeyId, PropertyValue};

use super::{BatchContext, CommandApplier, IndexEntryUpdate, TokenScanUpdate};

/// Optional pre-write verification of record invariants. Debug tooling; the
/// checks read the stores as already mutated by earlier commands of the same
/// transaction.
pub struct ConsistencyCheckingApplier<'a> {
    stores: &'a Stores,
}

impl<'a> ConsistencyCheckingApplier<'a> {
    pub fn new(stores: &'a Stores) -> Self {
        Self { stores }
    }
}

impl CommandApplier for ConsistencyCheckingApplier<'_> {
    fn apply(&mut self, command: &Command, _ctx: &mut BatchContext<'_>) -> Result<()> {
        match command {
            Command::Relationship(pair) if pair.after.in_use => {
                for node in [pair.after.src, pair.after.dst] {
                    let record = self.stores.nodes.read(node, RecordLoad::Check)?;
                    if !record.in_use {
                        return Err(StoreError::ApplyFailure(format!(
                            "relationship {} references node {node} which is not in use",
                            pair.id()
                        )));
                    }
                }
            }
            Command::Property { pair, .. } if pair.after.in_use => {
                let in_use = if pair.after.owner_is_node {
                    self.stores
                        .nodes
                        .read(pair.after.owner, RecordLoad::Check)?
                        .in_use
                } else {
                    self.stores
                        .relationships
                        .read(pair.after.owner, RecordLoad::Check)?
                        .in_use
                };
                // Owner commands precede property commands in batch order,
                // so the owner record is already written.
                if !in_use {
                    return Err(StoreError::ApplyFailure(format!(
                        "property {} owner {} is not in use",
                        pair.id(),
                        pair.after.owner
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Writes record mutations through to the stores, keeps the schema cache and
/// token registry aligned, and reports id transitions to the batch listener.
pub struct NeoStoreApplier<'a> {
    stores: &'a Stores,
    schema_cache: &'a SchemaCache,
    tokens: &'a TokenRegistry,
    lock_service: &'a dyn LockService,
}

impl<'a> NeoStoreApplier<'a> {
    pub fn new(
        stores: &'a Stores,
        schema_cache: &'a SchemaCache,
        tokens: &'a TokenRegistry,
        lock_service: &'a dyn LockService,
    ) -> Self {
        Self {
            stores,
            schema_cache,
            tokens,
            lock_service,
        }
    }
}

impl CommandApplier for NeoStoreApplier<'_> {
    fn apply(&mut self, command: &Command, ctx: &mut BatchContext<'_>) -> Result<()> {
        match command {
            Command::Node(pair) => {
                let _lock = self.lock_service.lock(Resource::Node(pair.id()))?;
                self.stores.nodes.write(&pair.after, ctx.id_updates)?;
            }
            Command::Relationship(pair) => {
                let _lock = self
                    .lock_service
                    .lock(Resource::Relationship(pair.id()))?;
                self.stores.relationships.write(&pair.after, ctx.id_updates)?;
            }
            Command::Group(pair) => {
                self.stores.groups.write(&pair.after, ctx.id_updates)?;
            }
            Command::Property {
                pair,
                string_blocks,
                array_blocks,
            } => {
                self.stores.properties.write(&pair.after, ctx.id_updates)?;
                for block in string_blocks {
                    self.stores.strings.write(&block.after, ctx.id_updates)?;
                }
                for block in array_blocks {
                    self.stores.arrays.write(&block.after, ctx.id_updates)?;
                }
            }
            Command::Schema { pair, rule } => {
                self.stores.schemas.write(&pair.after, ctx.id_updates)?;
                if pair.after.in_use {
                    self.schema_cache.add(rule.clone());
                } else {
                    self.schema_cache.remove(rule.id);
                }
            }
            Command::Token(pair) => {
                self.stores.tokens.write(&pair.after, ctx.id_updates)?;
                if pair.after.in_use {
                    self.tokens
                        .register(pair.after.kind, pair.after.id as u32, &pair.after.name);
                }
            }
            Command::MetaData {
                position, after, ..
            } => {
                self.stores.meta.set(*position, *after)?;
            }
            Command::Counts { .. } | Command::Degrees { .. } => {}
        }
        Ok(())
    }
}

/// Propagates ids observed in external or recovered batches into the id
/// generators, so later allocations never collide with replayed records.
pub struct HighIdApplier<'a> {
    stores: &'a Stores,
    generators: &'a IdGenerators,
    highest: HashMap<IdType, u64>,
}

impl<'a> HighIdApplier<'a> {
    pub fn new(stores: &'a Stores, generators: &'a IdGenerators) -> Self {
        Self {
            stores,
            generators,
            highest: HashMap::new(),
        }
    }

    fn observe(&mut self, id_type: IdType, id: u64) {
        let slot = self.highest.entry(id_type).or_insert(0);
        if id >= *slot {
            *slot = id;
        }
    }
}

impl CommandApplier for HighIdApplier<'_> {
    fn apply(&mut self, command: &Command, _ctx: &mut BatchContext<'_>) -> Result<()> {
        match command {
            Command::Node(pair) => self.observe(IdType::Node, pair.id()),
            Command::Relationship(pair) => self.observe(IdType::Relationship, pair.id()),
            Command::Group(pair) => self.observe(IdType::RelationshipGroup, pair.id()),
            Command::Property {
                pair,
                string_blocks,
                array_blocks,
            } => {
                self.observe(IdType::Property, pair.id());
                for block in string_blocks {
                    self.observe(IdType::StringBlock, block.id());
                }
                for block in array_blocks {
                    self.observe(IdType::ArrayBlock, block.id());
                }
            }
            Command::Schema { pair, .. } => self.observe(IdType::Schema, pair.id()),
            Command::Token(pair) => self.observe(IdType::Token, pair.id()),
            Command::Counts { .. } | Command::Degrees { .. } | Command::MetaData { .. } => {}
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &mut BatchContext<'_>) -> Result<()> {
        for (&id_type, &highest) in &self.highest {
            self.generators.get(id_type).mark_used(highest);
            let store_high = match id_type {
                IdType::Node => &self.stores.nodes as &dyn HighIdStore,
                IdType::Relationship => &self.stores.relationships,
                IdType::RelationshipGroup => &self.stores.groups,
                IdType::Property => &self.stores.properties,
                IdType::StringBlock => &self.stores.strings,
                IdType::ArrayBlock => &self.stores.arrays,
                IdType::Schema => &self.stores.schemas,
                IdType::Token => &self.stores.tokens,
            };
            store_high.bump(highest);
        }
        Ok(())
    }
}

trait HighIdStore {
    fn bump(&self, id: u64);
}

impl<R: crate::store::record::RecordCodec> HighIdStore for crate::store::RecordFile<R> {
    fn bump(&self, id: u64) {
        self.bump_high_id(id);
    }
}

/// Drops derived schema state when schema or token commands arrive from an
/// external or recovered batch.
pub struct CacheInvalidationApplier<'a> {
    schema_state: &'a SchemaState,
}

impl<'a> CacheInvalidationApplier<'a> {
    pub fn new(schema_state: &'a SchemaState) -> Self {
        Self { schema_state }
    }
}

impl CommandApplier for CacheInvalidationApplier<'_> {
    fn apply(&mut self, command: &Command, _ctx: &mut BatchContext<'_>) -> Result<()> {
        if matches!(command, Command::Schema { .. } | Command::Token(_)) {
            self.schema_state.clear();
        }
        Ok(())
    }
}

/// Applies counts and degree deltas, gated on the transaction id so replay
/// stays idempotent.
pub struct CountsApplier<'a> {
    counts: &'a CountsStore,
    degrees: &'a GroupDegreesStore,
    apply_counts: bool,
    apply_degrees: bool,
}

impl<'a> CountsApplier<'a> {
    pub fn new(counts: &'a CountsStore, degrees: &'a GroupDegreesStore, tx_id: u64) -> Self {
        Self {
            counts,
            degrees,
            apply_counts: counts.begin_tx(tx_id),
            apply_degrees: degrees.begin_tx(tx_id),
        }
    }
}

impl CommandApplier for CountsApplier<'_> {
    fn apply(&mut self, command: &Command, _ctx: &mut BatchContext<'_>) -> Result<()> {
        match command {
            Command::Counts { key, delta } if self.apply_counts => {
                self.counts.apply_delta(*key, *delta);
            }
            Command::Degrees {
                group,
                direction,
                delta,
            } if self.apply_degrees => {
                self.degrees.increment(*group, *direction, *delta);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Derives index and token-scan updates from record commands; the engine
/// forwards them to the registered listeners through their work-sync queues
/// after the batch completes.
#[derive(Default)]
pub struct IndexApplier;

impl IndexApplier {
    pub fn new() -> Self {
        Self
    }

    fn property_value(
        record: &PropertyRecord,
        blocks: &HashMap<u64, DynRecord>,
    ) -> Result<Option<PropertyValue>> {
        if !record.in_use {
            return Ok(None);
        }
        let value = decode_property_value(record, |_, first, len| {
            let mut bytes = Vec::with_capacity(len as usize);
            let mut current = first;
            while !is_null(current) {
                let block = blocks.get(&current).ok_or_else(|| {
                    StoreError::Corruption(format!(
                        "property {} value block {current} missing from command",
                        record.id
                    ))
                })?;
                bytes.extend_from_slice(&block.payload);
                current = block.next_block;
            }
            if bytes.len() != len as usize {
                return Err(StoreError::Corruption(format!(
                    "property {} value chain has {} bytes, expected {len}",
                    record.id,
                    bytes.len()
                )));
            }
            Ok(bytes)
        })?;
        Ok(Some(value))
    }
}

impl CommandApplier for IndexApplier {
    fn apply(&mut self, command: &Command, ctx: &mut BatchContext<'_>) -> Result<()> {
        match command {
            Command::Node(pair) => {
                let added: Vec<u32> = pair
                    .after
                    .labels
                    .iter()
                    .filter(|label| !pair.before.labels.contains(label))
                    .map(|label| label.0)
                    .collect();
                let removed: Vec<u32> = pair
                    .before
                    .labels
                    .iter()
                    .filter(|label| !pair.after.labels.contains(label))
                    .map(|label| label.0)
                    .collect();
                if !added.is_empty() || !removed.is_empty() {
                    ctx.label_updates.push(TokenScanUpdate {
                        entity: pair.id(),
                        added,
                        removed,
                    });
                }
            }
            Command::Relationship(pair) => {
                if pair.creates() {
                    ctx.rel_type_updates.push(TokenScanUpdate {
                        entity: pair.id(),
                        added: vec![pair.after.rel_type],
                        removed: vec![],
                    });
                } else if pair.deletes() {
                    ctx.rel_type_updates.push(TokenScanUpdate {
                        entity: pair.id(),
                        added: vec![],
                        removed: vec![pair.before.rel_type],
                    });
                }
            }
            Command::Property {
                pair,
                string_blocks,
                array_blocks,
            } => {
                let before_blocks: HashMap<u64, DynRecord> = string_blocks
                    .iter()
                    .chain(array_blocks.iter())
                    .map(|block| (block.id(), block.before.clone()))
                    .collect();
                let after_blocks: HashMap<u64, DynRecord> = string_blocks
                    .iter()
                    .chain(array_blocks.iter())
                    .map(|block| (block.id(), block.after.clone()))
                    .collect();
                let before = Self::property_value(&pair.before, &before_blocks)?;
                let after = Self::property_value(&pair.after, &after_blocks)?;
                if before != after {
                    let record = if pair.after.in_use {
                        &pair.after
                    } else {
                        &pair.before
                    };
                    ctx.index_updates.push(IndexEntryUpdate {
                        entity: record.owner,
                        entity_is_node: record.owner_is_node,
                        key: KeyId(record.key),
                        before,
                        after,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}
