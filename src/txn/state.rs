//! Per-transaction staging of record-level changes. Every touched record is
//! loaded once as its `before` image; edits accumulate on the `after` image
//! until extraction turns the staged pairs into ordered commands.

use std::collections::{BTreeMap, HashMap};

use smallvec::SmallVec;

use crate::counts::CountsDelta;
use crate::error::{Result, StoreError};
use crate::id::{IdGenerators, IdType};
use crate::lock::{Resource, ResourceLocker};
use crate::schema::SchemaRule;
use crate::store::record::{
    chain_degree_from_prev, DynRecord, NodeRecord, PropertyRecord, RecordCodec, RecordLoad,
    RelationshipGroupRecord, RelationshipRecord, SchemaRecord, TokenRecord, ValueKind,
    DYN_PAYLOAD, INLINE_VALUE_CAP, MAX_INLINE_LABELS, MAX_TOKEN_NAME,
};
use crate::store::{RecordFile, Stores};
use crate::txn::command::{Command, RecordPair};
use crate::types::{
    is_null, Direction, KeyId, LabelId, MemoryTracker, NodeId, Owner, PropertyValue, RelId,
    RelTypeId, SchemaId, TokenKind, NULL_REFERENCE,
};

#[derive(Clone, Debug)]
pub struct RecordChange<R> {
    pub before: R,
    pub after: R,
}

/// Staging buffer for one store, keyed by record id with load-or-create
/// semantics.
#[derive(Debug)]
pub struct RecordChanges<R: RecordCodec> {
    changes: BTreeMap<u64, RecordChange<R>>,
}

impl<R: RecordCodec + PartialEq> RecordChanges<R> {
    fn new() -> Self {
        Self {
            changes: BTreeMap::new(),
        }
    }

    /// Loads the current record as the before image on first touch.
    fn ensure_loaded(&mut self, id: u64, store: &RecordFile<R>) -> Result<()> {
        if self.changes.contains_key(&id) {
            return Ok(());
        }
        let before = store.read(id, RecordLoad::Normal)?;
        self.changes.insert(
            id,
            RecordChange {
                after: before.clone(),
                before,
            },
        );
        Ok(())
    }

    /// Stages a brand new record; the before image is not-in-use.
    fn create(&mut self, id: u64) -> &mut R {
        let change = self.changes.entry(id).or_insert_with(|| RecordChange {
            before: R::new_record(id),
            after: R::new_record(id),
        });
        &mut change.after
    }

    fn after(&self, id: u64) -> Result<&R> {
        self.changes
            .get(&id)
            .map(|change| &change.after)
            .ok_or_else(|| {
                StoreError::Corruption(format!("{} record {id} not staged", R::STORE_NAME))
            })
    }

    fn after_mut(&mut self, id: u64) -> Result<&mut R> {
        self.changes
            .get_mut(&id)
            .map(|change| &mut change.after)
            .ok_or_else(|| {
                StoreError::Corruption(format!("{} record {id} not staged", R::STORE_NAME))
            })
    }

    fn before(&self, id: u64) -> Result<&R> {
        self.changes
            .get(&id)
            .map(|change| &change.before)
            .ok_or_else(|| {
                StoreError::Corruption(format!("{} record {id} not staged", R::STORE_NAME))
            })
    }

    /// Staged pairs whose after image differs from the before image, in
    /// ascending id order.
    fn changed_pairs(&self) -> impl Iterator<Item = RecordPair<R>> + '_ {
        self.changes
            .values()
            .filter(|change| change.before != change.after)
            .map(|change| RecordPair::new(change.before.clone(), change.after.clone()))
    }

    fn take_pair(&mut self, id: u64) -> Option<RecordPair<R>> {
        self.changes
            .remove(&id)
            .filter(|change| change.before != change.after)
            .map(|change| RecordPair::new(change.before, change.after))
    }
}

#[derive(Default, Debug)]
struct PropBlockSet {
    strings: SmallVec<[u64; 2]>,
    arrays: SmallVec<[u64; 2]>,
}

/// Where a relationship chain is headed: directly off a sparse node, or off
/// one direction slot of a dense node's group.
#[derive(Copy, Clone, Debug)]
enum ChainHead {
    Node,
    Group(u64, Direction),
}

/// Accumulator of record deltas for one transaction, populated by the
/// tx-state visitor and drained by command extraction.
pub struct TransactionRecordState<'a> {
    stores: &'a Stores,
    ids: &'a IdGenerators,
    locks: &'a dyn ResourceLocker,
    memory: &'a MemoryTracker,
    dense_node_threshold: u32,
    external_dense_degrees: bool,
    nodes: RecordChanges<NodeRecord>,
    rels: RecordChanges<RelationshipRecord>,
    groups: RecordChanges<RelationshipGroupRecord>,
    props: RecordChanges<PropertyRecord>,
    strings: RecordChanges<DynRecord>,
    arrays: RecordChanges<DynRecord>,
    schemas: RecordChanges<SchemaRecord>,
    tokens: RecordChanges<TokenRecord>,
    schema_rules: HashMap<u64, SchemaRule>,
    prop_blocks: HashMap<u64, PropBlockSet>,
    degrees: BTreeMap<(u64, Direction), i64>,
}

impl<'a> TransactionRecordState<'a> {
    pub fn new(
        stores: &'a Stores,
        ids: &'a IdGenerators,
        locks: &'a dyn ResourceLocker,
        memory: &'a MemoryTracker,
        dense_node_threshold: u32,
        external_dense_degrees: bool,
    ) -> Self {
        Self {
            stores,
            ids,
            locks,
            memory,
            dense_node_threshold,
            external_dense_degrees,
            nodes: RecordChanges::new(),
            rels: RecordChanges::new(),
            groups: RecordChanges::new(),
            props: RecordChanges::new(),
            strings: RecordChanges::new(),
            arrays: RecordChanges::new(),
            schemas: RecordChanges::new(),
            tokens: RecordChanges::new(),
            schema_rules: HashMap::new(),
            prop_blocks: HashMap::new(),
            degrees: BTreeMap::new(),
        }
    }

    fn degree_delta(&mut self, group: u64, direction: Direction, delta: i64) {
        let slot = self.degrees.entry((group, direction)).or_insert(0);
        *slot += delta;
        if *slot == 0 {
            self.degrees.remove(&(group, direction));
        }
    }

    // ---- nodes ----

    pub fn node_create(&mut self, node: NodeId) -> Result<()> {
        self.locks.acquire_exclusive(Resource::Node(node.0))?;
        self.memory.allocate(NodeRecord::RECORD_SIZE as u64);
        let record = self.nodes.create(node.0);
        record.in_use = true;
        Ok(())
    }

    pub fn node_delete(&mut self, node: NodeId) -> Result<()> {
        self.locks.acquire_exclusive(Resource::Node(node.0))?;
        self.nodes.ensure_loaded(node.0, &self.stores.nodes)?;
        let first_prop = self.nodes.after(node.0)?.next_prop;
        self.delete_property_chain(Owner::Node(node))?;
        let record = self.nodes.after_mut(node.0)?;
        debug_assert!(is_null(first_prop) || is_null(record.next_prop));
        record.in_use = false;
        record.labels.clear();
        record.next_prop = NULL_REFERENCE;
        Ok(())
    }

    pub fn add_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.nodes.ensure_loaded(node.0, &self.stores.nodes)?;
        let record = self.nodes.after_mut(node.0)?;
        if record.labels.contains(&label) {
            return Ok(());
        }
        if record.labels.len() >= MAX_INLINE_LABELS {
            return Err(StoreError::Validation(format!(
                "node {node} cannot carry more than {MAX_INLINE_LABELS} labels"
            )));
        }
        record.labels.push(label);
        record.labels.sort_unstable();
        Ok(())
    }

    pub fn remove_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.nodes.ensure_loaded(node.0, &self.stores.nodes)?;
        let record = self.nodes.after_mut(node.0)?;
        record.labels.retain(|existing| *existing != label);
        Ok(())
    }

    // ---- relationships ----

    pub fn rel_create(
        &mut self,
        rel: RelId,
        rel_type: RelTypeId,
        src: NodeId,
        dst: NodeId,
    ) -> Result<()> {
        self.locks.acquire_exclusive(Resource::Node(src.0))?;
        self.locks.acquire_exclusive(Resource::Node(dst.0))?;
        self.locks.acquire_exclusive(Resource::Relationship(rel.0))?;
        self.memory.allocate(RelationshipRecord::RECORD_SIZE as u64);

        let record = self.rels.create(rel.0);
        record.in_use = true;
        record.src = src.0;
        record.dst = dst.0;
        record.rel_type = rel_type.0;

        if src == dst {
            self.connect(src.0, rel.0, Direction::Loop)?;
        } else {
            self.connect(src.0, rel.0, Direction::Outgoing)?;
            self.connect(dst.0, rel.0, Direction::Incoming)?;
        }
        Ok(())
    }

    pub fn rel_delete(&mut self, rel: RelId) -> Result<()> {
        self.rels.ensure_loaded(rel.0, &self.stores.relationships)?;
        let (src, dst) = {
            let record = self.rels.after(rel.0)?;
            if !record.in_use {
                return Err(StoreError::NotInUse {
                    store: RelationshipRecord::STORE_NAME,
                    id: rel.0,
                });
            }
            (record.src, record.dst)
        };
        self.locks.acquire_exclusive(Resource::Node(src))?;
        self.locks.acquire_exclusive(Resource::Node(dst))?;
        self.locks.acquire_exclusive(Resource::Relationship(rel.0))?;

        self.delete_property_chain(Owner::Relationship(rel))?;
        if src == dst {
            self.disconnect(src, rel.0, Direction::Loop)?;
        } else {
            self.disconnect(src, rel.0, Direction::Outgoing)?;
            self.disconnect(dst, rel.0, Direction::Incoming)?;
        }
        let record = self.rels.after_mut(rel.0)?;
        record.in_use = false;
        record.next_prop = NULL_REFERENCE;
        Ok(())
    }

    /// Splices `rel` into `node`'s chain for `direction`, transitioning the
    /// node to dense groups when the chain degree crosses the threshold.
    fn connect(&mut self, node: u64, rel: u64, direction: Direction) -> Result<()> {
        self.nodes.ensure_loaded(node, &self.stores.nodes)?;
        if self.nodes.after(node)?.dense {
            let rel_type = self.rels.after(rel)?.rel_type;
            let group = self.ensure_group(node, rel_type)?;
            self.connect_group(group, direction, node, rel)?;
            return Ok(());
        }
        let new_degree = self.connect_sparse(node, rel)?;
        if new_degree >= self.dense_node_threshold as u64 {
            self.convert_to_dense(node)?;
        }
        Ok(())
    }

    fn connect_sparse(&mut self, node: u64, rel: u64) -> Result<u64> {
        let first = self.nodes.after(node)?.next_rel;
        let old_degree = if is_null(first) {
            0
        } else {
            self.rels.ensure_loaded(first, &self.stores.relationships)?;
            chain_degree_from_prev(self.rels.after(first)?.chain_prev(node))
        };
        if !is_null(first) {
            self.locks.acquire_exclusive(Resource::Relationship(first))?;
            let old_first = self.rels.after_mut(first)?;
            old_first.set_first_in_chain(node, false);
            old_first.set_chain_prev(node, rel);
        }
        let record = self.rels.after_mut(rel)?;
        record.set_chain_next(node, first);
        record.set_first_in_chain(node, true);
        record.set_chain_prev(node, old_degree + 1);
        self.nodes.after_mut(node)?.next_rel = rel;
        Ok(old_degree + 1)
    }

    fn disconnect(&mut self, node: u64, rel: u64, direction: Direction) -> Result<()> {
        self.nodes.ensure_loaded(node, &self.stores.nodes)?;
        if self.nodes.after(node)?.dense {
            let rel_type = self.rels.after(rel)?.rel_type;
            let group = self
                .find_group(node, rel_type)?
                .ok_or_else(|| {
                    StoreError::Corruption(format!(
                        "dense node {node} has no group for type {rel_type}"
                    ))
                })?;
            self.disconnect_chain(node, rel, ChainHead::Group(group, direction))?;
        } else {
            self.disconnect_chain(node, rel, ChainHead::Node)?;
        }
        Ok(())
    }

    fn chain_head(&self, node: u64, head: ChainHead) -> Result<(u64, bool)> {
        match head {
            ChainHead::Node => Ok((self.nodes.after(node)?.next_rel, false)),
            ChainHead::Group(group, direction) => {
                let record = self.groups.after(group)?;
                Ok((record.first(direction), record.has_external_degrees(direction)))
            }
        }
    }

    fn set_chain_head(&mut self, node: u64, head: ChainHead, value: u64) -> Result<()> {
        match head {
            ChainHead::Node => self.nodes.after_mut(node)?.next_rel = value,
            ChainHead::Group(group, direction) => {
                self.groups.after_mut(group)?.set_first(direction, value);
            }
        }
        Ok(())
    }

    fn disconnect_chain(&mut self, node: u64, rel: u64, head: ChainHead) -> Result<()> {
        let (head_rel, external) = self.chain_head(node, head)?;
        let (prev, next, is_first) = {
            let record = self.rels.after(rel)?;
            (
                record.chain_prev(node),
                record.chain_next(node),
                record.is_first_in_chain(node),
            )
        };
        if !is_null(next) {
            self.locks.acquire_exclusive(Resource::Relationship(next))?;
            self.rels.ensure_loaded(next, &self.stores.relationships)?;
        }
        if is_first {
            if head_rel != rel {
                return Err(StoreError::Corruption(format!(
                    "relationship {rel} marked first but chain heads at {head_rel}"
                )));
            }
            let degree = if external { 0 } else { chain_degree_from_prev(prev) };
            self.set_chain_head(node, head, next)?;
            if !is_null(next) {
                let next_record = self.rels.after_mut(next)?;
                next_record.set_first_in_chain(node, true);
                next_record.set_chain_prev(
                    node,
                    if external {
                        NULL_REFERENCE
                    } else {
                        degree.saturating_sub(1)
                    },
                );
            }
        } else {
            self.locks.acquire_exclusive(Resource::Relationship(prev))?;
            self.rels.ensure_loaded(prev, &self.stores.relationships)?;
            if !external {
                self.rels
                    .ensure_loaded(head_rel, &self.stores.relationships)?;
                let head_record = self.rels.after_mut(head_rel)?;
                let degree = chain_degree_from_prev(head_record.chain_prev(node));
                head_record.set_chain_prev(node, degree.saturating_sub(1));
            }
            let prev_record = self.rels.after_mut(prev)?;
            prev_record.set_chain_next(node, next);
            if !is_null(next) {
                self.rels.after_mut(next)?.set_chain_prev(node, prev);
            }
        }
        if external {
            if let ChainHead::Group(group, direction) = head {
                self.degree_delta(group, direction, -1);
            }
        }
        let record = self.rels.after_mut(rel)?;
        record.set_chain_prev(node, NULL_REFERENCE);
        record.set_chain_next(node, NULL_REFERENCE);
        record.set_first_in_chain(node, false);
        Ok(())
    }

    // ---- dense groups ----

    fn find_group(&mut self, node: u64, rel_type: u32) -> Result<Option<u64>> {
        let mut current = self.nodes.after(node)?.next_rel;
        while !is_null(current) {
            self.groups.ensure_loaded(current, &self.stores.groups)?;
            let record = self.groups.after(current)?;
            if record.rel_type == rel_type {
                return Ok(Some(current));
            }
            current = record.next_group;
        }
        Ok(None)
    }

    fn ensure_group(&mut self, node: u64, rel_type: u32) -> Result<u64> {
        if let Some(group) = self.find_group(node, rel_type)? {
            return Ok(group);
        }
        let group = self.ids.allocate(IdType::RelationshipGroup)?;
        self.memory
            .allocate(RelationshipGroupRecord::RECORD_SIZE as u64);
        let head = self.nodes.after(node)?.next_rel;
        let record = self.groups.create(group);
        record.in_use = true;
        record.rel_type = rel_type;
        record.owning_node = node;
        record.next_group = head;
        self.nodes.after_mut(node)?.next_rel = group;
        Ok(group)
    }

    fn connect_group(
        &mut self,
        group: u64,
        direction: Direction,
        node: u64,
        rel: u64,
    ) -> Result<()> {
        let (first, mut external) = {
            let record = self.groups.after(group)?;
            (record.first(direction), record.has_external_degrees(direction))
        };
        if is_null(first) && self.external_dense_degrees && !external {
            self.groups
                .after_mut(group)?
                .set_external_degrees(direction, true);
            external = true;
        }
        let old_degree = if external || is_null(first) {
            0
        } else {
            self.rels.ensure_loaded(first, &self.stores.relationships)?;
            chain_degree_from_prev(self.rels.after(first)?.chain_prev(node))
        };
        if !is_null(first) {
            self.locks.acquire_exclusive(Resource::Relationship(first))?;
            self.rels.ensure_loaded(first, &self.stores.relationships)?;
            let old_first = self.rels.after_mut(first)?;
            old_first.set_first_in_chain(node, false);
            old_first.set_chain_prev(node, rel);
        }
        let record = self.rels.after_mut(rel)?;
        record.set_chain_next(node, first);
        record.set_first_in_chain(node, true);
        record.set_chain_prev(
            node,
            if external {
                NULL_REFERENCE
            } else {
                old_degree + 1
            },
        );
        self.groups.after_mut(group)?.set_first(direction, rel);
        if external {
            self.degree_delta(group, direction, 1);
        }
        Ok(())
    }

    /// Converts a sparse chain into per-type groups as one atomic bundle of
    /// staged writes.
    fn convert_to_dense(&mut self, node: u64) -> Result<()> {
        let mut chain = Vec::new();
        let mut current = self.nodes.after(node)?.next_rel;
        while !is_null(current) {
            self.rels.ensure_loaded(current, &self.stores.relationships)?;
            chain.push(current);
            current = self.rels.after(current)?.chain_next(node);
        }

        {
            let record = self.nodes.after_mut(node)?;
            record.dense = true;
            record.next_rel = NULL_REFERENCE;
        }

        for rel in chain {
            let (rel_type, direction) = {
                let record = self.rels.after_mut(rel)?;
                let direction = if record.is_loop() {
                    Direction::Loop
                } else if record.src == node {
                    Direction::Outgoing
                } else {
                    Direction::Incoming
                };
                record.set_chain_prev(node, NULL_REFERENCE);
                record.set_chain_next(node, NULL_REFERENCE);
                record.set_first_in_chain(node, false);
                (record.rel_type, direction)
            };
            let group = self.ensure_group(node, rel_type)?;
            self.connect_group(group, direction, node, rel)?;
        }
        Ok(())
    }

    // ---- properties ----

    fn owner_first_prop(&mut self, owner: Owner) -> Result<u64> {
        match owner {
            Owner::Node(node) => {
                self.nodes.ensure_loaded(node.0, &self.stores.nodes)?;
                Ok(self.nodes.after(node.0)?.next_prop)
            }
            Owner::Relationship(rel) => {
                self.rels.ensure_loaded(rel.0, &self.stores.relationships)?;
                Ok(self.rels.after(rel.0)?.next_prop)
            }
        }
    }

    fn set_owner_first_prop(&mut self, owner: Owner, value: u64) -> Result<()> {
        match owner {
            Owner::Node(node) => self.nodes.after_mut(node.0)?.next_prop = value,
            Owner::Relationship(rel) => self.rels.after_mut(rel.0)?.next_prop = value,
        }
        Ok(())
    }

    fn lock_owner(&mut self, owner: Owner) -> Result<()> {
        match owner {
            Owner::Node(node) => self.locks.acquire_exclusive(Resource::Node(node.0)),
            Owner::Relationship(rel) => {
                self.locks.acquire_exclusive(Resource::Relationship(rel.0))
            }
        }
    }

    fn find_property(&mut self, owner: Owner, key: KeyId) -> Result<Option<u64>> {
        let mut current = self.owner_first_prop(owner)?;
        while !is_null(current) {
            self.props.ensure_loaded(current, &self.stores.properties)?;
            let record = self.props.after(current)?;
            if record.key == key.0 {
                return Ok(Some(current));
            }
            current = record.next_prop;
        }
        Ok(None)
    }

    pub fn add_property(&mut self, owner: Owner, key: KeyId, value: &PropertyValue) -> Result<()> {
        self.lock_owner(owner)?;
        if self.find_property(owner, key)?.is_some() {
            return Err(StoreError::Validation(format!(
                "property {key} already exists on {owner:?}"
            )));
        }
        let first = self.owner_first_prop(owner)?;
        let prop = self.ids.allocate(IdType::Property)?;
        self.memory.allocate(PropertyRecord::RECORD_SIZE as u64);

        let mut record = PropertyRecord::new_record(prop);
        record.in_use = true;
        record.owner_is_node = owner.is_node();
        record.owner = owner.raw_id();
        record.key = key.0;
        record.next_prop = first;
        self.encode_value(prop, &mut record, value)?;

        if !is_null(first) {
            self.props.ensure_loaded(first, &self.stores.properties)?;
            self.props.after_mut(first)?.prev_prop = prop;
        }
        *self.props.create(prop) = record;
        self.set_owner_first_prop(owner, prop)?;
        Ok(())
    }

    pub fn change_property(
        &mut self,
        owner: Owner,
        key: KeyId,
        value: &PropertyValue,
    ) -> Result<()> {
        self.lock_owner(owner)?;
        let prop = self.find_property(owner, key)?.ok_or_else(|| {
            StoreError::Validation(format!("property {key} does not exist on {owner:?}"))
        })?;
        let mut record = self.props.after(prop)?.clone();
        self.free_value_blocks(prop, &record)?;
        record.inline.clear();
        record.value_kind = ValueKind::None;
        self.encode_value(prop, &mut record, value)?;
        *self.props.after_mut(prop)? = record;
        Ok(())
    }

    pub fn remove_property(&mut self, owner: Owner, key: KeyId) -> Result<()> {
        self.lock_owner(owner)?;
        let prop = self.find_property(owner, key)?.ok_or_else(|| {
            StoreError::Validation(format!("property {key} does not exist on {owner:?}"))
        })?;
        self.remove_property_record(owner, prop)
    }

    fn remove_property_record(&mut self, owner: Owner, prop: u64) -> Result<()> {
        let record = self.props.after(prop)?.clone();
        self.free_value_blocks(prop, &record)?;
        let (prev, next) = (record.prev_prop, record.next_prop);
        if is_null(prev) {
            self.set_owner_first_prop(owner, next)?;
        } else {
            self.props.ensure_loaded(prev, &self.stores.properties)?;
            self.props.after_mut(prev)?.next_prop = next;
        }
        if !is_null(next) {
            self.props.ensure_loaded(next, &self.stores.properties)?;
            self.props.after_mut(next)?.prev_prop = prev;
        }
        let staged = self.props.after_mut(prop)?;
        staged.in_use = false;
        staged.inline.clear();
        staged.value_kind = ValueKind::None;
        staged.next_prop = NULL_REFERENCE;
        staged.prev_prop = NULL_REFERENCE;
        Ok(())
    }

    fn delete_property_chain(&mut self, owner: Owner) -> Result<()> {
        loop {
            let first = self.owner_first_prop(owner)?;
            if is_null(first) {
                return Ok(());
            }
            self.props.ensure_loaded(first, &self.stores.properties)?;
            self.remove_property_record(owner, first)?;
        }
    }

    fn encode_value(
        &mut self,
        prop: u64,
        record: &mut PropertyRecord,
        value: &PropertyValue,
    ) -> Result<()> {
        record.inline.clear();
        match value {
            PropertyValue::Bool(v) => {
                record.value_kind = ValueKind::Bool;
                record.inline.push(u8::from(*v));
            }
            PropertyValue::Int(v) => {
                record.value_kind = ValueKind::Int;
                record.inline.extend_from_slice(&v.to_be_bytes());
            }
            PropertyValue::Float(v) => {
                record.value_kind = ValueKind::Float;
                record.inline.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            PropertyValue::Str(v) => {
                let bytes = v.as_bytes();
                if bytes.len() <= INLINE_VALUE_CAP {
                    record.value_kind = ValueKind::ShortStr;
                    record.inline.extend_from_slice(bytes);
                } else {
                    record.value_kind = ValueKind::LongStr;
                    let first = self.spill(prop, bytes, IdType::StringBlock)?;
                    record.set_spilled_reference(first, bytes.len() as u32);
                }
            }
            PropertyValue::Bytes(v) => {
                if v.len() <= INLINE_VALUE_CAP {
                    record.value_kind = ValueKind::ShortBytes;
                    record.inline.extend_from_slice(v);
                } else {
                    record.value_kind = ValueKind::LongBytes;
                    let first = self.spill(prop, v, IdType::ArrayBlock)?;
                    record.set_spilled_reference(first, v.len() as u32);
                }
            }
        }
        Ok(())
    }

    fn spill(&mut self, prop: u64, bytes: &[u8], id_type: IdType) -> Result<u64> {
        let chunks: Vec<&[u8]> = bytes.chunks(DYN_PAYLOAD).collect();
        let mut block_ids = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            block_ids.push(self.ids.allocate(id_type)?);
        }
        let blocks = self.prop_blocks.entry(prop).or_default();
        let (changes, registry): (&mut RecordChanges<DynRecord>, &mut SmallVec<[u64; 2]>) =
            match id_type {
                IdType::StringBlock => (&mut self.strings, &mut blocks.strings),
                IdType::ArrayBlock => (&mut self.arrays, &mut blocks.arrays),
                other => {
                    return Err(StoreError::Corruption(format!(
                        "{} is not a dynamic value store",
                        other.name()
                    )))
                }
            };
        for (index, chunk) in chunks.iter().enumerate() {
            self.memory.allocate(DynRecord::RECORD_SIZE as u64);
            let block = changes.create(block_ids[index]);
            block.in_use = true;
            block.payload = chunk.to_vec();
            block.next_block = block_ids
                .get(index + 1)
                .copied()
                .unwrap_or(NULL_REFERENCE);
            registry.push(block_ids[index]);
        }
        Ok(block_ids[0])
    }

    fn free_value_blocks(&mut self, prop: u64, record: &PropertyRecord) -> Result<()> {
        if !record.value_kind.spills() {
            return Ok(());
        }
        let (first, _len) = record.spilled_reference()?;
        let (store, changes, is_string) = match record.value_kind {
            ValueKind::LongStr => (&self.stores.strings, &mut self.strings, true),
            ValueKind::LongBytes => (&self.stores.arrays, &mut self.arrays, false),
            _ => return Ok(()),
        };
        let blocks = self.prop_blocks.entry(prop).or_default();
        let mut current = first;
        while !is_null(current) {
            changes.ensure_loaded(current, store)?;
            let block = changes.after_mut(current)?;
            let next = block.next_block;
            block.in_use = false;
            block.payload.clear();
            block.next_block = NULL_REFERENCE;
            if is_string {
                blocks.strings.push(current);
            } else {
                blocks.arrays.push(current);
            }
            current = next;
        }
        Ok(())
    }

    // ---- schema and tokens ----

    pub fn schema_create(&mut self, rule: &SchemaRule) -> Result<()> {
        self.locks.acquire_exclusive(Resource::Schema)?;
        let payload = rule.serialize()?;
        let record = self.schemas.create(rule.id.0);
        record.in_use = true;
        record.payload = payload;
        self.schema_rules.insert(rule.id.0, rule.clone());
        Ok(())
    }

    pub fn schema_drop(&mut self, id: SchemaId) -> Result<()> {
        self.locks.acquire_exclusive(Resource::Schema)?;
        self.schemas.ensure_loaded(id.0, &self.stores.schemas)?;
        let rule = SchemaRule::deserialize(&self.schemas.before(id.0)?.payload)?;
        self.schema_rules.insert(id.0, rule);
        let record = self.schemas.after_mut(id.0)?;
        record.in_use = false;
        record.payload.clear();
        Ok(())
    }

    pub fn token_create(&mut self, kind: TokenKind, id: u32, name: &str) -> Result<()> {
        if name.len() > MAX_TOKEN_NAME {
            return Err(StoreError::Validation(format!(
                "token name longer than {MAX_TOKEN_NAME} bytes: {name:?}"
            )));
        }
        let record = self.tokens.create(id as u64);
        record.in_use = true;
        record.kind = kind;
        record.name = name.to_owned();
        Ok(())
    }

    // ---- validation support ----

    pub fn deleted_node_ids(&self) -> Vec<u64> {
        self.nodes
            .changes
            .iter()
            .filter(|(_, change)| change.before.in_use && !change.after.in_use)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn created_schema_rules(&self) -> Vec<&SchemaRule> {
        self.schemas
            .changes
            .values()
            .filter(|change| !change.before.in_use && change.after.in_use)
            .filter_map(|change| self.schema_rules.get(&change.after.id))
            .collect()
    }

    pub fn token_staged(&self, kind: TokenKind, id: u32) -> bool {
        self.tokens
            .changes
            .get(&(id as u64))
            .map(|change| change.after.in_use && change.after.kind == kind)
            .unwrap_or(false)
    }

    /// Whether the node still references any relationship in its after
    /// state. For a dense node every group chain head is consulted.
    pub fn node_has_relationships_after(&mut self, node: u64) -> Result<bool> {
        self.nodes.ensure_loaded(node, &self.stores.nodes)?;
        let record = self.nodes.after(node)?;
        if !record.dense {
            return Ok(!is_null(record.next_rel));
        }
        let mut current = record.next_rel;
        while !is_null(current) {
            self.groups.ensure_loaded(current, &self.stores.groups)?;
            let group = self.groups.after(current)?;
            if !is_null(group.first_out) || !is_null(group.first_in) || !is_null(group.first_loop)
            {
                return Ok(true);
            }
            current = group.next_group;
        }
        Ok(false)
    }

    // ---- extraction ----

    /// Drains the staged state into the fixed command order: schema, tokens,
    /// nodes, relationships, groups, properties, counts, degrees. Ascending
    /// id within each kind.
    pub fn extract_commands(
        &mut self,
        out: &mut Vec<Command>,
        counts: &CountsDelta,
    ) -> Result<()> {
        for pair in self.schemas.changed_pairs() {
            let rule = self
                .schema_rules
                .get(&pair.id())
                .cloned()
                .ok_or_else(|| {
                    StoreError::Corruption(format!(
                        "schema record {} staged without a rule",
                        pair.id()
                    ))
                })?;
            out.push(Command::Schema { pair, rule });
        }
        out.extend(self.tokens.changed_pairs().map(Command::Token));
        out.extend(self.nodes.changed_pairs().map(Command::Node));
        out.extend(self.rels.changed_pairs().map(Command::Relationship));
        out.extend(self.groups.changed_pairs().map(Command::Group));

        let prop_ids: Vec<u64> = self
            .props
            .changes
            .iter()
            .filter(|(_, change)| change.before != change.after)
            .map(|(&id, _)| id)
            .collect();
        for prop in prop_ids {
            let pair = self
                .props
                .take_pair(prop)
                .ok_or_else(|| StoreError::Corruption(format!("property {prop} vanished")))?;
            let mut string_blocks = Vec::new();
            let mut array_blocks = Vec::new();
            if let Some(blocks) = self.prop_blocks.remove(&prop) {
                let mut string_ids: Vec<u64> = blocks.strings.into_iter().collect();
                string_ids.sort_unstable();
                string_ids.dedup();
                for id in string_ids {
                    if let Some(block) = self.strings.take_pair(id) {
                        string_blocks.push(block);
                    }
                }
                let mut array_ids: Vec<u64> = blocks.arrays.into_iter().collect();
                array_ids.sort_unstable();
                array_ids.dedup();
                for id in array_ids {
                    if let Some(block) = self.arrays.take_pair(id) {
                        array_blocks.push(block);
                    }
                }
            }
            out.push(Command::Property {
                pair,
                string_blocks,
                array_blocks,
            });
        }

        for (key, delta) in counts.entries() {
            out.push(Command::Counts { key, delta });
        }
        for (&(group, direction), &delta) in &self.degrees {
            out.push(Command::Degrees {
                group,
                direction,
                delta,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lock::TrackingLocks;
    use crate::types::KernelVersion;

    struct Fixture {
        _dir: tempfile::TempDir,
        stores: Stores,
        ids: IdGenerators,
        locks: TrackingLocks,
        memory: MemoryTracker,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = tempfile::tempdir().expect("temp dir");
            let config = Config::default();
            let stores =
                Stores::open(dir.path(), &config, KernelVersion::LATEST).expect("open stores");
            let ids = IdGenerators::open(dir.path()).expect("open generators");
            Fixture {
                _dir: dir,
                stores,
                ids,
                locks: TrackingLocks::new(),
                memory: MemoryTracker::new(),
            }
        }

        fn state(&self, threshold: u32) -> TransactionRecordState<'_> {
            TransactionRecordState::new(
                &self.stores,
                &self.ids,
                &self.locks,
                &self.memory,
                threshold,
                false,
            )
        }
    }

    #[test]
    fn create_node_with_label_and_property_extracts_ordered_commands() -> Result<()> {
        let fixture = Fixture::new();
        let mut state = fixture.state(50);
        let node = NodeId(fixture.ids.allocate(IdType::Node)?);
        state.node_create(node)?;
        state.add_label(node, LabelId(1))?;
        state.add_property(Owner::Node(node), KeyId(0), &PropertyValue::Str("x".into()))?;

        let mut commands = Vec::new();
        state.extract_commands(&mut commands, &CountsDelta::new())?;
        assert_eq!(commands.len(), 2);
        match (&commands[0], &commands[1]) {
            (Command::Node(node_pair), Command::Property { pair, .. }) => {
                assert!(node_pair.creates());
                assert_eq!(node_pair.after.labels.as_slice(), &[LabelId(1)]);
                assert!(pair.creates());
                assert_eq!(pair.after.owner, node.0);
            }
            other => panic!("unexpected command shapes: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn relationship_chain_degrees_accumulate_in_head() -> Result<()> {
        let fixture = Fixture::new();
        let mut state = fixture.state(50);
        let a = NodeId(fixture.ids.allocate(IdType::Node)?);
        let b = NodeId(fixture.ids.allocate(IdType::Node)?);
        state.node_create(a)?;
        state.node_create(b)?;
        for _ in 0..3 {
            let rel = RelId(fixture.ids.allocate(IdType::Relationship)?);
            state.rel_create(rel, RelTypeId(0), a, b)?;
        }
        let head = state.nodes.after(a.0)?.next_rel;
        assert_eq!(
            chain_degree_from_prev(state.rels.after(head)?.chain_prev(a.0)),
            3
        );
        Ok(())
    }

    #[test]
    fn dense_transition_moves_chain_into_groups() -> Result<()> {
        let fixture = Fixture::new();
        let mut state = fixture.state(4);
        let hub = NodeId(fixture.ids.allocate(IdType::Node)?);
        state.node_create(hub)?;
        let mut rels = Vec::new();
        for _ in 0..4 {
            let other = NodeId(fixture.ids.allocate(IdType::Node)?);
            state.node_create(other)?;
            let rel = RelId(fixture.ids.allocate(IdType::Relationship)?);
            state.rel_create(rel, RelTypeId(7), hub, other)?;
            rels.push(rel);
        }
        let hub_record = state.nodes.after(hub.0)?;
        assert!(hub_record.dense);
        let group = state.groups.after(hub_record.next_rel)?.clone();
        assert_eq!(group.rel_type, 7);
        assert!(!is_null(group.first_out));
        assert!(is_null(group.first_in));
        // All four relationships reachable through the group chain.
        let mut seen = 0;
        let mut current = group.first_out;
        while !is_null(current) {
            seen += 1;
            current = state.rels.after(current)?.chain_next(hub.0);
        }
        assert_eq!(seen, 4);
        Ok(())
    }

    #[test]
    fn long_values_spill_and_free() -> Result<()> {
        let fixture = Fixture::new();
        let mut state = fixture.state(50);
        let node = NodeId(fixture.ids.allocate(IdType::Node)?);
        state.node_create(node)?;
        let long = "x".repeat(DYN_PAYLOAD * 2 + 5);
        state.add_property(Owner::Node(node), KeyId(3), &PropertyValue::Str(long.clone()))?;

        let mut commands = Vec::new();
        state.extract_commands(&mut commands, &CountsDelta::new())?;
        let blocks = commands
            .iter()
            .find_map(|command| match command {
                Command::Property { string_blocks, .. } => Some(string_blocks),
                _ => None,
            })
            .expect("property command present");
        assert_eq!(blocks.len(), 3);
        let total: usize = blocks.iter().map(|pair| pair.after.payload.len()).sum();
        assert_eq!(total, long.len());
        Ok(())
    }

    #[test]
    fn deleting_node_with_chain_leaves_reference_for_validator() -> Result<()> {
        let fixture = Fixture::new();
        let mut state = fixture.state(50);
        let a = NodeId(fixture.ids.allocate(IdType::Node)?);
        let b = NodeId(fixture.ids.allocate(IdType::Node)?);
        state.node_create(a)?;
        state.node_create(b)?;
        let rel = RelId(fixture.ids.allocate(IdType::Relationship)?);
        state.rel_create(rel, RelTypeId(0), a, b)?;
        state.node_delete(a)?;
        assert!(state.node_has_relationships_after(a.0)?);

        let mut state = fixture.state(50);
        let c = NodeId(fixture.ids.allocate(IdType::Node)?);
        state.node_create(c)?;
        state.node_delete(c)?;
        assert!(!state.node_has_relationships_after(c.0)?);
        Ok(())
    }
}
