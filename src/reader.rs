//! Read-only view over the record stores, counts, schema cache, and token
//! registry. Cheap to create; every engine-level read goes through one.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::counts::{CountsKey, CountsStore, GroupDegreesStore};
use crate::error::{Result, StoreError};
use crate::schema::{SchemaCache, SchemaRule, TokenRegistry};
use crate::store::record::{
    chain_degree_from_prev, NodeRecord, PropertyRecord, RecordLoad, RelationshipRecord, ValueKind,
};
use crate::store::Stores;
use crate::types::{is_null, KeyId, LabelId, NodeId, Owner, PropertyValue, RelId, SchemaId};

#[derive(Clone)]
pub struct StorageReader {
    stores: Arc<Stores>,
    counts: Arc<CountsStore>,
    degrees: Arc<GroupDegreesStore>,
    schema_cache: Arc<SchemaCache>,
    tokens: Arc<TokenRegistry>,
}

impl StorageReader {
    pub(crate) fn new(
        stores: Arc<Stores>,
        counts: Arc<CountsStore>,
        degrees: Arc<GroupDegreesStore>,
        schema_cache: Arc<SchemaCache>,
        tokens: Arc<TokenRegistry>,
    ) -> Self {
        Self {
            stores,
            counts,
            degrees,
            schema_cache,
            tokens,
        }
    }

    pub fn node_record(&self, node: NodeId) -> Result<Option<NodeRecord>> {
        let record = self.stores.nodes.read(node.0, RecordLoad::Check)?;
        Ok(record.in_use.then_some(record))
    }

    pub fn node_exists(&self, node: NodeId) -> Result<bool> {
        Ok(self.node_record(node)?.is_some())
    }

    pub fn node_labels(&self, node: NodeId) -> Result<Vec<LabelId>> {
        Ok(self
            .node_record(node)?
            .map(|record| record.labels.to_vec())
            .unwrap_or_default())
    }

    pub fn relationship_record(&self, rel: RelId) -> Result<Option<RelationshipRecord>> {
        let record = self.stores.relationships.read(rel.0, RecordLoad::Check)?;
        Ok(record.in_use.then_some(record))
    }

    /// Per-type `(outgoing, incoming)` degrees of a node; loops count on
    /// both sides. Dense nodes read group chains, honouring external
    /// degrees.
    pub fn node_degrees(&self, node: NodeId) -> Result<BTreeMap<u32, (i64, i64)>> {
        let mut degrees = BTreeMap::new();
        let Some(record) = self.node_record(node)? else {
            return Ok(degrees);
        };
        if !record.dense {
            let mut current = record.next_rel;
            while !is_null(current) {
                let rel = self
                    .stores
                    .relationships
                    .read(current, RecordLoad::Normal)?;
                let slot = degrees.entry(rel.rel_type).or_insert((0, 0));
                if rel.is_loop() {
                    slot.0 += 1;
                    slot.1 += 1;
                } else if rel.src == node.0 {
                    slot.0 += 1;
                } else {
                    slot.1 += 1;
                }
                current = rel.chain_next(node.0);
            }
            return Ok(degrees);
        }
        let mut group_id = record.next_rel;
        while !is_null(group_id) {
            let group = self.stores.groups.read(group_id, RecordLoad::Normal)?;
            let slot = degrees.entry(group.rel_type).or_insert((0, 0));
            let out = self.chain_degree(
                node.0,
                group.first_out,
                group.external_degrees_out,
                group_id,
                crate::types::Direction::Outgoing,
            )?;
            let incoming = self.chain_degree(
                node.0,
                group.first_in,
                group.external_degrees_in,
                group_id,
                crate::types::Direction::Incoming,
            )?;
            let loops = self.chain_degree(
                node.0,
                group.first_loop,
                group.external_degrees_loop,
                group_id,
                crate::types::Direction::Loop,
            )?;
            slot.0 += out + loops;
            slot.1 += incoming + loops;
            group_id = group.next_group;
        }
        Ok(degrees)
    }

    fn chain_degree(
        &self,
        node: u64,
        first: u64,
        external: bool,
        group: u64,
        direction: crate::types::Direction,
    ) -> Result<i64> {
        if external {
            return Ok(self.degrees.degree(group, direction));
        }
        if is_null(first) {
            return Ok(0);
        }
        let head = self.stores.relationships.read(first, RecordLoad::Normal)?;
        Ok(chain_degree_from_prev(head.chain_prev(node)) as i64)
    }

    pub fn total_degree(&self, node: NodeId) -> Result<i64> {
        let degrees = self.node_degrees(node)?;
        let mut total = 0;
        for (_, (out, incoming)) in degrees {
            total += out + incoming;
        }
        Ok(total)
    }

    fn first_property(&self, owner: Owner) -> Result<u64> {
        match owner {
            Owner::Node(node) => Ok(self
                .node_record(node)?
                .map(|record| record.next_prop)
                .unwrap_or(crate::types::NULL_REFERENCE)),
            Owner::Relationship(rel) => Ok(self
                .relationship_record(rel)?
                .map(|record| record.next_prop)
                .unwrap_or(crate::types::NULL_REFERENCE)),
        }
    }

    pub fn property(&self, owner: Owner, key: KeyId) -> Result<Option<PropertyValue>> {
        let mut current = self.first_property(owner)?;
        while !is_null(current) {
            let record = self.stores.properties.read(current, RecordLoad::Normal)?;
            if record.key == key.0 {
                return Ok(Some(self.read_value(&record)?));
            }
            current = record.next_prop;
        }
        Ok(None)
    }

    pub fn properties(&self, owner: Owner) -> Result<Vec<(KeyId, PropertyValue)>> {
        let mut out = Vec::new();
        let mut current = self.first_property(owner)?;
        while !is_null(current) {
            let record = self.stores.properties.read(current, RecordLoad::Normal)?;
            out.push((KeyId(record.key), self.read_value(&record)?));
            current = record.next_prop;
        }
        Ok(out)
    }

    pub fn read_value(&self, record: &PropertyRecord) -> Result<PropertyValue> {
        decode_property_value(record, |kind, first, len| match kind {
            ValueKind::LongStr => self.stores.strings.read_chain(first, len),
            _ => self.stores.arrays.read_chain(first, len),
        })
    }

    pub fn count(&self, key: CountsKey) -> i64 {
        self.counts.get(key)
    }

    pub fn schema_rule(&self, id: SchemaId) -> Option<SchemaRule> {
        self.schema_cache.get(id)
    }

    pub fn schema_rules(&self) -> Vec<SchemaRule> {
        self.schema_cache.all()
    }

    pub fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }
}

/// Decodes a property record's value, pulling spilled bytes through
/// `read_spilled(kind, first_block, total_len)`.
pub fn decode_property_value(
    record: &PropertyRecord,
    read_spilled: impl FnOnce(ValueKind, u64, u32) -> Result<Vec<u8>>,
) -> Result<PropertyValue> {
    match record.value_kind {
        ValueKind::Bool => Ok(PropertyValue::Bool(
            record.inline.first().copied().unwrap_or(0) != 0,
        )),
        ValueKind::Int => {
            let mut word = [0u8; 8];
            if record.inline.len() != 8 {
                return Err(StoreError::Corruption(format!(
                    "property {} int payload malformed",
                    record.id
                )));
            }
            word.copy_from_slice(&record.inline);
            Ok(PropertyValue::Int(i64::from_be_bytes(word)))
        }
        ValueKind::Float => {
            let mut word = [0u8; 8];
            if record.inline.len() != 8 {
                return Err(StoreError::Corruption(format!(
                    "property {} float payload malformed",
                    record.id
                )));
            }
            word.copy_from_slice(&record.inline);
            Ok(PropertyValue::Float(f64::from_bits(u64::from_be_bytes(
                word,
            ))))
        }
        ValueKind::ShortStr => Ok(PropertyValue::Str(
            std::str::from_utf8(&record.inline)
                .map_err(|_| {
                    StoreError::Corruption(format!("property {} string not UTF-8", record.id))
                })?
                .to_owned(),
        )),
        ValueKind::ShortBytes => Ok(PropertyValue::Bytes(record.inline.to_vec())),
        ValueKind::LongStr => {
            let (first, len) = record.spilled_reference()?;
            let bytes = read_spilled(ValueKind::LongStr, first, len)?;
            Ok(PropertyValue::Str(String::from_utf8(bytes).map_err(
                |_| StoreError::Corruption(format!("property {} string not UTF-8", record.id)),
            )?))
        }
        ValueKind::LongBytes => {
            let (first, len) = record.spilled_reference()?;
            Ok(PropertyValue::Bytes(read_spilled(
                ValueKind::LongBytes,
                first,
                len,
            )?))
        }
        ValueKind::None => Err(StoreError::Corruption(format!(
            "property {} has no value",
            record.id
        ))),
    }
}
