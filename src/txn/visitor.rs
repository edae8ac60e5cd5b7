//! The tx-state visitor seam. The kernel's logical transaction state is
//! visited in a fixed order; the engine stacks its own visitors (record
//! state, counting) and lets the caller wrap an extra decorator around them.

use std::collections::BTreeMap;

use crate::counts::{CountsDelta, CountsKey, ANY};
use crate::error::Result;
use crate::reader::StorageReader;
use crate::schema::SchemaRule;
use crate::txn::state::TransactionRecordState;
use crate::types::{
    KeyId, LabelId, NodeId, Owner, PropertyValue, RelId, RelTypeId, SchemaId, TokenKind,
};

pub trait TxStateVisitor {
    fn visit_created_token(&mut self, _kind: TokenKind, _id: u32, _name: &str) -> Result<()> {
        Ok(())
    }
    fn visit_created_schema_rule(&mut self, _rule: &SchemaRule) -> Result<()> {
        Ok(())
    }
    fn visit_dropped_schema_rule(&mut self, _id: SchemaId) -> Result<()> {
        Ok(())
    }
    fn visit_created_node(&mut self, _node: NodeId) -> Result<()> {
        Ok(())
    }
    fn visit_label_changes(
        &mut self,
        _node: NodeId,
        _added: &[LabelId],
        _removed: &[LabelId],
    ) -> Result<()> {
        Ok(())
    }
    fn visit_created_relationship(
        &mut self,
        _rel: RelId,
        _rel_type: RelTypeId,
        _src: NodeId,
        _dst: NodeId,
    ) -> Result<()> {
        Ok(())
    }
    fn visit_deleted_relationship(&mut self, _rel: RelId) -> Result<()> {
        Ok(())
    }
    fn visit_added_property(
        &mut self,
        _owner: Owner,
        _key: KeyId,
        _value: &PropertyValue,
    ) -> Result<()> {
        Ok(())
    }
    fn visit_changed_property(
        &mut self,
        _owner: Owner,
        _key: KeyId,
        _value: &PropertyValue,
    ) -> Result<()> {
        Ok(())
    }
    fn visit_removed_property(&mut self, _owner: Owner, _key: KeyId) -> Result<()> {
        Ok(())
    }
    fn visit_deleted_node(&mut self, _node: NodeId) -> Result<()> {
        Ok(())
    }
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Logical transaction state as handed down by the kernel: a value set of
/// graph mutations, iterable in a fixed visit order.
#[derive(Default, Debug)]
pub struct TransactionState {
    created_tokens: Vec<(TokenKind, u32, String)>,
    created_schema: Vec<SchemaRule>,
    dropped_schema: Vec<SchemaId>,
    created_nodes: Vec<NodeId>,
    labels_added: BTreeMap<u64, Vec<LabelId>>,
    labels_removed: BTreeMap<u64, Vec<LabelId>>,
    created_rels: Vec<(RelId, RelTypeId, NodeId, NodeId)>,
    deleted_rels: Vec<RelId>,
    props_added: Vec<(Owner, KeyId, PropertyValue)>,
    props_changed: Vec<(Owner, KeyId, PropertyValue)>,
    props_removed: Vec<(Owner, KeyId)>,
    deleted_nodes: Vec<NodeId>,
}

impl TransactionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.created_tokens.is_empty()
            && self.created_schema.is_empty()
            && self.dropped_schema.is_empty()
            && self.created_nodes.is_empty()
            && self.labels_added.is_empty()
            && self.labels_removed.is_empty()
            && self.created_rels.is_empty()
            && self.deleted_rels.is_empty()
            && self.props_added.is_empty()
            && self.props_changed.is_empty()
            && self.props_removed.is_empty()
            && self.deleted_nodes.is_empty()
    }

    pub fn create_token(&mut self, kind: TokenKind, id: u32, name: impl Into<String>) {
        self.created_tokens.push((kind, id, name.into()));
    }

    pub fn create_schema_rule(&mut self, rule: SchemaRule) {
        self.created_schema.push(rule);
    }

    pub fn drop_schema_rule(&mut self, id: SchemaId) {
        self.dropped_schema.push(id);
    }

    pub fn create_node(&mut self, node: NodeId) {
        self.created_nodes.push(node);
    }

    pub fn delete_node(&mut self, node: NodeId) {
        self.deleted_nodes.push(node);
    }

    pub fn add_label(&mut self, node: NodeId, label: LabelId) {
        self.labels_added.entry(node.0).or_default().push(label);
    }

    pub fn remove_label(&mut self, node: NodeId, label: LabelId) {
        self.labels_removed.entry(node.0).or_default().push(label);
    }

    pub fn create_relationship(
        &mut self,
        rel: RelId,
        rel_type: RelTypeId,
        src: NodeId,
        dst: NodeId,
    ) {
        self.created_rels.push((rel, rel_type, src, dst));
    }

    pub fn delete_relationship(&mut self, rel: RelId) {
        self.deleted_rels.push(rel);
    }

    pub fn add_property(&mut self, owner: Owner, key: KeyId, value: PropertyValue) {
        self.props_added.push((owner, key, value));
    }

    pub fn change_property(&mut self, owner: Owner, key: KeyId, value: PropertyValue) {
        self.props_changed.push((owner, key, value));
    }

    pub fn remove_property(&mut self, owner: Owner, key: KeyId) {
        self.props_removed.push((owner, key));
    }

    pub fn created_relationships(&self) -> &[(RelId, RelTypeId, NodeId, NodeId)] {
        &self.created_rels
    }

    pub fn deleted_relationships(&self) -> &[RelId] {
        &self.deleted_rels
    }

    pub fn labels_added_to(&self, node: NodeId) -> &[LabelId] {
        self.labels_added
            .get(&node.0)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn labels_removed_from(&self, node: NodeId) -> &[LabelId] {
        self.labels_removed
            .get(&node.0)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Visits every change in the fixed order: tokens, schema, nodes, label
    /// changes, created relationships, deleted relationships, properties,
    /// deleted nodes.
    pub fn accept(&self, visitor: &mut dyn TxStateVisitor) -> Result<()> {
        for (kind, id, name) in &self.created_tokens {
            visitor.visit_created_token(*kind, *id, name)?;
        }
        for rule in &self.created_schema {
            visitor.visit_created_schema_rule(rule)?;
        }
        for &id in &self.dropped_schema {
            visitor.visit_dropped_schema_rule(id)?;
        }
        for &node in &self.created_nodes {
            visitor.visit_created_node(node)?;
        }
        let mut label_nodes: Vec<u64> = self
            .labels_added
            .keys()
            .chain(self.labels_removed.keys())
            .copied()
            .collect();
        label_nodes.sort_unstable();
        label_nodes.dedup();
        for node in label_nodes {
            let added = self
                .labels_added
                .get(&node)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let removed = self
                .labels_removed
                .get(&node)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            visitor.visit_label_changes(NodeId(node), added, removed)?;
        }
        for &(rel, rel_type, src, dst) in &self.created_rels {
            visitor.visit_created_relationship(rel, rel_type, src, dst)?;
        }
        for &rel in &self.deleted_rels {
            visitor.visit_deleted_relationship(rel)?;
        }
        for (owner, key, value) in &self.props_added {
            visitor.visit_added_property(*owner, *key, value)?;
        }
        for (owner, key, value) in &self.props_changed {
            visitor.visit_changed_property(*owner, *key, value)?;
        }
        for &(owner, key) in &self.props_removed {
            visitor.visit_removed_property(owner, key)?;
        }
        for &node in &self.deleted_nodes {
            visitor.visit_deleted_node(node)?;
        }
        visitor.close()
    }
}

/// Translates visited logical changes into record deltas in the transaction
/// record state.
pub struct RecordStateVisitor<'a, 'b> {
    state: &'b mut TransactionRecordState<'a>,
}

impl<'a, 'b> RecordStateVisitor<'a, 'b> {
    pub fn new(state: &'b mut TransactionRecordState<'a>) -> Self {
        Self { state }
    }
}

impl TxStateVisitor for RecordStateVisitor<'_, '_> {
    fn visit_created_token(&mut self, kind: TokenKind, id: u32, name: &str) -> Result<()> {
        self.state.token_create(kind, id, name)
    }

    fn visit_created_schema_rule(&mut self, rule: &SchemaRule) -> Result<()> {
        self.state.schema_create(rule)
    }

    fn visit_dropped_schema_rule(&mut self, id: SchemaId) -> Result<()> {
        self.state.schema_drop(id)
    }

    fn visit_created_node(&mut self, node: NodeId) -> Result<()> {
        self.state.node_create(node)
    }

    fn visit_label_changes(
        &mut self,
        node: NodeId,
        added: &[LabelId],
        removed: &[LabelId],
    ) -> Result<()> {
        for &label in added {
            self.state.add_label(node, label)?;
        }
        for &label in removed {
            self.state.remove_label(node, label)?;
        }
        Ok(())
    }

    fn visit_created_relationship(
        &mut self,
        rel: RelId,
        rel_type: RelTypeId,
        src: NodeId,
        dst: NodeId,
    ) -> Result<()> {
        self.state.rel_create(rel, rel_type, src, dst)
    }

    fn visit_deleted_relationship(&mut self, rel: RelId) -> Result<()> {
        self.state.rel_delete(rel)
    }

    fn visit_added_property(
        &mut self,
        owner: Owner,
        key: KeyId,
        value: &PropertyValue,
    ) -> Result<()> {
        self.state.add_property(owner, key, value)
    }

    fn visit_changed_property(
        &mut self,
        owner: Owner,
        key: KeyId,
        value: &PropertyValue,
    ) -> Result<()> {
        self.state.change_property(owner, key, value)
    }

    fn visit_removed_property(&mut self, owner: Owner, key: KeyId) -> Result<()> {
        self.state.remove_property(owner, key)
    }

    fn visit_deleted_node(&mut self, node: NodeId) -> Result<()> {
        self.state.node_delete(node)
    }
}

/// Wraps another visitor and accumulates counts-store deltas from the same
/// visit stream. Label-change adjustments consult only pre-transaction
/// degrees; relationship create/delete use post-transaction label sets, so
/// the two never double-count the same pair.
pub struct CountingVisitor<'r, V: TxStateVisitor> {
    inner: V,
    reader: &'r StorageReader,
    tx_state: &'r TransactionState,
    counts: CountsDelta,
}

impl<'r, V: TxStateVisitor> CountingVisitor<'r, V> {
    pub fn new(inner: V, reader: &'r StorageReader, tx_state: &'r TransactionState) -> Self {
        Self {
            inner,
            reader,
            tx_state,
            counts: CountsDelta::new(),
        }
    }

    pub fn into_counts(self) -> CountsDelta {
        self.counts
    }

    /// Labels of a node as they stand after this transaction.
    fn labels_after(&self, node: NodeId) -> Result<Vec<LabelId>> {
        let mut labels = self.reader.node_labels(node)?;
        for &label in self.tx_state.labels_added_to(node) {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        let removed = self.tx_state.labels_removed_from(node);
        labels.retain(|label| !removed.contains(label));
        Ok(labels)
    }

    fn count_relationship(
        &mut self,
        rel_type: RelTypeId,
        src: NodeId,
        dst: NodeId,
        delta: i64,
    ) -> Result<()> {
        self.counts
            .increment(CountsKey::relationship(ANY, ANY, ANY), delta);
        self.counts
            .increment(CountsKey::relationship(ANY, rel_type.0 as i64, ANY), delta);
        for label in self.labels_after(src)? {
            self.counts.increment(
                CountsKey::relationship(label.0 as i64, rel_type.0 as i64, ANY),
                delta,
            );
        }
        for label in self.labels_after(dst)? {
            self.counts.increment(
                CountsKey::relationship(ANY, rel_type.0 as i64, label.0 as i64),
                delta,
            );
        }
        Ok(())
    }
}

impl<V: TxStateVisitor> TxStateVisitor for CountingVisitor<'_, V> {
    fn visit_created_token(&mut self, kind: TokenKind, id: u32, name: &str) -> Result<()> {
        self.inner.visit_created_token(kind, id, name)
    }

    fn visit_created_schema_rule(&mut self, rule: &SchemaRule) -> Result<()> {
        self.inner.visit_created_schema_rule(rule)
    }

    fn visit_dropped_schema_rule(&mut self, id: SchemaId) -> Result<()> {
        self.inner.visit_dropped_schema_rule(id)
    }

    fn visit_created_node(&mut self, node: NodeId) -> Result<()> {
        self.counts.increment(CountsKey::node(ANY), 1);
        self.inner.visit_created_node(node)
    }

    fn visit_label_changes(
        &mut self,
        node: NodeId,
        added: &[LabelId],
        removed: &[LabelId],
    ) -> Result<()> {
        // Pre-transaction degrees only; created and deleted relationships
        // count themselves against the post-transaction label set.
        let degrees = self.reader.node_degrees(node)?;
        for &label in added {
            self.counts.increment(CountsKey::node(label.0 as i64), 1);
            for (&rel_type, &(out, incoming)) in &degrees {
                self.counts.increment(
                    CountsKey::relationship(label.0 as i64, rel_type as i64, ANY),
                    out,
                );
                self.counts.increment(
                    CountsKey::relationship(ANY, rel_type as i64, label.0 as i64),
                    incoming,
                );
            }
        }
        for &label in removed {
            self.counts.increment(CountsKey::node(label.0 as i64), -1);
            for (&rel_type, &(out, incoming)) in &degrees {
                self.counts.increment(
                    CountsKey::relationship(label.0 as i64, rel_type as i64, ANY),
                    -out,
                );
                self.counts.increment(
                    CountsKey::relationship(ANY, rel_type as i64, label.0 as i64),
                    -incoming,
                );
            }
        }
        self.inner.visit_label_changes(node, added, removed)
    }

    fn visit_created_relationship(
        &mut self,
        rel: RelId,
        rel_type: RelTypeId,
        src: NodeId,
        dst: NodeId,
    ) -> Result<()> {
        self.count_relationship(rel_type, src, dst, 1)?;
        self.inner.visit_created_relationship(rel, rel_type, src, dst)
    }

    fn visit_deleted_relationship(&mut self, rel: RelId) -> Result<()> {
        let record = self.reader.relationship_record(rel)?.ok_or_else(|| {
            crate::error::StoreError::Validation(format!(
                "relationship {rel} does not exist in the store"
            ))
        })?;
        self.count_relationship(
            RelTypeId(record.rel_type),
            NodeId(record.src),
            NodeId(record.dst),
            -1,
        )?;
        self.inner.visit_deleted_relationship(rel)
    }

    fn visit_added_property(
        &mut self,
        owner: Owner,
        key: KeyId,
        value: &PropertyValue,
    ) -> Result<()> {
        self.inner.visit_added_property(owner, key, value)
    }

    fn visit_changed_property(
        &mut self,
        owner: Owner,
        key: KeyId,
        value: &PropertyValue,
    ) -> Result<()> {
        self.inner.visit_changed_property(owner, key, value)
    }

    fn visit_removed_property(&mut self, owner: Owner, key: KeyId) -> Result<()> {
        self.inner.visit_removed_property(owner, key)
    }

    fn visit_deleted_node(&mut self, node: NodeId) -> Result<()> {
        self.counts.increment(CountsKey::node(ANY), -1);
        for label in self.reader.node_labels(node)? {
            self.counts.increment(CountsKey::node(label.0 as i64), -1);
        }
        self.inner.visit_deleted_node(node)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
