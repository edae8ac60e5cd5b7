//! Schema rules, the in-memory schema cache, and the token registry. The
//! cache mirrors the durable schema store between transactions; only the
//! applier chain mutates it, under its write lock.

use std::collections::HashMap;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::{Result, StoreError};
use crate::store::record::SCHEMA_PAYLOAD_CAP;
use crate::types::{KeyId, LabelId, RelTypeId, SchemaId, TokenKind};

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum RuleKind {
    Index = 0,
    UniquenessConstraint = 1,
    ExistenceConstraint = 2,
}

impl RuleKind {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Index),
            1 => Ok(Self::UniquenessConstraint),
            2 => Ok(Self::ExistenceConstraint),
            other => Err(StoreError::Corruption(format!(
                "unknown schema rule kind: {other}"
            ))),
        }
    }

    pub fn is_constraint(self) -> bool {
        !matches!(self, Self::Index)
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum EntityKind {
    Node = 0,
    Relationship = 1,
}

impl EntityKind {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Node),
            1 => Ok(Self::Relationship),
            other => Err(StoreError::Corruption(format!(
                "unknown schema entity kind: {other}"
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SchemaRule {
    pub id: SchemaId,
    pub kind: RuleKind,
    pub entity: EntityKind,
    /// Label id for node rules, relationship type id for relationship rules.
    pub entity_token: u32,
    pub keys: SmallVec<[KeyId; 2]>,
}

const RULE_FORMAT: u8 = 1;

impl SchemaRule {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16 + self.keys.len() * 4);
        out.push(RULE_FORMAT);
        out.push(self.kind as u8);
        out.push(self.entity as u8);
        out.extend_from_slice(&self.id.0.to_be_bytes());
        out.extend_from_slice(&self.entity_token.to_be_bytes());
        out.push(self.keys.len() as u8);
        for key in &self.keys {
            out.extend_from_slice(&key.0.to_be_bytes());
        }
        if out.len() > SCHEMA_PAYLOAD_CAP {
            return Err(StoreError::Validation(format!(
                "schema rule {} does not fit a schema record",
                self.id.0
            )));
        }
        Ok(out)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(StoreError::Corruption("schema rule truncated".into()));
        }
        if buf[0] != RULE_FORMAT {
            return Err(StoreError::FormatMismatch(format!(
                "schema rule format {}",
                buf[0]
            )));
        }
        let kind = RuleKind::from_byte(buf[1])?;
        let entity = EntityKind::from_byte(buf[2])?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[3..11]);
        let id = SchemaId(u64::from_be_bytes(word));
        let mut half = [0u8; 4];
        half.copy_from_slice(&buf[11..15]);
        let entity_token = u32::from_be_bytes(half);
        let key_count = buf[15] as usize;
        if buf.len() < 16 + key_count * 4 {
            return Err(StoreError::Corruption("schema rule keys truncated".into()));
        }
        let mut keys = SmallVec::new();
        for slot in 0..key_count {
            half.copy_from_slice(&buf[16 + slot * 4..20 + slot * 4]);
            keys.push(KeyId(u32::from_be_bytes(half)));
        }
        Ok(Self {
            id,
            kind,
            entity,
            entity_token,
            keys,
        })
    }
}

#[derive(Default, Debug)]
struct CacheInner {
    by_id: HashMap<SchemaId, SchemaRule>,
    by_label: HashMap<LabelId, Vec<SchemaId>>,
    by_rel_type: HashMap<RelTypeId, Vec<SchemaId>>,
    by_key: HashMap<KeyId, Vec<SchemaId>>,
    by_constraint_kind: HashMap<RuleKind, Vec<SchemaId>>,
}

impl CacheInner {
    fn index(&mut self, rule: &SchemaRule) {
        match rule.entity {
            EntityKind::Node => self
                .by_label
                .entry(LabelId(rule.entity_token))
                .or_default()
                .push(rule.id),
            EntityKind::Relationship => self
                .by_rel_type
                .entry(RelTypeId(rule.entity_token))
                .or_default()
                .push(rule.id),
        }
        for &key in &rule.keys {
            self.by_key.entry(key).or_default().push(rule.id);
        }
        if rule.kind.is_constraint() {
            self.by_constraint_kind
                .entry(rule.kind)
                .or_default()
                .push(rule.id);
        }
    }

    fn unindex(&mut self, rule: &SchemaRule) {
        let strip = |ids: &mut Vec<SchemaId>| ids.retain(|&id| id != rule.id);
        match rule.entity {
            EntityKind::Node => {
                if let Some(ids) = self.by_label.get_mut(&LabelId(rule.entity_token)) {
                    strip(ids);
                }
            }
            EntityKind::Relationship => {
                if let Some(ids) = self.by_rel_type.get_mut(&RelTypeId(rule.entity_token)) {
                    strip(ids);
                }
            }
        }
        for key in &rule.keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                strip(ids);
            }
        }
        if let Some(ids) = self.by_constraint_kind.get_mut(&rule.kind) {
            strip(ids);
        }
    }
}

/// In-memory mirror of the schema store with secondary lookups. Read paths
/// take the read lock only; the applier chain takes the write lock.
#[derive(Default, Debug)]
pub struct SchemaCache {
    inner: RwLock<CacheInner>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, rules: impl IntoIterator<Item = SchemaRule>) {
        let mut inner = self.inner.write();
        *inner = CacheInner::default();
        for rule in rules {
            inner.index(&rule);
            inner.by_id.insert(rule.id, rule);
        }
    }

    pub fn add(&self, rule: SchemaRule) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.by_id.remove(&rule.id) {
            inner.unindex(&old);
        }
        inner.index(&rule);
        inner.by_id.insert(rule.id, rule);
    }

    pub fn remove(&self, id: SchemaId) {
        let mut inner = self.inner.write();
        if let Some(rule) = inner.by_id.remove(&id) {
            inner.unindex(&rule);
        }
    }

    pub fn get(&self, id: SchemaId) -> Option<SchemaRule> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    pub fn all(&self) -> Vec<SchemaRule> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn rules_for_label(&self, label: LabelId) -> Vec<SchemaRule> {
        let inner = self.inner.read();
        inner
            .by_label
            .get(&label)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rules_for_rel_type(&self, rel_type: RelTypeId) -> Vec<SchemaRule> {
        let inner = self.inner.read();
        inner
            .by_rel_type
            .get(&rel_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rules_for_key(&self, key: KeyId) -> Vec<SchemaRule> {
        let inner = self.inner.read();
        inner
            .by_key
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn constraints_of_kind(&self, kind: RuleKind) -> Vec<SchemaRule> {
        let inner = self.inner.read();
        inner
            .by_constraint_kind
            .get(&kind)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Derived per-database scratch state keyed by arbitrary strings (query
/// plans and the like). Cleared wholesale whenever schema or tokens change
/// under external or recovery apply.
#[derive(Default, Debug)]
pub struct SchemaState {
    entries: RwLock<HashMap<String, u64>>,
}

impl SchemaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: u64) {
        self.entries.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.read().get(key).copied()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[derive(Default, Debug)]
struct TokenSpace {
    by_id: HashMap<u32, String>,
    by_name: HashMap<String, u32>,
}

/// Interned token catalog loaded from the token store at start and extended
/// by token commands during apply.
#[derive(Default, Debug)]
pub struct TokenRegistry {
    labels: RwLock<TokenSpace>,
    rel_types: RwLock<TokenSpace>,
    keys: RwLock<TokenSpace>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn space(&self, kind: TokenKind) -> &RwLock<TokenSpace> {
        match kind {
            TokenKind::Label => &self.labels,
            TokenKind::RelType => &self.rel_types,
            TokenKind::PropertyKey => &self.keys,
        }
    }

    pub fn register(&self, kind: TokenKind, id: u32, name: &str) {
        let mut space = self.space(kind).write();
        space.by_id.insert(id, name.to_owned());
        space.by_name.insert(name.to_owned(), id);
    }

    pub fn name(&self, kind: TokenKind, id: u32) -> Option<String> {
        self.space(kind).read().by_id.get(&id).cloned()
    }

    pub fn id(&self, kind: TokenKind, name: &str) -> Option<u32> {
        self.space(kind).read().by_name.get(name).copied()
    }

    pub fn contains(&self, kind: TokenKind, id: u32) -> bool {
        self.space(kind).read().by_id.contains_key(&id)
    }

    pub fn clear(&self) {
        for space in [&self.labels, &self.rel_types, &self.keys] {
            let mut guard = space.write();
            guard.by_id.clear();
            guard.by_name.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn rule(id: u64, kind: RuleKind, label: u32, key: u32) -> SchemaRule {
        SchemaRule {
            id: SchemaId(id),
            kind,
            entity: EntityKind::Node,
            entity_token: label,
            keys: smallvec![KeyId(key)],
        }
    }

    #[test]
    fn rule_serialization_roundtrip() -> Result<()> {
        let rule = SchemaRule {
            id: SchemaId(42),
            kind: RuleKind::UniquenessConstraint,
            entity: EntityKind::Relationship,
            entity_token: 7,
            keys: smallvec![KeyId(1), KeyId(2), KeyId(3)],
        };
        let bytes = rule.serialize()?;
        assert_eq!(SchemaRule::deserialize(&bytes)?, rule);
        Ok(())
    }

    #[test]
    fn cache_secondary_indexes_follow_add_and_remove() {
        let cache = SchemaCache::new();
        cache.add(rule(1, RuleKind::Index, 10, 100));
        cache.add(rule(2, RuleKind::UniquenessConstraint, 10, 101));

        assert_eq!(cache.rules_for_label(LabelId(10)).len(), 2);
        assert_eq!(cache.rules_for_key(KeyId(100)).len(), 1);
        assert_eq!(
            cache
                .constraints_of_kind(RuleKind::UniquenessConstraint)
                .len(),
            1
        );

        cache.remove(SchemaId(1));
        assert_eq!(cache.rules_for_label(LabelId(10)).len(), 1);
        assert!(cache.rules_for_key(KeyId(100)).is_empty());
        assert!(cache.get(SchemaId(1)).is_none());
    }

    #[test]
    fn token_registry_roundtrip() {
        let registry = TokenRegistry::new();
        registry.register(TokenKind::Label, 0, "Person");
        registry.register(TokenKind::PropertyKey, 0, "name");
        assert_eq!(registry.id(TokenKind::Label, "Person"), Some(0));
        assert_eq!(registry.name(TokenKind::Label, 0).as_deref(), Some("Person"));
        assert_eq!(registry.id(TokenKind::PropertyKey, "name"), Some(0));
        assert!(!registry.contains(TokenKind::RelType, 0));
    }
}
