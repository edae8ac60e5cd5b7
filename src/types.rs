use std::fmt;

use crate::error::{Result, StoreError};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RelId(pub u64);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct GroupId(pub u64);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropId(pub u64);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SchemaId(pub u64);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LabelId(pub u32);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RelTypeId(pub u32);
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct KeyId(pub u32);

/// Sentinel encoding "no link" in record pointer fields.
pub const NULL_REFERENCE: u64 = u64::MAX;

pub fn is_null(reference: u64) -> bool {
    reference == NULL_REFERENCE
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for LabelId {
    fn from(value: u32) -> Self {
        LabelId(value)
    }
}

impl From<u32> for RelTypeId {
    fn from(value: u32) -> Self {
        RelTypeId(value)
    }
}

impl From<u32> for KeyId {
    fn from(value: u32) -> Self {
        KeyId(value)
    }
}

/// On-disk format generation. Advances only through upgrade transactions and
/// never moves backwards.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum KernelVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

impl KernelVersion {
    pub const LATEST: KernelVersion = KernelVersion::V3;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(StoreError::FormatMismatch(format!(
                "unknown kernel version: {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_at_least(self, other: KernelVersion) -> bool {
        self >= other
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.as_byte())
    }
}

/// Direction of a relationship chain relative to a node or group.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Direction {
    Outgoing = 0,
    Incoming = 1,
    Loop = 2,
}

impl Direction {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Outgoing),
            1 => Ok(Self::Incoming),
            2 => Ok(Self::Loop),
            other => Err(StoreError::Corruption(format!(
                "unknown direction: {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Entity owning a property chain.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Owner {
    Node(NodeId),
    Relationship(RelId),
}

impl Owner {
    pub fn raw_id(self) -> u64 {
        match self {
            Owner::Node(id) => id.0,
            Owner::Relationship(id) => id.0,
        }
    }

    pub fn is_node(self) -> bool {
        matches!(self, Owner::Node(_))
    }
}

/// Token namespaces persisted in the token store.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum TokenKind {
    Label = 0,
    RelType = 1,
    PropertyKey = 2,
}

impl TokenKind {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Label),
            1 => Ok(Self::RelType),
            2 => Ok(Self::PropertyKey),
            other => Err(StoreError::Corruption(format!(
                "unknown token kind: {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Coarse per-transaction memory accounting handed to command creation.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    allocated: std::sync::atomic::AtomicU64,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, bytes: u64) {
        self.allocated
            .fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        self.allocated
            .fetch_sub(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version_ordering_and_bytes() -> Result<()> {
        assert!(KernelVersion::V1 < KernelVersion::V2);
        assert!(KernelVersion::LATEST.is_at_least(KernelVersion::V2));
        for version in [KernelVersion::V1, KernelVersion::V2, KernelVersion::V3] {
            assert_eq!(KernelVersion::from_byte(version.as_byte())?, version);
        }
        assert!(KernelVersion::from_byte(0).is_err());
        assert!(KernelVersion::from_byte(99).is_err());
        Ok(())
    }

    #[test]
    fn null_reference_sentinel() {
        assert!(is_null(NULL_REFERENCE));
        assert!(!is_null(0));
        assert!(!is_null(u64::MAX - 1));
    }

    #[test]
    fn owner_projections() {
        assert_eq!(Owner::Node(NodeId(7)).raw_id(), 7);
        assert!(Owner::Node(NodeId(7)).is_node());
        assert_eq!(Owner::Relationship(RelId(9)).raw_id(), 9);
        assert!(!Owner::Relationship(RelId(9)).is_node());
    }

    #[test]
    fn direction_roundtrip() -> Result<()> {
        for direction in [Direction::Outgoing, Direction::Incoming, Direction::Loop] {
            assert_eq!(Direction::from_byte(direction.as_byte())?, direction);
        }
        assert!(Direction::from_byte(3).is_err());
        Ok(())
    }
}
