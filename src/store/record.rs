//! Fixed-size record layouts and their byte codecs. All integers are
//! big-endian. A record's id is positional and never stored in its payload.

use smallvec::SmallVec;

use crate::error::{Result, StoreError};
use crate::types::{is_null, LabelId, TokenKind, NULL_REFERENCE};

/// Behaviour of [`crate::store::RecordFile::read`] for records that are not
/// in use.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecordLoad {
    /// Fail with `NotInUse`.
    Normal,
    /// Return whatever the bytes decode to.
    Always,
    /// Report absence instead of failing.
    Check,
}

pub trait RecordCodec: Clone + std::fmt::Debug {
    const RECORD_SIZE: usize;
    const STORE_NAME: &'static str;

    fn new_record(id: u64) -> Self;
    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
    fn in_use(&self) -> bool;
    fn encode(&self, buf: &mut [u8]);
    fn decode(id: u64, buf: &[u8]) -> Result<Self>;
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(arr)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(arr)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

const IN_USE: u8 = 0x01;

pub const MAX_INLINE_LABELS: usize = 5;

/// Node record. `next_rel` points at the first relationship of the chain for
/// a sparse node, or at the first relationship group for a dense one.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    pub id: u64,
    pub in_use: bool,
    pub dense: bool,
    pub next_rel: u64,
    pub next_prop: u64,
    pub labels: SmallVec<[LabelId; 4]>,
}

const NODE_DENSE: u8 = 0x02;

impl RecordCodec for NodeRecord {
    const RECORD_SIZE: usize = 40;
    const STORE_NAME: &'static str = "node";

    fn new_record(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            dense: false,
            next_rel: NULL_REFERENCE,
            next_prop: NULL_REFERENCE,
            labels: SmallVec::new(),
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::RECORD_SIZE);
        debug_assert!(self.labels.len() <= MAX_INLINE_LABELS);
        buf.fill(0);
        let mut flags = 0u8;
        if self.in_use {
            flags |= IN_USE;
        }
        if self.dense {
            flags |= NODE_DENSE;
        }
        buf[0] = flags;
        buf[1..9].copy_from_slice(&self.next_rel.to_be_bytes());
        buf[9..17].copy_from_slice(&self.next_prop.to_be_bytes());
        buf[17] = self.labels.len() as u8;
        for (slot, label) in self.labels.iter().enumerate() {
            let at = 18 + slot * 4;
            buf[at..at + 4].copy_from_slice(&label.0.to_be_bytes());
        }
    }

    fn decode(id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::RECORD_SIZE {
            return Err(StoreError::Corruption("node record truncated".into()));
        }
        let flags = buf[0];
        let label_count = buf[17] as usize;
        if label_count > MAX_INLINE_LABELS {
            return Err(StoreError::Corruption(format!(
                "node {id} label count {label_count} exceeds inline capacity"
            )));
        }
        let mut labels = SmallVec::new();
        for slot in 0..label_count {
            labels.push(LabelId(read_u32(buf, 18 + slot * 4)));
        }
        Ok(Self {
            id,
            in_use: flags & IN_USE != 0,
            dense: flags & NODE_DENSE != 0,
            next_rel: read_u64(buf, 1),
            next_prop: read_u64(buf, 9),
            labels,
        })
    }
}

const REL_FIRST_IN_SRC: u8 = 0x02;
const REL_FIRST_IN_DST: u8 = 0x04;

/// Relationship record, doubly linked into one chain per endpoint. The first
/// record of a chain carries the chain degree in its `prev` field instead of
/// a pointer; loops use the src-side fields only.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipRecord {
    pub id: u64,
    pub in_use: bool,
    pub src: u64,
    pub dst: u64,
    pub rel_type: u32,
    pub first_in_src_chain: bool,
    pub first_in_dst_chain: bool,
    pub src_prev: u64,
    pub src_next: u64,
    pub dst_prev: u64,
    pub dst_next: u64,
    pub next_prop: u64,
}

impl RelationshipRecord {
    pub fn is_loop(&self) -> bool {
        self.src == self.dst
    }

    fn uses_src_side(&self, node: u64) -> bool {
        debug_assert!(node == self.src || node == self.dst);
        node == self.src
    }

    pub fn chain_prev(&self, node: u64) -> u64 {
        if self.uses_src_side(node) {
            self.src_prev
        } else {
            self.dst_prev
        }
    }

    pub fn chain_next(&self, node: u64) -> u64 {
        if self.uses_src_side(node) {
            self.src_next
        } else {
            self.dst_next
        }
    }

    pub fn set_chain_prev(&mut self, node: u64, value: u64) {
        if self.uses_src_side(node) {
            self.src_prev = value;
        } else {
            self.dst_prev = value;
        }
    }

    pub fn set_chain_next(&mut self, node: u64, value: u64) {
        if self.uses_src_side(node) {
            self.src_next = value;
        } else {
            self.dst_next = value;
        }
    }

    pub fn is_first_in_chain(&self, node: u64) -> bool {
        if self.uses_src_side(node) {
            self.first_in_src_chain
        } else {
            self.first_in_dst_chain
        }
    }

    pub fn set_first_in_chain(&mut self, node: u64, first: bool) {
        if self.uses_src_side(node) {
            self.first_in_src_chain = first;
        } else {
            self.first_in_dst_chain = first;
        }
    }
}

impl RecordCodec for RelationshipRecord {
    const RECORD_SIZE: usize = 64;
    const STORE_NAME: &'static str = "relationship";

    fn new_record(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            src: NULL_REFERENCE,
            dst: NULL_REFERENCE,
            rel_type: 0,
            first_in_src_chain: false,
            first_in_dst_chain: false,
            src_prev: NULL_REFERENCE,
            src_next: NULL_REFERENCE,
            dst_prev: NULL_REFERENCE,
            dst_next: NULL_REFERENCE,
            next_prop: NULL_REFERENCE,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::RECORD_SIZE);
        buf.fill(0);
        let mut flags = 0u8;
        if self.in_use {
            flags |= IN_USE;
        }
        if self.first_in_src_chain {
            flags |= REL_FIRST_IN_SRC;
        }
        if self.first_in_dst_chain {
            flags |= REL_FIRST_IN_DST;
        }
        buf[0] = flags;
        buf[1..9].copy_from_slice(&self.src.to_be_bytes());
        buf[9..17].copy_from_slice(&self.dst.to_be_bytes());
        buf[17..21].copy_from_slice(&self.rel_type.to_be_bytes());
        buf[21..29].copy_from_slice(&self.src_prev.to_be_bytes());
        buf[29..37].copy_from_slice(&self.src_next.to_be_bytes());
        buf[37..45].copy_from_slice(&self.dst_prev.to_be_bytes());
        buf[45..53].copy_from_slice(&self.dst_next.to_be_bytes());
        buf[53..61].copy_from_slice(&self.next_prop.to_be_bytes());
    }

    fn decode(id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::RECORD_SIZE {
            return Err(StoreError::Corruption(
                "relationship record truncated".into(),
            ));
        }
        let flags = buf[0];
        Ok(Self {
            id,
            in_use: flags & IN_USE != 0,
            first_in_src_chain: flags & REL_FIRST_IN_SRC != 0,
            first_in_dst_chain: flags & REL_FIRST_IN_DST != 0,
            src: read_u64(buf, 1),
            dst: read_u64(buf, 9),
            rel_type: read_u32(buf, 17),
            src_prev: read_u64(buf, 21),
            src_next: read_u64(buf, 29),
            dst_prev: read_u64(buf, 37),
            dst_next: read_u64(buf, 45),
            next_prop: read_u64(buf, 53),
        })
    }
}

const GROUP_EXT_OUT: u8 = 0x02;
const GROUP_EXT_IN: u8 = 0x04;
const GROUP_EXT_LOOP: u8 = 0x08;

/// Per-type chain index for a dense node. Groups of one node form a singly
/// linked list; each direction field heads its own relationship chain.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipGroupRecord {
    pub id: u64,
    pub in_use: bool,
    pub rel_type: u32,
    pub next_group: u64,
    pub owning_node: u64,
    pub first_out: u64,
    pub first_in: u64,
    pub first_loop: u64,
    pub external_degrees_out: bool,
    pub external_degrees_in: bool,
    pub external_degrees_loop: bool,
}

impl RelationshipGroupRecord {
    pub fn first(&self, direction: crate::types::Direction) -> u64 {
        match direction {
            crate::types::Direction::Outgoing => self.first_out,
            crate::types::Direction::Incoming => self.first_in,
            crate::types::Direction::Loop => self.first_loop,
        }
    }

    pub fn set_first(&mut self, direction: crate::types::Direction, value: u64) {
        match direction {
            crate::types::Direction::Outgoing => self.first_out = value,
            crate::types::Direction::Incoming => self.first_in = value,
            crate::types::Direction::Loop => self.first_loop = value,
        }
    }

    pub fn has_external_degrees(&self, direction: crate::types::Direction) -> bool {
        match direction {
            crate::types::Direction::Outgoing => self.external_degrees_out,
            crate::types::Direction::Incoming => self.external_degrees_in,
            crate::types::Direction::Loop => self.external_degrees_loop,
        }
    }

    pub fn set_external_degrees(&mut self, direction: crate::types::Direction, value: bool) {
        match direction {
            crate::types::Direction::Outgoing => self.external_degrees_out = value,
            crate::types::Direction::Incoming => self.external_degrees_in = value,
            crate::types::Direction::Loop => self.external_degrees_loop = value,
        }
    }
}

impl RecordCodec for RelationshipGroupRecord {
    const RECORD_SIZE: usize = 48;
    const STORE_NAME: &'static str = "relationship-group";

    fn new_record(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            rel_type: 0,
            next_group: NULL_REFERENCE,
            owning_node: NULL_REFERENCE,
            first_out: NULL_REFERENCE,
            first_in: NULL_REFERENCE,
            first_loop: NULL_REFERENCE,
            external_degrees_out: false,
            external_degrees_in: false,
            external_degrees_loop: false,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::RECORD_SIZE);
        buf.fill(0);
        let mut flags = 0u8;
        if self.in_use {
            flags |= IN_USE;
        }
        if self.external_degrees_out {
            flags |= GROUP_EXT_OUT;
        }
        if self.external_degrees_in {
            flags |= GROUP_EXT_IN;
        }
        if self.external_degrees_loop {
            flags |= GROUP_EXT_LOOP;
        }
        buf[0] = flags;
        buf[1..5].copy_from_slice(&self.rel_type.to_be_bytes());
        buf[5..13].copy_from_slice(&self.next_group.to_be_bytes());
        buf[13..21].copy_from_slice(&self.owning_node.to_be_bytes());
        buf[21..29].copy_from_slice(&self.first_out.to_be_bytes());
        buf[29..37].copy_from_slice(&self.first_in.to_be_bytes());
        buf[37..45].copy_from_slice(&self.first_loop.to_be_bytes());
    }

    fn decode(id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::RECORD_SIZE {
            return Err(StoreError::Corruption(
                "relationship group record truncated".into(),
            ));
        }
        let flags = buf[0];
        Ok(Self {
            id,
            in_use: flags & IN_USE != 0,
            external_degrees_out: flags & GROUP_EXT_OUT != 0,
            external_degrees_in: flags & GROUP_EXT_IN != 0,
            external_degrees_loop: flags & GROUP_EXT_LOOP != 0,
            rel_type: read_u32(buf, 1),
            next_group: read_u64(buf, 5),
            owning_node: read_u64(buf, 13),
            first_out: read_u64(buf, 21),
            first_in: read_u64(buf, 29),
            first_loop: read_u64(buf, 37),
        })
    }
}

pub const INLINE_VALUE_CAP: usize = 20;

/// How a property record stores its value bytes.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ValueKind {
    None = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    ShortStr = 4,
    ShortBytes = 5,
    LongStr = 6,
    LongBytes = 7,
}

impl ValueKind {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::Bool),
            2 => Ok(Self::Int),
            3 => Ok(Self::Float),
            4 => Ok(Self::ShortStr),
            5 => Ok(Self::ShortBytes),
            6 => Ok(Self::LongStr),
            7 => Ok(Self::LongBytes),
            other => Err(StoreError::Corruption(format!(
                "unknown property value kind: {other}"
            ))),
        }
    }

    pub fn spills(self) -> bool {
        matches!(self, Self::LongStr | Self::LongBytes)
    }
}

const PROP_OWNER_IS_NODE: u8 = 0x02;

/// One key/value pair on an entity's doubly linked property chain. Values
/// beyond [`INLINE_VALUE_CAP`] bytes spill to the string or array value
/// store; the inline payload then holds `{first_block: u64, total_len: u32}`.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyRecord {
    pub id: u64,
    pub in_use: bool,
    pub owner_is_node: bool,
    pub owner: u64,
    pub key: u32,
    pub value_kind: ValueKind,
    pub next_prop: u64,
    pub prev_prop: u64,
    pub inline: SmallVec<[u8; INLINE_VALUE_CAP]>,
}

impl PropertyRecord {
    pub fn spilled_reference(&self) -> Result<(u64, u32)> {
        if !self.value_kind.spills() || self.inline.len() != 12 {
            return Err(StoreError::Corruption(format!(
                "property {} has no spilled value reference",
                self.id
            )));
        }
        let first_block = read_u64(&self.inline, 0);
        let total_len = read_u32(&self.inline, 8);
        Ok((first_block, total_len))
    }

    pub fn set_spilled_reference(&mut self, first_block: u64, total_len: u32) {
        self.inline.clear();
        self.inline.extend_from_slice(&first_block.to_be_bytes());
        self.inline.extend_from_slice(&total_len.to_be_bytes());
    }
}

impl RecordCodec for PropertyRecord {
    const RECORD_SIZE: usize = 56;
    const STORE_NAME: &'static str = "property";

    fn new_record(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            owner_is_node: true,
            owner: NULL_REFERENCE,
            key: 0,
            value_kind: ValueKind::None,
            next_prop: NULL_REFERENCE,
            prev_prop: NULL_REFERENCE,
            inline: SmallVec::new(),
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::RECORD_SIZE);
        debug_assert!(self.inline.len() <= INLINE_VALUE_CAP);
        buf.fill(0);
        let mut flags = 0u8;
        if self.in_use {
            flags |= IN_USE;
        }
        if self.owner_is_node {
            flags |= PROP_OWNER_IS_NODE;
        }
        buf[0] = flags;
        buf[1] = self.value_kind as u8;
        buf[2..10].copy_from_slice(&self.owner.to_be_bytes());
        buf[10..14].copy_from_slice(&self.key.to_be_bytes());
        buf[14..22].copy_from_slice(&self.next_prop.to_be_bytes());
        buf[22..30].copy_from_slice(&self.prev_prop.to_be_bytes());
        buf[30] = self.inline.len() as u8;
        buf[31..31 + self.inline.len()].copy_from_slice(&self.inline);
    }

    fn decode(id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::RECORD_SIZE {
            return Err(StoreError::Corruption("property record truncated".into()));
        }
        let flags = buf[0];
        let inline_len = buf[30] as usize;
        if inline_len > INLINE_VALUE_CAP {
            return Err(StoreError::Corruption(format!(
                "property {id} inline length {inline_len} exceeds capacity"
            )));
        }
        let mut inline = SmallVec::new();
        inline.extend_from_slice(&buf[31..31 + inline_len]);
        Ok(Self {
            id,
            in_use: flags & IN_USE != 0,
            owner_is_node: flags & PROP_OWNER_IS_NODE != 0,
            value_kind: ValueKind::from_byte(buf[1])?,
            owner: read_u64(buf, 2),
            key: read_u32(buf, 10),
            next_prop: read_u64(buf, 14),
            prev_prop: read_u64(buf, 22),
            inline,
        })
    }
}

pub const DYN_PAYLOAD: usize = 117;

/// Chained block of a spilled string or array value.
#[derive(Clone, Debug, PartialEq)]
pub struct DynRecord {
    pub id: u64,
    pub in_use: bool,
    pub next_block: u64,
    pub payload: Vec<u8>,
}

impl RecordCodec for DynRecord {
    const RECORD_SIZE: usize = 128;
    const STORE_NAME: &'static str = "dynamic-value";

    fn new_record(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            next_block: NULL_REFERENCE,
            payload: Vec::new(),
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::RECORD_SIZE);
        debug_assert!(self.payload.len() <= DYN_PAYLOAD);
        buf.fill(0);
        if self.in_use {
            buf[0] = IN_USE;
        }
        buf[1..9].copy_from_slice(&self.next_block.to_be_bytes());
        buf[9..11].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf[11..11 + self.payload.len()].copy_from_slice(&self.payload);
    }

    fn decode(id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::RECORD_SIZE {
            return Err(StoreError::Corruption(
                "dynamic value record truncated".into(),
            ));
        }
        let used = read_u16(buf, 9) as usize;
        if used > DYN_PAYLOAD {
            return Err(StoreError::Corruption(format!(
                "dynamic block {id} payload length {used} exceeds capacity"
            )));
        }
        Ok(Self {
            id,
            in_use: buf[0] & IN_USE != 0,
            next_block: read_u64(buf, 1),
            payload: buf[11..11 + used].to_vec(),
        })
    }
}

pub const SCHEMA_PAYLOAD_CAP: usize = 125;

/// Schema rule record with the serialized rule inline.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaRecord {
    pub id: u64,
    pub in_use: bool,
    pub payload: Vec<u8>,
}

impl RecordCodec for SchemaRecord {
    const RECORD_SIZE: usize = 128;
    const STORE_NAME: &'static str = "schema";

    fn new_record(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            payload: Vec::new(),
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::RECORD_SIZE);
        debug_assert!(self.payload.len() <= SCHEMA_PAYLOAD_CAP);
        buf.fill(0);
        if self.in_use {
            buf[0] = IN_USE;
        }
        buf[1..3].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf[3..3 + self.payload.len()].copy_from_slice(&self.payload);
    }

    fn decode(id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::RECORD_SIZE {
            return Err(StoreError::Corruption("schema record truncated".into()));
        }
        let len = read_u16(buf, 1) as usize;
        if len > SCHEMA_PAYLOAD_CAP {
            return Err(StoreError::Corruption(format!(
                "schema record {id} payload length {len} exceeds capacity"
            )));
        }
        Ok(Self {
            id,
            in_use: buf[0] & IN_USE != 0,
            payload: buf[3..3 + len].to_vec(),
        })
    }
}

pub const MAX_TOKEN_NAME: usize = 45;

#[derive(Clone, Debug, PartialEq)]
pub struct TokenRecord {
    pub id: u64,
    pub in_use: bool,
    pub kind: TokenKind,
    pub name: String,
}

impl RecordCodec for TokenRecord {
    const RECORD_SIZE: usize = 48;
    const STORE_NAME: &'static str = "token";

    fn new_record(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            kind: TokenKind::Label,
            name: String::new(),
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::RECORD_SIZE);
        debug_assert!(self.name.len() <= MAX_TOKEN_NAME);
        buf.fill(0);
        if self.in_use {
            buf[0] = IN_USE;
        }
        buf[1] = self.kind.as_byte();
        buf[2] = self.name.len() as u8;
        buf[3..3 + self.name.len()].copy_from_slice(self.name.as_bytes());
    }

    fn decode(id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::RECORD_SIZE {
            return Err(StoreError::Corruption("token record truncated".into()));
        }
        let len = buf[2] as usize;
        if len > MAX_TOKEN_NAME {
            return Err(StoreError::Corruption(format!(
                "token record {id} name length {len} exceeds capacity"
            )));
        }
        let name = std::str::from_utf8(&buf[3..3 + len])
            .map_err(|_| StoreError::Corruption(format!("token record {id} name is not UTF-8")))?
            .to_owned();
        Ok(Self {
            id,
            in_use: buf[0] & IN_USE != 0,
            kind: TokenKind::from_byte(buf[1])?,
            name,
        })
    }
}

/// Single-value record of the meta-data store; one record per
/// [`crate::store::MetaPosition`].
#[derive(Clone, Debug, PartialEq)]
pub struct MetaDataRecord {
    pub id: u64,
    pub in_use: bool,
    pub value: u64,
}

impl RecordCodec for MetaDataRecord {
    const RECORD_SIZE: usize = 16;
    const STORE_NAME: &'static str = "meta-data";

    fn new_record(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            value: 0,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), Self::RECORD_SIZE);
        buf.fill(0);
        if self.in_use {
            buf[0] = IN_USE;
        }
        buf[1..9].copy_from_slice(&self.value.to_be_bytes());
    }

    fn decode(id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::RECORD_SIZE {
            return Err(StoreError::Corruption("meta-data record truncated".into()));
        }
        Ok(Self {
            id,
            in_use: buf[0] & IN_USE != 0,
            value: read_u64(buf, 1),
        })
    }
}

/// Degree of a chain as stored in the head record's `prev` field. Null means
/// an empty chain.
pub fn chain_degree_from_prev(prev: u64) -> u64 {
    if is_null(prev) {
        0
    } else {
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    #[test]
    fn node_roundtrip() -> Result<()> {
        let mut record = NodeRecord::new_record(7);
        record.in_use = true;
        record.dense = true;
        record.next_rel = 42;
        record.next_prop = 99;
        record.labels.push(LabelId(3));
        record.labels.push(LabelId(8));
        let mut buf = vec![0u8; NodeRecord::RECORD_SIZE];
        record.encode(&mut buf);
        let decoded = NodeRecord::decode(7, &buf)?;
        assert_eq!(decoded, record);
        Ok(())
    }

    #[test]
    fn relationship_chain_sides() {
        let mut record = RelationshipRecord::new_record(1);
        record.src = 10;
        record.dst = 20;
        record.set_chain_next(10, 5);
        record.set_chain_next(20, 6);
        assert_eq!(record.src_next, 5);
        assert_eq!(record.dst_next, 6);
        assert_eq!(record.chain_next(10), 5);
        assert_eq!(record.chain_next(20), 6);
    }

    #[test]
    fn property_spilled_reference_roundtrip() -> Result<()> {
        let mut record = PropertyRecord::new_record(3);
        record.in_use = true;
        record.value_kind = ValueKind::LongStr;
        record.set_spilled_reference(1234, 5678);
        assert_eq!(record.spilled_reference()?, (1234, 5678));
        let mut buf = vec![0u8; PropertyRecord::RECORD_SIZE];
        record.encode(&mut buf);
        assert_eq!(PropertyRecord::decode(3, &buf)?, record);
        Ok(())
    }

    #[test]
    fn decode_rejects_oversized_lengths() {
        let mut buf = vec![0u8; NodeRecord::RECORD_SIZE];
        buf[17] = MAX_INLINE_LABELS as u8 + 1;
        assert!(NodeRecord::decode(0, &buf).is_err());

        let mut buf = vec![0u8; TokenRecord::RECORD_SIZE];
        buf[2] = MAX_TOKEN_NAME as u8 + 1;
        assert!(TokenRecord::decode(0, &buf).is_err());
    }

    proptest! {
        #[test]
        fn proptest_relationship_roundtrip(
            in_use in any::<bool>(),
            src in any::<u64>(),
            dst in any::<u64>(),
            rel_type in any::<u32>(),
            links in vec(any::<u64>(), 5),
            first_src in any::<bool>(),
            first_dst in any::<bool>(),
        ) {
            let record = RelationshipRecord {
                id: 11,
                in_use,
                src,
                dst,
                rel_type,
                first_in_src_chain: first_src,
                first_in_dst_chain: first_dst,
                src_prev: links[0],
                src_next: links[1],
                dst_prev: links[2],
                dst_next: links[3],
                next_prop: links[4],
            };
            let mut buf = vec![0u8; RelationshipRecord::RECORD_SIZE];
            record.encode(&mut buf);
            let decoded = RelationshipRecord::decode(11, &buf).expect("decode succeeds");
            prop_assert_eq!(decoded, record);
        }

        #[test]
        fn proptest_property_roundtrip(
            in_use in any::<bool>(),
            owner_is_node in any::<bool>(),
            owner in any::<u64>(),
            key in any::<u32>(),
            next_prop in any::<u64>(),
            prev_prop in any::<u64>(),
            inline in vec(any::<u8>(), 0..=INLINE_VALUE_CAP),
            kind in 0u8..=5,
        ) {
            let record = PropertyRecord {
                id: 2,
                in_use,
                owner_is_node,
                owner,
                key,
                value_kind: ValueKind::from_byte(kind).expect("kind in range"),
                next_prop,
                prev_prop,
                inline: SmallVec::from_vec(inline),
            };
            let mut buf = vec![0u8; PropertyRecord::RECORD_SIZE];
            record.encode(&mut buf);
            let decoded = PropertyRecord::decode(2, &buf).expect("decode succeeds");
            prop_assert_eq!(decoded, record);
        }

        #[test]
        fn proptest_dyn_roundtrip(
            in_use in any::<bool>(),
            next_block in any::<u64>(),
            payload in vec(any::<u8>(), 0..=DYN_PAYLOAD),
        ) {
            let record = DynRecord { id: 4, in_use, next_block, payload };
            let mut buf = vec![0u8; DynRecord::RECORD_SIZE];
            record.encode(&mut buf);
            let decoded = DynRecord::decode(4, &buf).expect("decode succeeds");
            prop_assert_eq!(decoded, record);
        }
    }
}
