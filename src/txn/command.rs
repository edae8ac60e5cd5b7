//! Durable commands: before/after record pairs plus auxiliary-store deltas.
//! Commands are totally ordered within a transaction and that order is the
//! replay order.

use crate::counts::CountsKey;
use crate::schema::SchemaRule;
use crate::store::record::{
    DynRecord, NodeRecord, PropertyRecord, RecordCodec, RelationshipGroupRecord,
    RelationshipRecord, SchemaRecord, TokenRecord,
};
use crate::store::MetaPosition;
use crate::types::{Direction, KernelVersion};

/// A record mutation expressed as the state on either side of the
/// transaction. Either side may be not-in-use.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordPair<R: RecordCodec> {
    pub before: R,
    pub after: R,
}

impl<R: RecordCodec> RecordPair<R> {
    pub fn new(before: R, after: R) -> Self {
        debug_assert_eq!(before.id(), after.id());
        Self { before, after }
    }

    pub fn id(&self) -> u64 {
        self.after.id()
    }

    pub fn creates(&self) -> bool {
        !self.before.in_use() && self.after.in_use()
    }

    pub fn deletes(&self) -> bool {
        self.before.in_use() && !self.after.in_use()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Node(RecordPair<NodeRecord>),
    Relationship(RecordPair<RelationshipRecord>),
    Group(RecordPair<RelationshipGroupRecord>),
    Property {
        pair: RecordPair<PropertyRecord>,
        /// Spilled string value blocks touched alongside the record.
        string_blocks: Vec<RecordPair<DynRecord>>,
        /// Spilled array value blocks touched alongside the record.
        array_blocks: Vec<RecordPair<DynRecord>>,
    },
    Schema {
        pair: RecordPair<SchemaRecord>,
        rule: SchemaRule,
    },
    Token(RecordPair<TokenRecord>),
    Counts {
        key: CountsKey,
        delta: i64,
    },
    Degrees {
        group: u64,
        direction: Direction,
        delta: i64,
    },
    MetaData {
        position: MetaPosition,
        before: u64,
        after: u64,
    },
}

impl Command {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Command::Node(_) => "node",
            Command::Relationship(_) => "relationship",
            Command::Group(_) => "relationship-group",
            Command::Property { .. } => "property",
            Command::Schema { .. } => "schema",
            Command::Token(_) => "token",
            Command::Counts { .. } => "counts",
            Command::Degrees { .. } => "degrees",
            Command::MetaData { .. } => "meta-data",
        }
    }
}

/// One transaction's worth of commands, linkable into a batch. Linked
/// transactions apply in link order, each through its own applier pass.
#[derive(Debug)]
pub struct CommandBatch {
    pub tx_id: u64,
    pub version: KernelVersion,
    pub commands: Vec<Command>,
    pub next: Option<Box<CommandBatch>>,
}

impl CommandBatch {
    pub fn new(tx_id: u64, version: KernelVersion, commands: Vec<Command>) -> Self {
        Self {
            tx_id,
            version,
            commands,
            next: None,
        }
    }

    /// Appends `next` at the tail of the chain.
    pub fn chain(&mut self, next: CommandBatch) {
        let mut tail = self;
        while tail.next.is_some() {
            tail = tail.next.as_mut().expect("tail has a next link");
        }
        tail.next = Some(Box::new(next));
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            current: Some(self),
        }
    }

    pub fn last_tx_id(&self) -> u64 {
        self.iter().map(|batch| batch.tx_id).last().unwrap_or(self.tx_id)
    }
}

pub struct BatchIter<'a> {
    current: Option<&'a CommandBatch>,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = &'a CommandBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = current.next.as_deref();
        Some(current)
    }
}
