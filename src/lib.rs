//! trellis: a transactional record storage engine for a property graph.
//!
//! Logical transaction state is translated into a totally ordered stream of
//! record-level commands, validated, appended to a transaction log, and
//! applied through per-mode applier chains against fixed-size record stores,
//! with counts, schema cache, id generators, and scan listeners kept in step.

pub mod apply;
pub mod config;
pub mod counts;
pub mod engine;
pub mod error;
pub mod id;
pub mod lock;
pub mod page;
pub mod reader;
pub mod schema;
pub mod store;
pub mod txn;
pub mod types;
pub mod upgrade;
pub mod validate;
pub mod worksync;

pub use crate::apply::{
    ApplyMode, EntityTokenUpdateListener, IndexEntryUpdate, IndexUpdateListener, TokenScanUpdate,
};
pub use crate::config::Config;
pub use crate::counts::{CountsKey, CountsStore, GroupDegreesStore, ANY};
pub use crate::engine::{CommandCreationContext, StorageEngine};
pub use crate::error::{DatabaseHealth, Result, StoreError};
pub use crate::lock::{Resource, ResourceLocker, TrackingLocks};
pub use crate::reader::StorageReader;
pub use crate::schema::{EntityKind, RuleKind, SchemaCache, SchemaRule, TokenRegistry};
pub use crate::txn::{Command, CommandBatch, TransactionState, TxStateVisitor};
pub use crate::types::{
    Direction, KernelVersion, KeyId, LabelId, NodeId, Owner, PropertyValue, RelId, RelTypeId,
    SchemaId, TokenKind,
};
