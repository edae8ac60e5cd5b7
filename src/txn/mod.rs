//! Transaction-side machinery: record-state staging, visitors, commands,
//! and the log serialization.

pub mod command;
pub mod log;
pub mod state;
pub mod visitor;

pub use command::{Command, CommandBatch, RecordPair};
pub use log::{deserialize_commands, serialize_commands, TransactionLog};
pub use state::{RecordChanges, TransactionRecordState};
pub use visitor::{CountingVisitor, RecordStateVisitor, TransactionState, TxStateVisitor};
