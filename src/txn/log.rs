//! Command serialization and the transaction log seam. The physical log is
//! an append-only byte sink; each transaction is framed with a magic, a
//! version tag, and a crc over the serialized commands. Deserialization must
//! reproduce the command stream exactly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::counts::{CountsKey, CountsKind, ANY};
use crate::error::{Result, StoreError};
use crate::schema::SchemaRule;
use crate::store::record::{
    DynRecord, NodeRecord, PropertyRecord, RecordCodec, RelationshipGroupRecord,
    RelationshipRecord, SchemaRecord, TokenRecord,
};
use crate::store::MetaPosition;
use crate::txn::command::{Command, RecordPair};
use crate::types::{Direction, KernelVersion};

const LOG_MAGIC: &[u8; 8] = b"TRLLOG\0\0";

const TAG_NODE: u8 = 1;
const TAG_RELATIONSHIP: u8 = 2;
const TAG_GROUP: u8 = 3;
const TAG_PROPERTY: u8 = 4;
const TAG_SCHEMA: u8 = 5;
const TAG_TOKEN: u8 = 6;
const TAG_COUNTS: u8 = 7;
const TAG_DEGREES: u8 = 8;
const TAG_META_DATA: u8 = 9;

fn put_pair<R: RecordCodec>(pair: &RecordPair<R>, out: &mut Vec<u8>) {
    out.extend_from_slice(&pair.id().to_be_bytes());
    let start = out.len();
    out.resize(start + 2 * R::RECORD_SIZE, 0);
    pair.before.encode(&mut out[start..start + R::RECORD_SIZE]);
    pair.after
        .encode(&mut out[start + R::RECORD_SIZE..start + 2 * R::RECORD_SIZE]);
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.at + len > self.buf.len() {
            return Err(StoreError::Corruption(
                "serialized command stream truncated".into(),
            ));
        }
        let slice = &self.buf[self.at..self.at + len];
        self.at += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(word))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn pair<R: RecordCodec>(&mut self) -> Result<RecordPair<R>> {
        let id = self.u64()?;
        let before = R::decode(id, self.take(R::RECORD_SIZE)?)?;
        let after = R::decode(id, self.take(R::RECORD_SIZE)?)?;
        Ok(RecordPair::new(before, after))
    }

    fn exhausted(&self) -> bool {
        self.at == self.buf.len()
    }
}

/// Serializes commands in their batch order. The byte stream for a given
/// command list is stable; the log replays it byte for byte.
pub fn serialize_commands(commands: &[Command], out: &mut Vec<u8>) -> Result<()> {
    for command in commands {
        match command {
            Command::Node(pair) => {
                out.push(TAG_NODE);
                put_pair(pair, out);
            }
            Command::Relationship(pair) => {
                out.push(TAG_RELATIONSHIP);
                put_pair(pair, out);
            }
            Command::Group(pair) => {
                out.push(TAG_GROUP);
                put_pair(pair, out);
            }
            Command::Property {
                pair,
                string_blocks,
                array_blocks,
            } => {
                out.push(TAG_PROPERTY);
                put_pair(pair, out);
                out.extend_from_slice(&(string_blocks.len() as u16).to_be_bytes());
                for block in string_blocks {
                    put_pair(block, out);
                }
                out.extend_from_slice(&(array_blocks.len() as u16).to_be_bytes());
                for block in array_blocks {
                    put_pair(block, out);
                }
            }
            Command::Schema { pair, rule } => {
                out.push(TAG_SCHEMA);
                put_pair(pair, out);
                let bytes = rule.serialize()?;
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(&bytes);
            }
            Command::Token(pair) => {
                out.push(TAG_TOKEN);
                put_pair(pair, out);
            }
            Command::Counts { key, delta } => {
                out.push(TAG_COUNTS);
                out.push(key.kind as u8);
                out.extend_from_slice(&key.label.to_be_bytes());
                out.extend_from_slice(&key.rel_type.to_be_bytes());
                out.extend_from_slice(&key.other_label.to_be_bytes());
                out.extend_from_slice(&delta.to_be_bytes());
            }
            Command::Degrees {
                group,
                direction,
                delta,
            } => {
                out.push(TAG_DEGREES);
                out.extend_from_slice(&group.to_be_bytes());
                out.push(direction.as_byte());
                out.extend_from_slice(&delta.to_be_bytes());
            }
            Command::MetaData {
                position,
                before,
                after,
            } => {
                out.push(TAG_META_DATA);
                out.push(position.as_byte());
                out.extend_from_slice(&before.to_be_bytes());
                out.extend_from_slice(&after.to_be_bytes());
            }
        }
    }
    Ok(())
}

pub fn deserialize_commands(buf: &[u8]) -> Result<Vec<Command>> {
    let mut cursor = Cursor::new(buf);
    let mut commands = Vec::new();
    while !cursor.exhausted() {
        let tag = cursor.u8()?;
        let command = match tag {
            TAG_NODE => Command::Node(cursor.pair::<NodeRecord>()?),
            TAG_RELATIONSHIP => Command::Relationship(cursor.pair::<RelationshipRecord>()?),
            TAG_GROUP => Command::Group(cursor.pair::<RelationshipGroupRecord>()?),
            TAG_PROPERTY => {
                let pair = cursor.pair::<PropertyRecord>()?;
                let string_count = cursor.u16()? as usize;
                let mut string_blocks = Vec::with_capacity(string_count);
                for _ in 0..string_count {
                    string_blocks.push(cursor.pair::<DynRecord>()?);
                }
                let array_count = cursor.u16()? as usize;
                let mut array_blocks = Vec::with_capacity(array_count);
                for _ in 0..array_count {
                    array_blocks.push(cursor.pair::<DynRecord>()?);
                }
                Command::Property {
                    pair,
                    string_blocks,
                    array_blocks,
                }
            }
            TAG_SCHEMA => {
                let pair = cursor.pair::<SchemaRecord>()?;
                let len = cursor.u16()? as usize;
                let rule = SchemaRule::deserialize(cursor.take(len)?)?;
                Command::Schema { pair, rule }
            }
            TAG_TOKEN => Command::Token(cursor.pair::<TokenRecord>()?),
            TAG_COUNTS => {
                let kind = match cursor.u8()? {
                    0 => CountsKind::Node,
                    1 => CountsKind::Relationship,
                    other => {
                        return Err(StoreError::Corruption(format!(
                            "unknown counts key kind in log: {other}"
                        )))
                    }
                };
                let label = cursor.i64()?;
                let rel_type = cursor.i64()?;
                let other_label = cursor.i64()?;
                let delta = cursor.i64()?;
                debug_assert!(label >= ANY && rel_type >= ANY && other_label >= ANY);
                Command::Counts {
                    key: CountsKey {
                        kind,
                        label,
                        rel_type,
                        other_label,
                    },
                    delta,
                }
            }
            TAG_DEGREES => {
                let group = cursor.u64()?;
                let direction = Direction::from_byte(cursor.u8()?)?;
                let delta = cursor.i64()?;
                Command::Degrees {
                    group,
                    direction,
                    delta,
                }
            }
            TAG_META_DATA => {
                let position = MetaPosition::from_byte(cursor.u8()?)?;
                let before = cursor.u64()?;
                let after = cursor.u64()?;
                Command::MetaData {
                    position,
                    before,
                    after,
                }
            }
            other => {
                return Err(StoreError::FormatMismatch(format!(
                    "unknown command tag in log: {other}"
                )))
            }
        };
        commands.push(command);
    }
    Ok(commands)
}

/// File-backed transaction log used by the commit path and by recovery.
/// Frames are `{magic, tx_id, version, body_len, body, crc}`; a torn tail is
/// ignored on replay.
#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    file: Mutex<File>,
}

const FRAME_HEADER_LEN: usize = 8 + 8 + 1 + 4;

impl TransactionLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one transaction frame and forces it to disk. Once this
    /// returns, the transaction is durable and uncancellable.
    pub fn append(&self, tx_id: u64, version: KernelVersion, commands: &[Command]) -> Result<()> {
        let mut body = Vec::new();
        serialize_commands(commands, &mut body)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len() + 4);
        frame.extend_from_slice(LOG_MAGIC);
        frame.extend_from_slice(&tx_id.to_be_bytes());
        frame.push(version.as_byte());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&frame[8..]);
        frame.extend_from_slice(&hasher.finalize().to_be_bytes());

        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;
        file.sync_data()?;
        debug!(tx_id, %version, bytes = frame.len(), "appended transaction frame");
        Ok(())
    }

    /// Replays every complete frame in append order. A torn or truncated
    /// tail frame ends the replay without error.
    pub fn replay(
        &self,
        mut apply: impl FnMut(u64, KernelVersion, Vec<Command>) -> Result<()>,
    ) -> Result<u64> {
        let mut bytes = Vec::new();
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut bytes)?;
        }
        let mut at = 0usize;
        let mut last_tx = 0u64;
        while bytes.len() - at >= FRAME_HEADER_LEN + 4 {
            if &bytes[at..at + 8] != LOG_MAGIC {
                return Err(StoreError::Corruption(
                    "transaction log frame has a bad magic".into(),
                ));
            }
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at + 8..at + 16]);
            let tx_id = u64::from_be_bytes(word);
            let version = KernelVersion::from_byte(bytes[at + 16])?;
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&bytes[at + 17..at + 21]);
            let body_len = u32::from_be_bytes(len_buf) as usize;
            let frame_end = at + FRAME_HEADER_LEN + body_len + 4;
            if frame_end > bytes.len() {
                break;
            }
            let body = &bytes[at + FRAME_HEADER_LEN..at + FRAME_HEADER_LEN + body_len];
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&bytes[at + 8..at + FRAME_HEADER_LEN + body_len]);
            let mut crc_buf = [0u8; 4];
            crc_buf.copy_from_slice(&bytes[frame_end - 4..frame_end]);
            if hasher.finalize() != u32::from_be_bytes(crc_buf) {
                break;
            }
            let commands = deserialize_commands(body)?;
            apply(tx_id, version, commands)?;
            last_tx = tx_id;
            at = frame_end;
        }
        Ok(last_tx)
    }

    /// All complete frames, oldest first. Test and tooling convenience.
    pub fn transactions(&self) -> Result<Vec<(u64, KernelVersion, Vec<Command>)>> {
        let mut out = Vec::new();
        self.replay(|tx_id, version, commands| {
            out.push((tx_id, version, commands));
            Ok(())
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NULL_REFERENCE;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn node_command(id: u64) -> Command {
        let before = NodeRecord::new_record(id);
        let mut after = NodeRecord::new_record(id);
        after.in_use = true;
        after.next_rel = NULL_REFERENCE;
        Command::Node(RecordPair::new(before, after))
    }

    #[test]
    fn serialization_roundtrip_covers_every_kind() -> Result<()> {
        let mut property_after = PropertyRecord::new_record(3);
        property_after.in_use = true;
        property_after.value_kind = crate::store::record::ValueKind::Int;
        property_after
            .inline
            .extend_from_slice(&7i64.to_be_bytes());
        let mut token_after = TokenRecord::new_record(0);
        token_after.in_use = true;
        token_after.kind = crate::types::TokenKind::Label;
        token_after.name = "Person".into();
        let rule = SchemaRule {
            id: crate::types::SchemaId(5),
            kind: crate::schema::RuleKind::Index,
            entity: crate::schema::EntityKind::Node,
            entity_token: 1,
            keys: smallvec::smallvec![crate::types::KeyId(2)],
        };
        let mut schema_after = SchemaRecord::new_record(5);
        schema_after.in_use = true;
        schema_after.payload = rule.serialize()?;

        let commands = vec![
            Command::Schema {
                pair: RecordPair::new(SchemaRecord::new_record(5), schema_after),
                rule,
            },
            Command::Token(RecordPair::new(TokenRecord::new_record(0), token_after)),
            node_command(1),
            Command::Property {
                pair: RecordPair::new(PropertyRecord::new_record(3), property_after),
                string_blocks: vec![],
                array_blocks: vec![],
            },
            Command::Counts {
                key: CountsKey::node(1),
                delta: 1,
            },
            Command::Degrees {
                group: 9,
                direction: Direction::Outgoing,
                delta: 3,
            },
            Command::MetaData {
                position: MetaPosition::KernelVersion,
                before: 1,
                after: 2,
            },
        ];

        let mut bytes = Vec::new();
        serialize_commands(&commands, &mut bytes)?;
        let decoded = deserialize_commands(&bytes)?;
        assert_eq!(decoded, commands);
        Ok(())
    }

    #[test]
    fn log_replays_in_append_order_and_ignores_torn_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tx.log");
        {
            let log = TransactionLog::open(&path)?;
            log.append(1, KernelVersion::V1, &[node_command(1)])?;
            log.append(2, KernelVersion::V1, &[node_command(2)])?;
        }
        // Torn tail: half a frame of garbage.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[0xAB; 5])?;
        }
        let log = TransactionLog::open(&path)?;
        let transactions = log.transactions()?;
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].0, 1);
        assert_eq!(transactions[1].0, 2);
        Ok(())
    }

    proptest! {
        #[test]
        fn proptest_counts_and_degrees_roundtrip(
            label in -1i64..100,
            rel_type in -1i64..100,
            other in -1i64..100,
            delta in any::<i64>(),
            group in any::<u64>(),
            dir_byte in 0u8..=2,
        ) {
            let commands = vec![
                Command::Counts {
                    key: CountsKey { kind: CountsKind::Relationship, label, rel_type, other_label: other },
                    delta,
                },
                Command::Degrees {
                    group,
                    direction: Direction::from_byte(dir_byte).expect("valid direction"),
                    delta,
                },
            ];
            let mut bytes = Vec::new();
            serialize_commands(&commands, &mut bytes).expect("serialize succeeds");
            let decoded = deserialize_commands(&bytes).expect("decode succeeds");
            prop_assert_eq!(decoded, commands);
        }

        #[test]
        fn proptest_unknown_tags_rejected(tag in 10u8..=255) {
            let bytes = vec![tag, 0, 0];
            prop_assert!(deserialize_commands(&bytes).is_err());
        }

        #[test]
        fn proptest_node_pairs_roundtrip(ids in vec(any::<u64>(), 1..8)) {
            let commands: Vec<Command> = ids.into_iter().map(node_command).collect();
            let mut bytes = Vec::new();
            serialize_commands(&commands, &mut bytes).expect("serialize succeeds");
            let decoded = deserialize_commands(&bytes).expect("decode succeeds");
            prop_assert_eq!(decoded, commands);
        }
    }
}
