//! Counts and group-degrees stores. Sparse keyed 64-bit counters mutated
//! only through the applier chain and checkpointed ahead of the record
//! stores. Neither file is replayable from the log; both report as atomic
//! for backup purposes.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::types::Direction;

/// Wildcard slot in a counts key.
pub const ANY: i64 = -1;

/// Namespace of a counter; node and relationship totals share the wildcard
/// tuple and must not collide.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum CountsKind {
    Node = 0,
    Relationship = 1,
}

impl CountsKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Node),
            1 => Ok(Self::Relationship),
            other => Err(StoreError::Corruption(format!(
                "unknown counts key kind: {other}"
            ))),
        }
    }
}

/// `(label | ANY, relType | ANY, otherLabel | ANY)` within a namespace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CountsKey {
    pub kind: CountsKind,
    pub label: i64,
    pub rel_type: i64,
    pub other_label: i64,
}

impl CountsKey {
    pub fn node(label: i64) -> Self {
        Self {
            kind: CountsKind::Node,
            label,
            rel_type: ANY,
            other_label: ANY,
        }
    }

    pub fn relationship(start_label: i64, rel_type: i64, end_label: i64) -> Self {
        Self {
            kind: CountsKind::Relationship,
            label: start_label,
            rel_type,
            other_label: end_label,
        }
    }
}

const COUNTS_MAGIC: &[u8; 8] = b"TRLCNTS\0";
const DEGREES_MAGIC: &[u8; 8] = b"TRLDEGS\0";
const FILE_FORMAT_VERSION: u16 = 1;

fn load_entries<K: Ord + Copy>(
    path: &Path,
    magic: &[u8; 8],
    decode_key: impl Fn(&[u8]) -> Result<K>,
    key_len: usize,
) -> Result<Option<(BTreeMap<K, i64>, u64)>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut header = [0u8; 22];
    file.read_exact(&mut header)?;
    if &header[0..8] != magic {
        return Err(StoreError::Corruption(format!(
            "counter file {} has a bad magic header",
            path.display()
        )));
    }
    let version = u16::from_be_bytes([header[8], header[9]]);
    if version != FILE_FORMAT_VERSION {
        return Err(StoreError::FormatMismatch(format!(
            "counter file {} format version {version}",
            path.display()
        )));
    }
    let count = u32::from_be_bytes([header[10], header[11], header[12], header[13]]);
    let mut last_tx_buf = [0u8; 8];
    last_tx_buf.copy_from_slice(&header[14..22]);
    let last_applied_tx = u64::from_be_bytes(last_tx_buf);
    let mut body = vec![0u8; count as usize * (key_len + 8)];
    file.read_exact(&mut body)?;
    let mut crc_buf = [0u8; 4];
    file.read_exact(&mut crc_buf)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[10..22]);
    hasher.update(&body);
    if u32::from_be_bytes(crc_buf) != hasher.finalize() {
        return Err(StoreError::Corruption(format!(
            "counter file {} checksum mismatch",
            path.display()
        )));
    }
    let mut entries = BTreeMap::new();
    for chunk in body.chunks_exact(key_len + 8) {
        let key = decode_key(&chunk[..key_len])?;
        let mut value = [0u8; 8];
        value.copy_from_slice(&chunk[key_len..]);
        entries.insert(key, i64::from_be_bytes(value));
    }
    Ok(Some((entries, last_applied_tx)))
}

fn store_entries<K: Copy>(
    path: &Path,
    magic: &[u8; 8],
    entries: &BTreeMap<K, i64>,
    last_applied_tx: u64,
    encode_key: impl Fn(K, &mut Vec<u8>),
    key_len: usize,
) -> Result<()> {
    let mut body = Vec::with_capacity(entries.len() * (key_len + 8));
    for (&key, &value) in entries {
        encode_key(key, &mut body);
        body.extend_from_slice(&value.to_be_bytes());
    }
    let count = (entries.len() as u32).to_be_bytes();
    let last_tx = last_applied_tx.to_be_bytes();
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&count);
    hasher.update(&last_tx);
    hasher.update(&body);
    let checksum = hasher.finalize();

    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(magic)?;
    file.write_all(&FILE_FORMAT_VERSION.to_be_bytes())?;
    file.write_all(&count)?;
    file.write_all(&last_tx)?;
    file.write_all(&body)?;
    file.write_all(&checksum.to_be_bytes())?;
    file.sync_data()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug)]
pub struct CountsStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<CountsKey, i64>>,
    /// Highest transaction whose deltas have been applied; replaying an
    /// already-applied transaction is a no-op.
    last_applied_tx: AtomicU64,
    needed_rebuild: bool,
}

impl CountsStore {
    pub fn open(path: &Path) -> Result<Self> {
        let loaded = load_entries(
            path,
            COUNTS_MAGIC,
            |buf| {
                let kind = CountsKind::from_byte(buf[0])?;
                let mut word = [0u8; 8];
                word.copy_from_slice(&buf[1..9]);
                let label = i64::from_be_bytes(word);
                word.copy_from_slice(&buf[9..17]);
                let rel_type = i64::from_be_bytes(word);
                word.copy_from_slice(&buf[17..25]);
                let other_label = i64::from_be_bytes(word);
                Ok(CountsKey {
                    kind,
                    label,
                    rel_type,
                    other_label,
                })
            },
            25,
        )?;
        let needed_rebuild = loaded.is_none();
        let (entries, last_applied_tx) = loaded.unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
            last_applied_tx: AtomicU64::new(last_applied_tx),
            needed_rebuild,
        })
    }

    /// Marks `tx_id` as applied; returns false when its deltas were already
    /// folded in, so recovery replay stays idempotent.
    pub fn begin_tx(&self, tx_id: u64) -> bool {
        let last = self.last_applied_tx.load(Ordering::Acquire);
        if tx_id <= last {
            return false;
        }
        self.last_applied_tx.store(tx_id, Ordering::Release);
        true
    }

    pub fn last_applied_tx(&self) -> u64 {
        self.last_applied_tx.load(Ordering::Acquire)
    }

    /// Whether the file was missing at open; the engine rebuilds from the
    /// record stores before first use.
    pub fn needs_rebuild(&self) -> bool {
        self.needed_rebuild
    }

    pub fn rebuild(
        &self,
        entries: impl IntoIterator<Item = (CountsKey, i64)>,
        last_applied_tx: u64,
    ) -> Result<()> {
        warn!("Missing counts store, rebuilding it.");
        let mut guard = self.entries.write();
        guard.clear();
        for (key, value) in entries {
            if value != 0 {
                guard.insert(key, value);
            }
        }
        drop(guard);
        self.last_applied_tx.store(last_applied_tx, Ordering::Release);
        warn!("Counts store rebuild completed.");
        self.checkpoint()
    }

    pub fn apply_delta(&self, key: CountsKey, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut entries = self.entries.write();
        let slot = entries.entry(key).or_insert(0);
        *slot += delta;
        if *slot == 0 {
            entries.remove(&key);
        }
    }

    pub fn get(&self, key: CountsKey) -> i64 {
        self.entries.read().get(&key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<CountsKey, i64> {
        self.entries.read().clone()
    }

    pub fn checkpoint(&self) -> Result<()> {
        let entries = self.entries.read().clone();
        store_entries(
            &self.path,
            COUNTS_MAGIC,
            &entries,
            self.last_applied_tx.load(Ordering::Acquire),
            |key, out| {
                out.push(key.kind as u8);
                out.extend_from_slice(&key.label.to_be_bytes());
                out.extend_from_slice(&key.rel_type.to_be_bytes());
                out.extend_from_slice(&key.other_label.to_be_bytes());
            },
            25,
        )
    }

    pub fn storage_path(&self) -> &Path {
        &self.path
    }
}

/// Per-transaction accumulation of counter deltas, extracted as counts
/// commands in key order.
#[derive(Default, Debug)]
pub struct CountsDelta {
    entries: BTreeMap<CountsKey, i64>,
}

impl CountsDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: CountsKey, delta: i64) {
        if delta == 0 {
            return;
        }
        let slot = self.entries.entry(key).or_insert(0);
        *slot += delta;
        if *slot == 0 {
            self.entries.remove(&key);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending key order, the durable command order.
    pub fn entries(&self) -> impl Iterator<Item = (CountsKey, i64)> + '_ {
        self.entries.iter().map(|(&key, &delta)| (key, delta))
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct DegreesKey {
    pub group: u64,
    pub direction: Direction,
}

/// Directed degree counters for dense chains that keep their degree outside
/// the chain head record.
#[derive(Debug)]
pub struct GroupDegreesStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<DegreesKey, i64>>,
    last_applied_tx: AtomicU64,
}

impl GroupDegreesStore {
    pub fn open(path: &Path) -> Result<Self> {
        let loaded = load_entries(
            path,
            DEGREES_MAGIC,
            |buf| {
                let mut word = [0u8; 8];
                word.copy_from_slice(&buf[0..8]);
                Ok(DegreesKey {
                    group: u64::from_be_bytes(word),
                    direction: Direction::from_byte(buf[8])?,
                })
            },
            9,
        )?;
        let (entries, last_applied_tx) = loaded.unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
            last_applied_tx: AtomicU64::new(last_applied_tx),
        })
    }

    /// See [`CountsStore::begin_tx`].
    pub fn begin_tx(&self, tx_id: u64) -> bool {
        let last = self.last_applied_tx.load(Ordering::Acquire);
        if tx_id <= last {
            return false;
        }
        self.last_applied_tx.store(tx_id, Ordering::Release);
        true
    }

    pub fn increment(&self, group: u64, direction: Direction, delta: i64) {
        if delta == 0 {
            return;
        }
        let key = DegreesKey { group, direction };
        let mut entries = self.entries.write();
        let slot = entries.entry(key).or_insert(0);
        *slot += delta;
        if *slot == 0 {
            entries.remove(&key);
        }
    }

    pub fn degree(&self, group: u64, direction: Direction) -> i64 {
        self.entries
            .read()
            .get(&DegreesKey { group, direction })
            .copied()
            .unwrap_or(0)
    }

    pub fn checkpoint(&self) -> Result<()> {
        let entries = self.entries.read().clone();
        store_entries(
            &self.path,
            DEGREES_MAGIC,
            &entries,
            self.last_applied_tx.load(Ordering::Acquire),
            |key, out| {
                out.extend_from_slice(&key.group.to_be_bytes());
                out.push(key.direction.as_byte());
            },
            9,
        )
    }

    pub fn storage_path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate_and_zero_entries_vanish() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let counts = CountsStore::open(&dir.path().join("counts.db"))?;
        let key = CountsKey::node(3);
        counts.apply_delta(key, 2);
        counts.apply_delta(key, 1);
        assert_eq!(counts.get(key), 3);
        counts.apply_delta(key, -3);
        assert_eq!(counts.get(key), 0);
        assert!(counts.snapshot().is_empty());
        Ok(())
    }

    #[test]
    fn checkpoint_roundtrips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("counts.db");
        {
            let counts = CountsStore::open(&path)?;
            assert!(counts.needs_rebuild());
            counts.apply_delta(CountsKey::node(1), 7);
            counts.apply_delta(CountsKey::relationship(1, 2, ANY), 4);
            counts.checkpoint()?;
        }
        let counts = CountsStore::open(&path)?;
        assert!(!counts.needs_rebuild());
        assert_eq!(counts.get(CountsKey::node(1)), 7);
        assert_eq!(counts.get(CountsKey::relationship(1, 2, ANY)), 4);
        Ok(())
    }

    #[test]
    fn degrees_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("degrees.db");
        {
            let degrees = GroupDegreesStore::open(&path)?;
            degrees.increment(9, Direction::Outgoing, 12);
            degrees.increment(9, Direction::Incoming, 5);
            degrees.checkpoint()?;
        }
        let degrees = GroupDegreesStore::open(&path)?;
        assert_eq!(degrees.degree(9, Direction::Outgoing), 12);
        assert_eq!(degrees.degree(9, Direction::Incoming), 5);
        assert_eq!(degrees.degree(9, Direction::Loop), 0);
        Ok(())
    }
}
