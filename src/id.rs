//! Per-store id allocation with a free-list and a durable high-water mark.
//! Freed ids sit behind a reuse barrier until the transaction that freed them
//! is durably committed.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Highest allocatable id; `u64::MAX` is the null reference.
pub const MAX_ID: u64 = u64::MAX - 1;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum IdType {
    Node,
    Relationship,
    RelationshipGroup,
    Property,
    StringBlock,
    ArrayBlock,
    Schema,
    Token,
}

impl IdType {
    pub const ALL: [IdType; 8] = [
        IdType::Node,
        IdType::Relationship,
        IdType::RelationshipGroup,
        IdType::Property,
        IdType::StringBlock,
        IdType::ArrayBlock,
        IdType::Schema,
        IdType::Token,
    ];

    pub fn name(self) -> &'static str {
        match self {
            IdType::Node => "node",
            IdType::Relationship => "relationship",
            IdType::RelationshipGroup => "relationship-group",
            IdType::Property => "property",
            IdType::StringBlock => "string-block",
            IdType::ArrayBlock => "array-block",
            IdType::Schema => "schema",
            IdType::Token => "token",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            IdType::Node => "nodes.id",
            IdType::Relationship => "relationships.id",
            IdType::RelationshipGroup => "groups.id",
            IdType::Property => "properties.id",
            IdType::StringBlock => "strings.id",
            IdType::ArrayBlock => "arrays.id",
            IdType::Schema => "schema.id",
            IdType::Token => "tokens.id",
        }
    }

    pub fn index(self) -> usize {
        match self {
            IdType::Node => 0,
            IdType::Relationship => 1,
            IdType::RelationshipGroup => 2,
            IdType::Property => 3,
            IdType::StringBlock => 4,
            IdType::ArrayBlock => 5,
            IdType::Schema => 6,
            IdType::Token => 7,
        }
    }
}

/// Observer of id transitions during record writes.
pub trait IdUpdateListener {
    fn id_used(&mut self, id_type: IdType, id: u64);
    fn id_freed(&mut self, id_type: IdType, id: u64);
}

/// Listener that drops every notification; reverse recovery applies with
/// this.
pub struct IgnoreIdUpdates;

impl IdUpdateListener for IgnoreIdUpdates {
    fn id_used(&mut self, _id_type: IdType, _id: u64) {}
    fn id_freed(&mut self, _id_type: IdType, _id: u64) {}
}

/// Listener that batches transitions for the per-generator work-sync queues.
pub struct EnqueuingIdUpdates {
    used: Vec<Vec<u64>>,
    freed: Vec<Vec<u64>>,
}

impl EnqueuingIdUpdates {
    pub fn new() -> Self {
        Self {
            used: (0..IdType::ALL.len()).map(|_| Vec::new()).collect(),
            freed: (0..IdType::ALL.len()).map(|_| Vec::new()).collect(),
        }
    }

    /// Drains the batched transitions as one work unit per id type.
    pub fn drain(&mut self, freeing_tx: u64) -> Vec<(IdType, IdUpdateWork)> {
        let mut out = Vec::new();
        for id_type in IdType::ALL {
            let used = std::mem::take(&mut self.used[id_type.index()]);
            let freed = std::mem::take(&mut self.freed[id_type.index()]);
            if used.is_empty() && freed.is_empty() {
                continue;
            }
            out.push((
                id_type,
                IdUpdateWork {
                    used,
                    freed,
                    freeing_tx,
                },
            ));
        }
        out
    }
}

impl IdUpdateListener for EnqueuingIdUpdates {
    fn id_used(&mut self, id_type: IdType, id: u64) {
        self.used[id_type.index()].push(id);
    }

    fn id_freed(&mut self, id_type: IdType, id: u64) {
        self.freed[id_type.index()].push(id);
    }
}

/// Unit of work drained into one id generator by its work-sync coordinator.
#[derive(Debug)]
pub struct IdUpdateWork {
    pub used: Vec<u64>,
    pub freed: Vec<u64>,
    pub freeing_tx: u64,
}

impl crate::worksync::Work<std::sync::Arc<IdGenerator>> for IdUpdateWork {
    fn apply(self, generator: &mut std::sync::Arc<IdGenerator>) -> Result<()> {
        for id in self.used {
            generator.mark_used(id);
        }
        for id in self.freed {
            generator.free(id, self.freeing_tx);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    high_id: u64,
    /// Reusable now.
    free: VecDeque<u64>,
    /// Freed but still behind the reuse barrier, stamped with the freeing tx.
    pending: Vec<(u64, u64)>,
}

/// Allocator for one id space. `allocate` never blocks; the free-list is
/// refilled only by [`IdGenerator::commit_barrier`].
#[derive(Debug)]
pub struct IdGenerator {
    id_type: IdType,
    path: PathBuf,
    state: Mutex<GeneratorState>,
}

const ID_FILE_MAGIC: &[u8; 8] = b"TRLIDGN\0";

impl IdGenerator {
    pub fn open(dir: &Path, id_type: IdType) -> Result<Self> {
        let path = dir.join(id_type.file_name());
        let state = match File::open(&path) {
            Ok(mut file) => Self::load(&mut file, id_type)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => GeneratorState::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            id_type,
            path,
            state: Mutex::new(state),
        })
    }

    fn load(file: &mut File, id_type: IdType) -> Result<GeneratorState> {
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if &header != ID_FILE_MAGIC {
            return Err(StoreError::Corruption(format!(
                "{} id file has a bad magic header",
                id_type.name()
            )));
        }
        let mut word = [0u8; 8];
        file.read_exact(&mut word)?;
        let high_id = u64::from_be_bytes(word);
        let mut count_buf = [0u8; 4];
        file.read_exact(&mut count_buf)?;
        let count = u32::from_be_bytes(count_buf);
        let mut free = VecDeque::with_capacity(count as usize);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&high_id.to_be_bytes());
        hasher.update(&count_buf);
        for _ in 0..count {
            file.read_exact(&mut word)?;
            hasher.update(&word);
            free.push_back(u64::from_be_bytes(word));
        }
        file.read_exact(&mut count_buf)?;
        if u32::from_be_bytes(count_buf) != hasher.finalize() {
            return Err(StoreError::Corruption(format!(
                "{} id file checksum mismatch",
                id_type.name()
            )));
        }
        Ok(GeneratorState {
            high_id,
            free,
            pending: Vec::new(),
        })
    }

    pub fn id_type(&self) -> IdType {
        self.id_type
    }

    /// Hands out a reusable id if one is past the barrier, else a fresh one.
    pub fn allocate(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop_front() {
            return Ok(id);
        }
        if state.high_id > MAX_ID {
            return Err(StoreError::OutOfIds(self.id_type));
        }
        let id = state.high_id;
        state.high_id += 1;
        Ok(id)
    }

    /// Parks a freed id behind the reuse barrier. Replayed frees of an id
    /// already parked or reusable are dropped.
    pub fn free(&self, id: u64, freeing_tx: u64) {
        let mut state = self.state.lock();
        if state.free.contains(&id) || state.pending.iter().any(|&(_, pending)| pending == id) {
            return;
        }
        state.pending.push((freeing_tx, id));
    }

    /// Records an externally chosen id as used; recovery replay calls this
    /// for every id observed in the log.
    pub fn mark_used(&self, id: u64) {
        let mut state = self.state.lock();
        if id >= state.high_id {
            state.high_id = id + 1;
        }
        state.free.retain(|&free_id| free_id != id);
        state.pending.retain(|&(_, pending_id)| pending_id != id);
    }

    /// Releases pending ids freed by transactions at or below the durably
    /// committed horizon.
    pub fn commit_barrier(&self, durable_tx: u64) {
        let mut state = self.state.lock();
        let mut kept = Vec::with_capacity(state.pending.len());
        let mut released = 0usize;
        for (tx, id) in std::mem::take(&mut state.pending) {
            if tx <= durable_tx {
                state.free.push_back(id);
                released += 1;
            } else {
                kept.push((tx, id));
            }
        }
        state.pending = kept;
        if released > 0 {
            debug!(
                id_type = self.id_type.name(),
                released, durable_tx, "released freed ids past reuse barrier"
            );
        }
    }

    pub fn high_id(&self) -> u64 {
        self.state.lock().high_id
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Advances the reuse barrier and persists high id plus free-list.
    pub fn checkpoint(&self, durable_tx: u64) -> Result<()> {
        self.commit_barrier(durable_tx);
        let state = self.state.lock();
        let mut body = Vec::with_capacity(12 + state.free.len() * 8);
        body.extend_from_slice(&state.high_id.to_be_bytes());
        body.extend_from_slice(&(state.free.len() as u32).to_be_bytes());
        for &id in &state.free {
            body.extend_from_slice(&id.to_be_bytes());
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let checksum = hasher.finalize();
        drop(state);

        let tmp_path = self.path.with_extension("id.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(ID_FILE_MAGIC)?;
        file.write_all(&body)?;
        file.write_all(&checksum.to_be_bytes())?;
        file.sync_data()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// One generator per id space, opened together from the store directory.
#[derive(Debug)]
pub struct IdGenerators {
    generators: Vec<std::sync::Arc<IdGenerator>>,
}

impl IdGenerators {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut generators = Vec::with_capacity(IdType::ALL.len());
        for id_type in IdType::ALL {
            generators.push(std::sync::Arc::new(IdGenerator::open(dir, id_type)?));
        }
        Ok(Self { generators })
    }

    pub fn get(&self, id_type: IdType) -> &std::sync::Arc<IdGenerator> {
        &self.generators[id_type.index()]
    }

    pub fn allocate(&self, id_type: IdType) -> Result<u64> {
        self.get(id_type).allocate()
    }

    /// Checkpoints every generator against the durable transaction horizon.
    pub fn checkpoint_all(&self, durable_tx: u64) -> Result<()> {
        for generator in &self.generators {
            generator.checkpoint(durable_tx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_sequential() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let generator = IdGenerator::open(dir.path(), IdType::Node)?;
        assert_eq!(generator.allocate()?, 0);
        assert_eq!(generator.allocate()?, 1);
        assert_eq!(generator.allocate()?, 2);
        Ok(())
    }

    #[test]
    fn freed_ids_wait_behind_the_barrier() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let generator = IdGenerator::open(dir.path(), IdType::Node)?;
        for _ in 0..5 {
            generator.allocate()?;
        }
        generator.free(2, 10);
        // Not reusable before the freeing transaction is durable.
        assert_eq!(generator.allocate()?, 5);
        generator.commit_barrier(9);
        assert_eq!(generator.allocate()?, 6);
        generator.commit_barrier(10);
        assert_eq!(generator.allocate()?, 2);
        Ok(())
    }

    #[test]
    fn mark_used_bumps_high_water_and_unfrees() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let generator = IdGenerator::open(dir.path(), IdType::Relationship)?;
        generator.mark_used(41);
        assert_eq!(generator.allocate()?, 42);
        generator.free(7, 1);
        generator.commit_barrier(1);
        generator.mark_used(7);
        assert_ne!(generator.allocate()?, 7);
        Ok(())
    }

    #[test]
    fn checkpoint_roundtrips_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let generator = IdGenerator::open(dir.path(), IdType::Property)?;
            for _ in 0..10 {
                generator.allocate()?;
            }
            generator.free(3, 1);
            generator.free(6, 1);
            generator.checkpoint(1)?;
        }
        let generator = IdGenerator::open(dir.path(), IdType::Property)?;
        assert_eq!(generator.high_id(), 10);
        assert_eq!(generator.free_count(), 2);
        assert_eq!(generator.allocate()?, 3);
        assert_eq!(generator.allocate()?, 6);
        assert_eq!(generator.allocate()?, 10);
        Ok(())
    }
}
