use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};
use crate::id::IgnoreIdUpdates;
use crate::store::file::RecordFile;
use crate::store::record::{MetaDataRecord, RecordLoad};
use crate::types::KernelVersion;

/// Fixed record slots of the meta-data store.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MetaPosition {
    StoreId = 0,
    KernelVersion = 1,
    LastCommittedTx = 2,
}

impl MetaPosition {
    pub const COUNT: u64 = 3;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::StoreId),
            1 => Ok(Self::KernelVersion),
            2 => Ok(Self::LastCommittedTx),
            other => Err(StoreError::Corruption(format!(
                "unknown meta-data position: {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn record_id(self) -> u64 {
        self as u64
    }
}

/// Meta-data store: a handful of named single-value records occupying the
/// reserved low ids of its file.
pub struct MetaDataStore {
    file: RecordFile<MetaDataRecord>,
}

impl MetaDataStore {
    pub fn open(path: &Path, initial_version: KernelVersion, cache_pages: usize) -> Result<Self> {
        let file: RecordFile<MetaDataRecord> =
            RecordFile::open(path, None, MetaPosition::COUNT, cache_pages)?;
        let store = Self { file };
        if !store
            .file
            .read(MetaPosition::StoreId.record_id(), RecordLoad::Check)?
            .in_use
        {
            store.set(MetaPosition::StoreId, generate_store_id())?;
            store.set(MetaPosition::KernelVersion, initial_version.as_byte() as u64)?;
            store.set(MetaPosition::LastCommittedTx, 0)?;
            store.file.flush()?;
        }
        Ok(store)
    }

    pub fn get(&self, position: MetaPosition) -> Result<u64> {
        let record = self.file.read(position.record_id(), RecordLoad::Normal)?;
        Ok(record.value)
    }

    pub fn set(&self, position: MetaPosition, value: u64) -> Result<()> {
        let record = MetaDataRecord {
            id: position.record_id(),
            in_use: true,
            value,
        };
        self.file.write(&record, &mut IgnoreIdUpdates)
    }

    pub fn store_id(&self) -> Result<u64> {
        self.get(MetaPosition::StoreId)
    }

    pub fn kernel_version(&self) -> Result<KernelVersion> {
        let raw = self.get(MetaPosition::KernelVersion)?;
        let byte = u8::try_from(raw).map_err(|_| {
            StoreError::FormatMismatch(format!("kernel version value out of range: {raw}"))
        })?;
        KernelVersion::from_byte(byte)
    }

    pub fn last_committed_tx(&self) -> Result<u64> {
        self.get(MetaPosition::LastCommittedTx)
    }

    pub fn set_last_committed_tx(&self, tx_id: u64) -> Result<()> {
        self.set(MetaPosition::LastCommittedTx, tx_id)
    }

    pub fn new_record(&self, position: MetaPosition, value: u64) -> MetaDataRecord {
        MetaDataRecord {
            id: position.record_id(),
            in_use: true,
            value,
        }
    }

    pub fn write_record(&self, record: &MetaDataRecord) -> Result<()> {
        self.file.write(record, &mut IgnoreIdUpdates)
    }

    pub fn storage_path(&self) -> &Path {
        self.file.storage_path()
    }

    pub fn record_size(&self) -> usize {
        self.file.record_size()
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

fn generate_store_id() -> u64 {
    // Wall-clock nanos are unique enough for a store identity stamp.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
        | 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialises_and_persists_positions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("meta.store");
        let store_id;
        {
            let meta = MetaDataStore::open(&path, KernelVersion::V1, 16)?;
            store_id = meta.store_id()?;
            assert_ne!(store_id, 0);
            assert_eq!(meta.kernel_version()?, KernelVersion::V1);
            assert_eq!(meta.last_committed_tx()?, 0);
            meta.set_last_committed_tx(17)?;
            meta.flush()?;
        }
        let meta = MetaDataStore::open(&path, KernelVersion::V3, 16)?;
        // Existing stores keep their stamped version and identity.
        assert_eq!(meta.store_id()?, store_id);
        assert_eq!(meta.kernel_version()?, KernelVersion::V1);
        assert_eq!(meta.last_committed_tx()?, 17);
        Ok(())
    }
}
