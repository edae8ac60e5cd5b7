use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::id::{IdType, IdUpdateListener};
use crate::page::PageFile;
use crate::store::record::{RecordCodec, RecordLoad};

const STORE_MAGIC: &[u8; 8] = b"TRLSTOR\0";
const STORE_FORMAT_VERSION: u16 = 1;
pub const STORE_HEADER_SIZE: usize = 32;

/// A typed, fixed-record-size store file. Records are addressed by id;
/// ordering of writes is the applier's responsibility, not the store's.
pub struct RecordFile<R: RecordCodec> {
    path: PathBuf,
    pages: Mutex<PageFile>,
    high_id: AtomicU64,
    reserved_low_ids: u64,
    id_type: Option<IdType>,
    _record: PhantomData<R>,
}

impl<R: RecordCodec> RecordFile<R> {
    pub fn open(
        path: &Path,
        id_type: Option<IdType>,
        reserved_low_ids: u64,
        cache_pages: usize,
    ) -> Result<Self> {
        let mut pages = PageFile::open(path, cache_pages)?;
        let high_id = if pages.is_empty() {
            let mut header = [0u8; STORE_HEADER_SIZE];
            header[0..8].copy_from_slice(STORE_MAGIC);
            header[8..10].copy_from_slice(&STORE_FORMAT_VERSION.to_be_bytes());
            header[10..14].copy_from_slice(&(R::RECORD_SIZE as u32).to_be_bytes());
            header[14..18].copy_from_slice(&(reserved_low_ids as u32).to_be_bytes());
            pages.write_at(0, &header)?;
            pages.flush()?;
            reserved_low_ids
        } else {
            let mut header = [0u8; STORE_HEADER_SIZE];
            pages.read_at(0, &mut header)?;
            if &header[0..8] != STORE_MAGIC {
                return Err(StoreError::Corruption(format!(
                    "{} store has a bad magic header",
                    R::STORE_NAME
                )));
            }
            let version = u16::from_be_bytes([header[8], header[9]]);
            if version != STORE_FORMAT_VERSION {
                return Err(StoreError::FormatMismatch(format!(
                    "{} store format version {version}, expected {STORE_FORMAT_VERSION}",
                    R::STORE_NAME
                )));
            }
            let record_size =
                u32::from_be_bytes([header[10], header[11], header[12], header[13]]) as usize;
            if record_size != R::RECORD_SIZE {
                return Err(StoreError::FormatMismatch(format!(
                    "{} store record size {record_size}, expected {}",
                    R::STORE_NAME,
                    R::RECORD_SIZE
                )));
            }
            let data_len = pages.len().saturating_sub(STORE_HEADER_SIZE as u64);
            let scanned = data_len.div_ceil(R::RECORD_SIZE as u64);
            scanned.max(reserved_low_ids)
        };
        Ok(Self {
            path: path.to_path_buf(),
            pages: Mutex::new(pages),
            high_id: AtomicU64::new(high_id),
            reserved_low_ids,
            id_type,
            _record: PhantomData,
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.path
    }

    pub fn record_size(&self) -> usize {
        R::RECORD_SIZE
    }

    pub fn reserved_low_ids(&self) -> u64 {
        self.reserved_low_ids
    }

    pub fn id_type(&self) -> Option<IdType> {
        self.id_type
    }

    /// One past the highest id ever written.
    pub fn high_id(&self) -> u64 {
        self.high_id.load(Ordering::Acquire)
    }

    pub fn bump_high_id(&self, id: u64) {
        self.high_id.fetch_max(id + 1, Ordering::AcqRel);
    }

    pub fn new_record(&self, id: u64) -> R {
        R::new_record(id)
    }

    fn offset(id: u64) -> u64 {
        STORE_HEADER_SIZE as u64 + id * R::RECORD_SIZE as u64
    }

    /// Reads the record at `id`. Under `Check` a not-in-use record comes back
    /// as an empty record with `in_use() == false` rather than an error.
    pub fn read(&self, id: u64, mode: RecordLoad) -> Result<R> {
        if id >= self.high_id() {
            return match mode {
                RecordLoad::Normal => Err(StoreError::NotInUse {
                    store: R::STORE_NAME,
                    id,
                }),
                RecordLoad::Always | RecordLoad::Check => Ok(R::new_record(id)),
            };
        }
        let mut buf = vec![0u8; R::RECORD_SIZE];
        self.pages.lock().read_at(Self::offset(id), &mut buf)?;
        let record = R::decode(id, &buf)?;
        if !record.in_use() && mode == RecordLoad::Normal {
            return Err(StoreError::NotInUse {
                store: R::STORE_NAME,
                id,
            });
        }
        Ok(record)
    }

    /// Writes the record and reports the id transition to the listener: an
    /// in-use record marks its id used, a not-in-use record marks it freed.
    pub fn write(&self, record: &R, listener: &mut dyn IdUpdateListener) -> Result<()> {
        let id = record.id();
        let mut buf = vec![0u8; R::RECORD_SIZE];
        record.encode(&mut buf);
        self.pages.lock().write_at(Self::offset(id), &buf)?;
        self.bump_high_id(id);
        if let Some(id_type) = self.id_type {
            if record.in_use() {
                listener.id_used(id_type, id);
            } else {
                listener.id_freed(id_type, id);
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.pages.lock().flush()
    }

    /// Visits every record from the reserved area up to the high id, loaded
    /// with `Always`. Used by the counts rebuild and maintenance scans.
    pub fn scan(&self, mut visit: impl FnMut(&R) -> Result<()>) -> Result<()> {
        for id in self.reserved_low_ids..self.high_id() {
            let record = self.read(id, RecordLoad::Always)?;
            visit(&record)?;
        }
        Ok(())
    }
}
