//! The record store bundle: one fixed-record-size file per store kind, all
//! going through the shared page-cache layer.

pub mod file;
pub mod meta;
pub mod record;

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Result;
use crate::id::IdType;
use crate::types::KernelVersion;

pub use file::RecordFile;
pub use meta::{MetaDataStore, MetaPosition};
pub use record::{
    DynRecord, MetaDataRecord, NodeRecord, PropertyRecord, RecordCodec, RecordLoad,
    RelationshipGroupRecord, RelationshipRecord, SchemaRecord, TokenRecord,
};

/// File metadata reported for backup and replay enumeration.
#[derive(Clone, Debug)]
pub struct StoreFileMetadata {
    pub path: PathBuf,
    pub record_size: usize,
    /// Replayable files can be reconstructed from the transaction log;
    /// atomic files (counts, degrees) must be copied under a checkpoint.
    pub replayable: bool,
}

pub struct Stores {
    dir: PathBuf,
    pub nodes: RecordFile<NodeRecord>,
    pub relationships: RecordFile<RelationshipRecord>,
    pub groups: RecordFile<RelationshipGroupRecord>,
    pub properties: RecordFile<PropertyRecord>,
    pub strings: RecordFile<DynRecord>,
    pub arrays: RecordFile<DynRecord>,
    pub schemas: RecordFile<SchemaRecord>,
    pub tokens: RecordFile<TokenRecord>,
    pub meta: MetaDataStore,
}

impl Stores {
    pub fn open(dir: &Path, config: &Config, initial_version: KernelVersion) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let pages = config.page_cache_pages;
        Ok(Self {
            dir: dir.to_path_buf(),
            nodes: RecordFile::open(&dir.join("nodes.store"), Some(IdType::Node), 0, pages)?,
            relationships: RecordFile::open(
                &dir.join("relationships.store"),
                Some(IdType::Relationship),
                0,
                pages,
            )?,
            groups: RecordFile::open(
                &dir.join("groups.store"),
                Some(IdType::RelationshipGroup),
                0,
                pages,
            )?,
            properties: RecordFile::open(
                &dir.join("properties.store"),
                Some(IdType::Property),
                0,
                pages,
            )?,
            strings: RecordFile::open(
                &dir.join("strings.store"),
                Some(IdType::StringBlock),
                0,
                pages,
            )?,
            arrays: RecordFile::open(
                &dir.join("arrays.store"),
                Some(IdType::ArrayBlock),
                0,
                pages,
            )?,
            schemas: RecordFile::open(&dir.join("schema.store"), Some(IdType::Schema), 0, pages)?,
            tokens: RecordFile::open(&dir.join("tokens.store"), Some(IdType::Token), 0, pages)?,
            meta: MetaDataStore::open(&dir.join("meta.store"), initial_version, pages)?,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Flushes every store; record stores first, meta-data last so the
    /// version and tx stamps never get ahead of the data they describe.
    pub fn flush_all(&self) -> Result<()> {
        self.nodes.flush()?;
        self.relationships.flush()?;
        self.groups.flush()?;
        self.properties.flush()?;
        self.strings.flush()?;
        self.arrays.flush()?;
        self.schemas.flush()?;
        self.tokens.flush()?;
        self.meta.flush()?;
        Ok(())
    }

    /// Releases the bundle in reverse open order.
    pub fn shutdown(&self) -> Result<()> {
        self.meta.flush()?;
        self.tokens.flush()?;
        self.schemas.flush()?;
        self.arrays.flush()?;
        self.strings.flush()?;
        self.properties.flush()?;
        self.groups.flush()?;
        self.relationships.flush()?;
        self.nodes.flush()?;
        Ok(())
    }

    pub fn replayable_files(&self) -> Vec<StoreFileMetadata> {
        let entry = |path: &Path, record_size: usize| StoreFileMetadata {
            path: path.to_path_buf(),
            record_size,
            replayable: true,
        };
        vec![
            entry(self.nodes.storage_path(), self.nodes.record_size()),
            entry(
                self.relationships.storage_path(),
                self.relationships.record_size(),
            ),
            entry(self.groups.storage_path(), self.groups.record_size()),
            entry(
                self.properties.storage_path(),
                self.properties.record_size(),
            ),
            entry(self.strings.storage_path(), self.strings.record_size()),
            entry(self.arrays.storage_path(), self.arrays.record_size()),
            entry(self.schemas.storage_path(), self.schemas.record_size()),
            entry(self.tokens.storage_path(), self.tokens.record_size()),
            entry(self.meta.storage_path(), self.meta.record_size()),
        ]
    }
}

impl RecordFile<DynRecord> {
    /// Reads a spilled value by walking its block chain.
    pub fn read_chain(&self, first_block: u64, total_len: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total_len as usize);
        let mut next = first_block;
        while !crate::types::is_null(next) {
            let block = self.read(next, RecordLoad::Normal)?;
            out.extend_from_slice(&block.payload);
            next = block.next_block;
        }
        if out.len() != total_len as usize {
            return Err(crate::error::StoreError::Corruption(format!(
                "dynamic chain at {first_block} has {} bytes, expected {total_len}",
                out.len()
            )));
        }
        Ok(out)
    }
}
