//! Durable per-tablet metadata record.
//!
//! File format (`<root>/tablet-meta/<tablet_id>`):
//! ```text
//!   [crc32: u32 LE] [bincode(MetadataRecord)]
//! ```
//! Writes go to a temp file which is fsynced and renamed over the old record,
//! so a crash leaves either the old or the new record, never a torn one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tablet_common::error::StorageError;
use tablet_common::types::TabletId;

use crate::fs_layout::FsLayout;
use crate::superblock::TabletSuperBlock;

/// Data state of a tablet replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletDataState {
    /// A copy is in progress; data is incomplete and must not be served.
    Copying,
    /// Data is complete and referenced by the superblock.
    Ready,
    /// Data was deliberately deleted; the record is kept as a tombstone.
    Tombstoned,
    /// Data and record are scheduled for removal.
    Deleted,
}

impl std::fmt::Display for TabletDataState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Copying => write!(f, "COPYING"),
            Self::Ready => write!(f, "READY"),
            Self::Tombstoned => write!(f, "TOMBSTONED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataRecord {
    data_state: TabletDataState,
    superblock: TabletSuperBlock,
    /// Last WAL segment seqno known when the replica was tombstoned.
    tombstone_last_logged_seqno: Option<u64>,
}

/// Shared handle to one tablet's metadata. Mutations are in memory until
/// `flush()`.
#[derive(Debug)]
pub struct TabletMetadata {
    tablet_id: TabletId,
    path: PathBuf,
    record: Mutex<MetadataRecord>,
}

impl TabletMetadata {
    /// Create (or overwrite) the metadata record for `superblock.tablet_id`
    /// and persist it.
    pub fn create(
        layout: &FsLayout,
        superblock: TabletSuperBlock,
        data_state: TabletDataState,
    ) -> Result<Arc<Self>, StorageError> {
        fs::create_dir_all(layout.metadata_dir())?;
        let meta = Arc::new(Self {
            tablet_id: superblock.tablet_id.clone(),
            path: layout.metadata_path(&superblock.tablet_id),
            record: Mutex::new(MetadataRecord {
                data_state,
                superblock,
                tombstone_last_logged_seqno: None,
            }),
        });
        meta.flush()?;
        Ok(meta)
    }

    pub fn load(layout: &FsLayout, tablet_id: &TabletId) -> Result<Arc<Self>, StorageError> {
        let path = layout.metadata_path(tablet_id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::MetadataNotFound(tablet_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let record = decode_record(&path, &bytes)?;
        Ok(Arc::new(Self {
            tablet_id: tablet_id.clone(),
            path,
            record: Mutex::new(record),
        }))
    }

    pub fn exists(layout: &FsLayout, tablet_id: &TabletId) -> bool {
        layout.metadata_path(tablet_id).exists()
    }

    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_state(&self) -> TabletDataState {
        self.record.lock().data_state
    }

    pub fn superblock(&self) -> TabletSuperBlock {
        self.record.lock().superblock.clone()
    }

    pub fn tombstone_last_logged_seqno(&self) -> Option<u64> {
        self.record.lock().tombstone_last_logged_seqno
    }

    pub fn set_data_state(&self, state: TabletDataState) {
        self.record.lock().data_state = state;
    }

    pub fn replace_superblock(&self, superblock: TabletSuperBlock) {
        self.record.lock().superblock = superblock;
    }

    pub fn set_tombstone_last_logged_seqno(&self, seqno: Option<u64>) {
        self.record.lock().tombstone_last_logged_seqno = seqno;
    }

    /// Persist the current record synchronously.
    pub fn flush(&self) -> Result<(), StorageError> {
        let bytes = {
            let record = self.record.lock();
            encode_record(&record)?
        };
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        tracing::debug!(
            "Flushed metadata for tablet {} ({})",
            self.tablet_id,
            self.data_state()
        );
        Ok(())
    }
}

fn encode_record(record: &MetadataRecord) -> Result<Vec<u8>, StorageError> {
    let payload =
        bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_record(path: &Path, bytes: &[u8]) -> Result<MetadataRecord, StorageError> {
    if bytes.len() < 4 {
        return Err(StorageError::Serialization(format!(
            "metadata file {} truncated ({} bytes)",
            path.display(),
            bytes.len()
        )));
    }
    let (header, payload) = bytes.split_at(4);
    let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(StorageError::MetadataChecksum {
            path: path.display().to_string(),
            expected,
            actual,
        });
    }
    bincode::deserialize(payload).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock::{ColumnBlock, RowSetDescriptor};
    use tablet_common::types::BlockId;
    use tempfile::TempDir;

    fn superblock(tablet: &str) -> TabletSuperBlock {
        let mut sb = TabletSuperBlock::new(TabletId::new(tablet), "events");
        sb.rowsets.push(RowSetDescriptor {
            id: 3,
            columns: vec![ColumnBlock { column_id: 0, block: BlockId(42) }],
            ..Default::default()
        });
        sb
    }

    #[test]
    fn test_create_and_load() {
        let dir = TempDir::new().unwrap();
        let layout = FsLayout::new(dir.path());
        let meta = TabletMetadata::create(&layout, superblock("t1"), TabletDataState::Ready).unwrap();
        assert!(TabletMetadata::exists(&layout, meta.tablet_id()));

        let loaded = TabletMetadata::load(&layout, &TabletId::new("t1")).unwrap();
        assert_eq!(loaded.data_state(), TabletDataState::Ready);
        assert_eq!(loaded.superblock(), superblock("t1"));
    }

    #[test]
    fn test_mutations_visible_only_after_flush() {
        let dir = TempDir::new().unwrap();
        let layout = FsLayout::new(dir.path());
        let meta =
            TabletMetadata::create(&layout, superblock("t1"), TabletDataState::Copying).unwrap();
        meta.set_data_state(TabletDataState::Tombstoned);
        meta.set_tombstone_last_logged_seqno(Some(9));

        let on_disk = TabletMetadata::load(&layout, &TabletId::new("t1")).unwrap();
        assert_eq!(on_disk.data_state(), TabletDataState::Copying);

        meta.flush().unwrap();
        let on_disk = TabletMetadata::load(&layout, &TabletId::new("t1")).unwrap();
        assert_eq!(on_disk.data_state(), TabletDataState::Tombstoned);
        assert_eq!(on_disk.tombstone_last_logged_seqno(), Some(9));
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        let layout = FsLayout::new(dir.path());
        let err = TabletMetadata::load(&layout, &TabletId::new("nope")).unwrap_err();
        assert!(matches!(err, StorageError::MetadataNotFound(_)));
    }

    #[test]
    fn test_corrupt_record_detected() {
        let dir = TempDir::new().unwrap();
        let layout = FsLayout::new(dir.path());
        let meta = TabletMetadata::create(&layout, superblock("t1"), TabletDataState::Ready).unwrap();
        let mut bytes = fs::read(meta.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(meta.path(), &bytes).unwrap();

        let err = TabletMetadata::load(&layout, &TabletId::new("t1")).unwrap_err();
        assert!(matches!(err, StorageError::MetadataChecksum { .. }));
    }
}
