//! On-disk layout of a tablet server data root.
//!
//! ```text
//!   <root>/data/<block_id>.block      # blocks (see FileBlockManager)
//!   <root>/wals/<tablet_id>/wal-000000001
//!   <root>/tablet-meta/<tablet_id>    # durable tablet metadata
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tablet_common::error::StorageError;
use tablet_common::types::TabletId;

const DATA_DIR: &str = "data";
const WAL_DIR: &str = "wals";
const METADATA_DIR: &str = "tablet-meta";
const WAL_SEGMENT_PREFIX: &str = "wal-";

fn segment_filename(seqno: u64) -> String {
    format!("{}{:09}", WAL_SEGMENT_PREFIX, seqno)
}

fn parse_segment_filename(name: &str) -> Option<u64> {
    name.strip_prefix(WAL_SEGMENT_PREFIX)?.parse().ok()
}

/// Filesystem layout rooted at one directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FsLayout {
    root: PathBuf,
}

impl FsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and its fixed subdirectories. Idempotent.
    pub fn create_initial_layout(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.root.join(WAL_DIR))?;
        fs::create_dir_all(self.metadata_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    pub fn metadata_path(&self, tablet_id: &TabletId) -> PathBuf {
        self.metadata_dir().join(tablet_id.as_str())
    }

    pub fn wal_dir(&self, tablet_id: &TabletId) -> PathBuf {
        self.root.join(WAL_DIR).join(tablet_id.as_str())
    }

    /// Deterministic path of one WAL segment: a pure function of the tablet
    /// id and the segment sequence number.
    pub fn wal_segment_path(&self, tablet_id: &TabletId, seqno: u64) -> PathBuf {
        self.wal_dir(tablet_id).join(segment_filename(seqno))
    }

    /// Create the tablet's WAL directory if missing. Idempotent.
    pub fn ensure_wal_dir(&self, tablet_id: &TabletId) -> Result<PathBuf, StorageError> {
        let dir = self.wal_dir(tablet_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Remove a file. A file that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Sequence numbers of the WAL segments present for a tablet, ascending.
    pub fn list_wal_segments(&self, tablet_id: &TabletId) -> Result<Vec<u64>, StorageError> {
        let dir = self.wal_dir(tablet_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut seqnos = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(seqno) = entry.file_name().to_str().and_then(parse_segment_filename) {
                seqnos.push(seqno);
            }
        }
        seqnos.sort_unstable();
        Ok(seqnos)
    }

    /// Remove the tablet's WAL directory if it exists and holds nothing.
    /// Returns true if a directory was removed.
    pub fn remove_wal_dir_if_empty(&self, tablet_id: &TabletId) -> Result<bool, StorageError> {
        let dir = self.wal_dir(tablet_id);
        if !dir.exists() {
            return Ok(false);
        }
        if fs::read_dir(&dir)?.next().is_some() {
            return Ok(false);
        }
        fs::remove_dir(&dir)?;
        Ok(true)
    }
}
