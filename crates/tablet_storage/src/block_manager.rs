//! Block manager: allocates block ids and stores each block as one file.
//!
//! Blocks are immutable once closed. The manager is shared between the tablet
//! server and any running copy sessions, so every method takes `&self`.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tablet_common::error::StorageError;
use tablet_common::types::BlockId;

const BLOCK_SUFFIX: &str = ".block";

/// A block opened for writing. Closing it makes it durable and readable.
pub trait WritableBlock: Send {
    fn id(&self) -> BlockId;

    fn append(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Flush, fsync and finalize the block.
    fn close(self: Box<Self>) -> Result<BlockId, StorageError>;
}

/// Local block storage.
pub trait BlockManager: Send + Sync {
    /// Open a new writable block under a freshly allocated id.
    fn create_block(&self) -> Result<Box<dyn WritableBlock>, StorageError>;

    /// Read a whole block.
    fn read_block(&self, id: BlockId) -> Result<Vec<u8>, StorageError>;

    /// Read up to `len` bytes starting at `offset`. Short reads happen only at
    /// the end of the block.
    fn read_block_range(&self, id: BlockId, offset: u64, len: usize)
        -> Result<Vec<u8>, StorageError>;

    fn block_size(&self, id: BlockId) -> Result<u64, StorageError>;

    fn delete_block(&self, id: BlockId) -> Result<(), StorageError>;

    fn list_block_ids(&self) -> Result<BTreeSet<BlockId>, StorageError>;

    fn block_exists(&self, id: BlockId) -> bool;
}

/// File-per-block manager rooted at a data directory.
pub struct FileBlockManager {
    dir: PathBuf,
    next_id: AtomicU64,
}

fn block_filename(id: BlockId) -> String {
    format!("{}{}", id, BLOCK_SUFFIX)
}

fn parse_block_filename(name: &str) -> Option<BlockId> {
    let hex = name.strip_suffix(BLOCK_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok().map(BlockId)
}

impl FileBlockManager {
    /// Open (creating if needed) a block directory. New ids start after the
    /// highest id already present.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        Self::open_with_start_id(dir, 1)
    }

    /// Like `open`, but never hands out ids below `start_id`.
    pub fn open_with_start_id(dir: &Path, start_id: u64) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let mut next = start_id.max(1);
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_block_filename) {
                next = next.max(id.0.saturating_add(1));
            }
        }
        tracing::debug!("Opened block manager at {} (next id {})", dir.display(), next);
        Ok(Self {
            dir: dir.to_path_buf(),
            next_id: AtomicU64::new(next),
        })
    }

    fn block_path(&self, id: BlockId) -> PathBuf {
        self.dir.join(block_filename(id))
    }

    fn open_existing(&self, id: BlockId) -> Result<File, StorageError> {
        File::open(self.block_path(id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::BlockNotFound(id),
            _ => StorageError::Io(e),
        })
    }
}

impl BlockManager for FileBlockManager {
    fn create_block(&self) -> Result<Box<dyn WritableBlock>, StorageError> {
        let id = BlockId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let path = self.block_path(id);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(Box::new(FileWritableBlock {
            id,
            path,
            writer: BufWriter::new(file),
            appended: 0,
        }))
    }

    fn read_block(&self, id: BlockId) -> Result<Vec<u8>, StorageError> {
        let mut file = self.open_existing(id)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_block_range(
        &self,
        id: BlockId,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, StorageError> {
        let mut file = self.open_existing(id)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn block_size(&self, id: BlockId) -> Result<u64, StorageError> {
        Ok(self.open_existing(id)?.metadata()?.len())
    }

    fn delete_block(&self, id: BlockId) -> Result<(), StorageError> {
        fs::remove_file(self.block_path(id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::BlockNotFound(id),
            _ => StorageError::Io(e),
        })
    }

    fn list_block_ids(&self) -> Result<BTreeSet<BlockId>, StorageError> {
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_block_filename) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    fn block_exists(&self, id: BlockId) -> bool {
        self.block_path(id).exists()
    }
}

struct FileWritableBlock {
    id: BlockId,
    path: PathBuf,
    writer: BufWriter<File>,
    appended: u64,
}

impl WritableBlock for FileWritableBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.writer.write_all(data)?;
        self.appended += data.len() as u64;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<BlockId, StorageError> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
        file.sync_all()?;
        tracing::trace!("Closed block {} ({} bytes) at {}", self.id, self.appended, self.path.display());
        Ok(self.id)
    }
}
