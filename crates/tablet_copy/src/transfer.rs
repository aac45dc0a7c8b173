//! Sequential chunked transfer of one object (block or WAL segment).
//!
//! One loop drives both object kinds; only the destination differs, which is
//! abstracted by `ChunkSink`. Per object the stream is strictly ordered:
//! chunk N+1 is requested at the offset chunk N ended at.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tablet_common::error::{CopyError, CopyResult, StorageError};
use tablet_common::shutdown::CancelSignal;
use tablet_common::types::{BlockId, TabletId};
use tablet_storage::WritableBlock;

use crate::chunk::{verify_data, DataChunk};

/// Destination of a chunked transfer.
pub trait ChunkSink {
    type Output;

    /// Persist verified bytes.
    fn append(&mut self, data: &[u8]) -> CopyResult<()>;

    /// Make the object durable once every byte has arrived.
    fn finish(self) -> CopyResult<Self::Output>;
}

/// Writes into a newly allocated local block.
pub struct BlockSink {
    block: Box<dyn WritableBlock>,
}

impl BlockSink {
    pub fn new(block: Box<dyn WritableBlock>) -> Self {
        Self { block }
    }

    pub fn block_id(&self) -> BlockId {
        self.block.id()
    }
}

impl ChunkSink for BlockSink {
    type Output = BlockId;

    fn append(&mut self, data: &[u8]) -> CopyResult<()> {
        Ok(self.block.append(data)?)
    }

    fn finish(self) -> CopyResult<BlockId> {
        Ok(self.block.close()?)
    }
}

/// Writes into a plain file (a WAL segment).
pub struct WalSegmentSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl WalSegmentSink {
    /// Create the file. Fails if something already exists at `path`.
    pub fn create(path: &Path) -> CopyResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(StorageError::Io)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl ChunkSink for WalSegmentSink {
    type Output = PathBuf;

    fn append(&mut self, data: &[u8]) -> CopyResult<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn finish(self) -> CopyResult<PathBuf> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(self.path)
    }
}

/// Per-transfer parameters shared by every object of a session.
pub struct TransferContext<'a> {
    pub tablet_id: &'a TabletId,
    pub max_chunk_len: u64,
    pub cancel: &'a CancelSignal,
}

/// Stream one object through `fetch` into `sink`.
///
/// `fetch(offset, max_len)` requests the next chunk. Every chunk is verified
/// before a byte of it reaches the sink. The transfer ends when the bytes
/// accepted equal the declared total length. `on_chunk` sees the payload size
/// of every accepted chunk. Returns the sink's output and the byte count.
pub fn fetch_object<S, F, P>(
    ctx: &TransferContext<'_>,
    what: &str,
    mut fetch: F,
    mut sink: S,
    mut on_chunk: P,
) -> CopyResult<(S::Output, u64)>
where
    S: ChunkSink,
    F: FnMut(u64, u64) -> CopyResult<DataChunk>,
    P: FnMut(usize),
{
    let mut offset = 0u64;
    let mut total: Option<u64> = None;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(CopyError::Cancelled(ctx.tablet_id.clone()));
        }
        let chunk = fetch(offset, ctx.max_chunk_len)?;
        if let Err(e) = verify_data(offset, &chunk) {
            tracing::warn!("Rejected chunk of {} at offset {}: {}", what, offset, e);
            return Err(e);
        }

        let declared = *total.get_or_insert(chunk.total_data_length);
        if chunk.total_data_length != declared {
            return Err(CopyError::corruption(format!(
                "{}: total data length changed mid-stream from {} to {} at offset {}",
                what, declared, chunk.total_data_length, offset
            )));
        }
        let end = offset + chunk.data.len() as u64;
        if end > declared {
            return Err(CopyError::corruption(format!(
                "{}: chunk at offset {} of {} bytes overruns declared length {}",
                what,
                offset,
                chunk.data.len(),
                declared
            )));
        }
        if chunk.data.is_empty() && offset < declared {
            return Err(CopyError::corruption(format!(
                "{}: stream ended at {} bytes, expected {}",
                what, offset, declared
            )));
        }

        sink.append(&chunk.data)?;
        on_chunk(chunk.data.len());
        offset = end;
        if offset == declared {
            break;
        }
    }
    let output = sink.finish()?;
    Ok((output, offset))
}
