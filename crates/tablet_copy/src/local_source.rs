//! In-process copy source serving a tablet straight from a local data root.
//!
//! Used to copy between two data roots on the same host and as the peer in
//! tests. Every failure is reported as a peer rejection, which is what a
//! remote client would observe.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use tablet_common::error::{CopyError, CopyResult, StorageError, TransportError};
use tablet_common::types::{BlockId, SessionId, TabletId};
use tablet_storage::{BlockManager, FsLayout, TabletDataState, TabletMetadata, TabletSuperBlock};

use crate::chunk::DataChunk;
use crate::transport::{BeginSessionResponse, CopyTransport};

struct SourceSession {
    tablet_id: TabletId,
    superblock: TabletSuperBlock,
    wal_seqnos: Vec<u64>,
}

pub struct LocalTabletSource {
    layout: FsLayout,
    block_manager: Arc<dyn BlockManager>,
    sessions: Mutex<HashMap<SessionId, Arc<SourceSession>>>,
    next_session: AtomicU64,
}

fn rejected(msg: impl Into<String>) -> CopyError {
    TransportError::Rejected(msg.into()).into()
}

fn read_range(file: &mut File, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}

impl LocalTabletSource {
    pub fn new(layout: FsLayout, block_manager: Arc<dyn BlockManager>) -> Self {
        Self {
            layout,
            block_manager,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    fn session(&self, session_id: &SessionId) -> CopyResult<Arc<SourceSession>> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| TransportError::NoSession(session_id.to_string()).into())
    }
}

/// Slice `[offset, offset + max_length)` of an object of `total` bytes.
fn chunk_len(offset: u64, max_length: u64, total: u64, what: &str) -> CopyResult<u64> {
    if offset > total {
        return Err(rejected(format!(
            "offset {} beyond end of {} ({} bytes)",
            offset, what, total
        )));
    }
    Ok(max_length.min(total - offset))
}

impl CopyTransport for LocalTabletSource {
    fn begin_copy_session(&self, tablet_id: &TabletId) -> CopyResult<BeginSessionResponse> {
        let meta = match TabletMetadata::load(&self.layout, tablet_id) {
            Ok(m) => m,
            Err(StorageError::MetadataNotFound(_)) => {
                return Err(rejected(format!("tablet {} not found", tablet_id)));
            }
            Err(e) => return Err(rejected(format!("tablet {}: {}", tablet_id, e))),
        };
        if meta.data_state() != TabletDataState::Ready {
            return Err(rejected(format!(
                "tablet {} is not ready to be copied (state {})",
                tablet_id,
                meta.data_state()
            )));
        }
        let wal_seqnos = self
            .layout
            .list_wal_segments(tablet_id)
            .map_err(|e| rejected(e.to_string()))?;
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        let session_id = SessionId(format!("{}-{}", tablet_id, n));
        let session = Arc::new(SourceSession {
            tablet_id: tablet_id.clone(),
            superblock: meta.superblock(),
            wal_seqnos,
        });
        self.sessions.lock().insert(session_id.clone(), session.clone());
        tracing::info!(
            "Opened copy session {} for tablet {} ({} blocks, {} WAL segments)",
            session_id,
            tablet_id,
            session.superblock.count_blocks(),
            session.wal_seqnos.len()
        );
        Ok(BeginSessionResponse {
            session_id,
            superblock: session.superblock.clone(),
            wal_seqnos: session.wal_seqnos.clone(),
        })
    }

    fn fetch_block_chunk(
        &self,
        session_id: &SessionId,
        block_id: BlockId,
        offset: u64,
        max_length: u64,
    ) -> CopyResult<DataChunk> {
        let session = self.session(session_id)?;
        if !session.superblock.list_blocks().contains(&block_id) {
            return Err(rejected(format!(
                "block {} is not part of session {}",
                block_id, session_id
            )));
        }
        let total = self
            .block_manager
            .block_size(block_id)
            .map_err(|e| rejected(e.to_string()))?;
        let len = chunk_len(offset, max_length, total, "block")?;
        let data = self
            .block_manager
            .read_block_range(block_id, offset, len as usize)
            .map_err(|e| rejected(e.to_string()))?;
        Ok(DataChunk::new(offset, data, total))
    }

    fn fetch_wal_chunk(
        &self,
        session_id: &SessionId,
        seqno: u64,
        offset: u64,
        max_length: u64,
    ) -> CopyResult<DataChunk> {
        let session = self.session(session_id)?;
        if !session.wal_seqnos.contains(&seqno) {
            return Err(rejected(format!(
                "WAL segment {} is not part of session {}",
                seqno, session_id
            )));
        }
        let path = self.layout.wal_segment_path(&session.tablet_id, seqno);
        let read = || -> std::io::Result<DataChunk> {
            let mut file = File::open(&path)?;
            let total = file.metadata()?.len();
            let len = max_length.min(total.saturating_sub(offset));
            let data = if offset >= total {
                Vec::new()
            } else {
                read_range(&mut file, offset, len)?
            };
            Ok(DataChunk::new(offset, data, total))
        };
        let chunk = read().map_err(|e| rejected(format!("{}: {}", path.display(), e)))?;
        if chunk.offset > chunk.total_data_length {
            return Err(rejected(format!(
                "offset {} beyond end of WAL segment {} ({} bytes)",
                offset, seqno, chunk.total_data_length
            )));
        }
        Ok(chunk)
    }

    fn end_copy_session(&self, session_id: &SessionId, is_success: bool) -> CopyResult<()> {
        match self.sessions.lock().remove(session_id) {
            Some(_) => {
                tracing::info!(
                    "Closed copy session {} ({})",
                    session_id,
                    if is_success { "success" } else { "aborted" }
                );
                Ok(())
            }
            None => Err(TransportError::NoSession(session_id.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_storage::{ColumnBlock, FileBlockManager, RowSetDescriptor};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        source: LocalTabletSource,
        block: BlockId,
    }

    fn fixture(state: TabletDataState) -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = FsLayout::new(dir.path());
        layout.create_initial_layout().unwrap();
        let bm = Arc::new(FileBlockManager::open(&layout.data_dir()).unwrap());
        let mut wb = bm.create_block().unwrap();
        wb.append(b"0123456789").unwrap();
        let block = wb.close().unwrap();

        let tablet = TabletId::new("t1");
        let mut sb = TabletSuperBlock::new(tablet.clone(), "tbl");
        sb.rowsets.push(RowSetDescriptor {
            id: 0,
            columns: vec![ColumnBlock { column_id: 0, block }],
            ..Default::default()
        });
        TabletMetadata::create(&layout, sb, state).unwrap();
        layout.ensure_wal_dir(&tablet).unwrap();
        std::fs::write(layout.wal_segment_path(&tablet, 1), b"wal-bytes").unwrap();

        Fixture {
            source: LocalTabletSource::new(layout, bm),
            block,
            _dir: dir,
        }
    }

    #[test]
    fn test_serves_block_in_chunks() {
        let f = fixture(TabletDataState::Ready);
        let resp = f.source.begin_copy_session(&TabletId::new("t1")).unwrap();
        assert_eq!(resp.wal_seqnos, vec![1]);

        let c1 = f.source.fetch_block_chunk(&resp.session_id, f.block, 0, 4).unwrap();
        assert_eq!(c1.data, b"0123");
        assert_eq!(c1.total_data_length, 10);
        let c2 = f.source.fetch_block_chunk(&resp.session_id, f.block, 8, 4).unwrap();
        assert_eq!(c2.data, b"89");
        assert!(f.source.fetch_block_chunk(&resp.session_id, f.block, 11, 4).is_err());
    }

    #[test]
    fn test_serves_wal_segment() {
        let f = fixture(TabletDataState::Ready);
        let resp = f.source.begin_copy_session(&TabletId::new("t1")).unwrap();
        let c = f.source.fetch_wal_chunk(&resp.session_id, 1, 0, 1024).unwrap();
        assert_eq!(c.data, b"wal-bytes");
        assert!(f.source.fetch_wal_chunk(&resp.session_id, 2, 0, 1024).is_err());
    }

    #[test]
    fn test_rejects_tablet_not_ready() {
        let f = fixture(TabletDataState::Copying);
        let err = f.source.begin_copy_session(&TabletId::new("t1")).unwrap_err();
        assert!(err.is_transport());
        let err = f.source.begin_copy_session(&TabletId::new("missing")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_rejects_foreign_block_and_closed_session() {
        let f = fixture(TabletDataState::Ready);
        let resp = f.source.begin_copy_session(&TabletId::new("t1")).unwrap();
        assert!(f
            .source
            .fetch_block_chunk(&resp.session_id, BlockId(f.block.0 + 100), 0, 4)
            .is_err());
        assert_eq!(f.source.active_sessions(), 1);
        f.source.end_copy_session(&resp.session_id, true).unwrap();
        assert_eq!(f.source.active_sessions(), 0);
        let err = f
            .source
            .fetch_block_chunk(&resp.session_id, f.block, 0, 4)
            .unwrap_err();
        assert!(err.to_string().contains("no such copy session"));
    }
}
