//! Shared fixtures: a source peer serving a real tablet from a temp data root
//! and an empty destination data root.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use tablet_common::config::TabletCopyConfig;
use tablet_common::error::CopyResult;
use tablet_common::types::{BlockId, HostPort, SessionId, TabletId};
use tablet_copy::{
    BeginSessionResponse, CopyTransport, DataChunk, InProcessConnector, LocalTabletSource,
    TabletCopyClient,
};
use tablet_storage::{
    BlockManager, BlockSlot, ColumnBlock, FileBlockManager, FsLayout, RowSetDescriptor,
    TabletDataState, TabletMetadata, TabletSuperBlock,
};

/// Local ids start far above anything the source hands out.
pub const DEST_FIRST_BLOCK_ID: u64 = 1 << 40;

pub const SMALL_CHUNK: u64 = 1000;

pub fn peer_addr() -> HostPort {
    HostPort::new("source-ts", 7050)
}

pub fn tablet() -> TabletId {
    TabletId::new("a1b2c3d4")
}

/// Deterministic block payload, different per seed.
pub fn payload(seed: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(seed * 7919) % 251) as u8)
        .collect()
}

pub fn wal_payload(seqno: u64) -> Vec<u8> {
    format!("wal segment {} entries|", seqno)
        .repeat(150 + seqno as usize)
        .into_bytes()
}

pub struct SourcePeer {
    _dir: TempDir,
    pub layout: FsLayout,
    pub blocks: Arc<FileBlockManager>,
    pub source: Arc<LocalTabletSource>,
    pub superblock: TabletSuperBlock,
    pub contents: BTreeMap<BlockId, Vec<u8>>,
    pub wal_seqnos: Vec<u64>,
}

impl SourcePeer {
    /// Bytes the source stores for the block occupying `slot`.
    pub fn content_of_slot(&self, slot: &BlockSlot) -> &[u8] {
        let remote = self
            .superblock
            .block_slots()
            .into_iter()
            .find(|(s, _)| s == slot)
            .map(|(_, id)| id)
            .unwrap();
        &self.contents[&remote]
    }
}

/// Source tablet with `rowsets` rowsets of four blocks each (two columns, a
/// bloom filter and a redo delta) and the given WAL segments.
pub fn source_peer(rowsets: u64, wal_seqnos: &[u64]) -> SourcePeer {
    let dir = TempDir::new().unwrap();
    let layout = FsLayout::new(dir.path());
    layout.create_initial_layout().unwrap();
    let blocks = Arc::new(FileBlockManager::open(&layout.data_dir()).unwrap());
    let mut contents = BTreeMap::new();
    let mut write_block = |seed: u64| {
        let data = payload(seed, 1500 + (seed as usize * 397) % 2500);
        let mut wb = blocks.create_block().unwrap();
        wb.append(&data).unwrap();
        let id = wb.close().unwrap();
        contents.insert(id, data);
        id
    };

    let tablet_id = tablet();
    let mut superblock = TabletSuperBlock::new(tablet_id.clone(), "orders");
    for rs in 0..rowsets {
        superblock.rowsets.push(RowSetDescriptor {
            id: rs,
            columns: vec![
                ColumnBlock { column_id: 0, block: write_block(rs * 4) },
                ColumnBlock { column_id: 1, block: write_block(rs * 4 + 1) },
            ],
            bloom_block: Some(write_block(rs * 4 + 2)),
            adhoc_index_block: None,
            redo_deltas: vec![write_block(rs * 4 + 3)],
            undo_deltas: vec![],
        });
    }
    TabletMetadata::create(&layout, superblock.clone(), TabletDataState::Ready).unwrap();

    if !wal_seqnos.is_empty() {
        layout.ensure_wal_dir(&tablet_id).unwrap();
    }
    for &seqno in wal_seqnos {
        std::fs::write(layout.wal_segment_path(&tablet_id, seqno), wal_payload(seqno)).unwrap();
    }

    let source = Arc::new(LocalTabletSource::new(
        layout.clone(),
        blocks.clone() as Arc<dyn BlockManager>,
    ));
    SourcePeer {
        _dir: dir,
        layout,
        blocks,
        source,
        superblock,
        contents,
        wal_seqnos: wal_seqnos.to_vec(),
    }
}

/// Source tablet holding exactly one column block.
pub fn single_block_peer(data: &[u8]) -> SourcePeer {
    let dir = TempDir::new().unwrap();
    let layout = FsLayout::new(dir.path());
    layout.create_initial_layout().unwrap();
    let blocks = Arc::new(FileBlockManager::open(&layout.data_dir()).unwrap());
    let mut wb = blocks.create_block().unwrap();
    wb.append(data).unwrap();
    let id = wb.close().unwrap();

    let mut superblock = TabletSuperBlock::new(tablet(), "orders");
    superblock.rowsets.push(RowSetDescriptor {
        id: 0,
        columns: vec![ColumnBlock { column_id: 0, block: id }],
        ..Default::default()
    });
    TabletMetadata::create(&layout, superblock.clone(), TabletDataState::Ready).unwrap();
    let source = Arc::new(LocalTabletSource::new(
        layout.clone(),
        blocks.clone() as Arc<dyn BlockManager>,
    ));
    SourcePeer {
        _dir: dir,
        layout,
        blocks,
        source,
        superblock,
        contents: BTreeMap::from([(id, data.to_vec())]),
        wal_seqnos: Vec::new(),
    }
}

pub struct Destination {
    _dir: TempDir,
    pub layout: FsLayout,
    pub blocks: Arc<FileBlockManager>,
}

impl Destination {
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.list_block_ids().unwrap().into_iter().collect()
    }

    pub fn wal_path(&self, seqno: u64) -> std::path::PathBuf {
        self.layout.wal_segment_path(&tablet(), seqno)
    }

    pub fn load_meta(&self) -> Arc<TabletMetadata> {
        TabletMetadata::load(&self.layout, &tablet()).unwrap()
    }
}

pub fn destination() -> Destination {
    let dir = TempDir::new().unwrap();
    let layout = FsLayout::new(dir.path());
    layout.create_initial_layout().unwrap();
    let blocks = Arc::new(
        FileBlockManager::open_with_start_id(&layout.data_dir(), DEST_FIRST_BLOCK_ID).unwrap(),
    );
    Destination {
        _dir: dir,
        layout,
        blocks,
    }
}

pub fn connector_for(transport: Arc<dyn CopyTransport>) -> Arc<InProcessConnector> {
    let connector = Arc::new(InProcessConnector::new());
    connector.register(peer_addr(), transport);
    connector
}

pub fn small_chunks() -> TabletCopyConfig {
    TabletCopyConfig {
        transfer_chunk_size_bytes: SMALL_CHUNK,
        ..Default::default()
    }
}

pub fn client_with(
    dest: &Destination,
    transport: Arc<dyn CopyTransport>,
    config: TabletCopyConfig,
) -> TabletCopyClient {
    TabletCopyClient::new(
        tablet(),
        dest.layout.clone(),
        dest.blocks.clone() as Arc<dyn BlockManager>,
        connector_for(transport),
        config,
    )
}

pub fn client(dest: &Destination, peer: &SourcePeer) -> TabletCopyClient {
    client_with(dest, peer.source.clone(), small_chunks())
}

type Tamper = Box<dyn Fn(u64, DataChunk) -> CopyResult<DataChunk> + Send + Sync>;
type BeginTamper = Box<dyn Fn(BeginSessionResponse) -> BeginSessionResponse + Send + Sync>;

/// Wraps a real transport and lets a test rewrite (or fail) chunks on their
/// way to the client. The tamper functions see the remote block id (or WAL
/// seqno) and the chunk the peer produced.
pub struct FaultyTransport {
    inner: Arc<dyn CopyTransport>,
    begin_tamper: Option<BeginTamper>,
    block_tamper: Option<Tamper>,
    wal_tamper: Option<Tamper>,
    pub block_requests: AtomicUsize,
    pub ended: Mutex<Vec<(SessionId, bool)>>,
}

impl FaultyTransport {
    pub fn new(inner: Arc<dyn CopyTransport>) -> Self {
        Self {
            inner,
            begin_tamper: None,
            block_tamper: None,
            wal_tamper: None,
            block_requests: AtomicUsize::new(0),
            ended: Mutex::new(Vec::new()),
        }
    }

    pub fn on_begin(
        mut self,
        f: impl Fn(BeginSessionResponse) -> BeginSessionResponse + Send + Sync + 'static,
    ) -> Self {
        self.begin_tamper = Some(Box::new(f));
        self
    }

    pub fn on_block_chunk(
        mut self,
        f: impl Fn(u64, DataChunk) -> CopyResult<DataChunk> + Send + Sync + 'static,
    ) -> Self {
        self.block_tamper = Some(Box::new(f));
        self
    }

    pub fn on_wal_chunk(
        mut self,
        f: impl Fn(u64, DataChunk) -> CopyResult<DataChunk> + Send + Sync + 'static,
    ) -> Self {
        self.wal_tamper = Some(Box::new(f));
        self
    }
}

impl CopyTransport for FaultyTransport {
    fn begin_copy_session(&self, tablet_id: &TabletId) -> CopyResult<BeginSessionResponse> {
        let resp = self.inner.begin_copy_session(tablet_id)?;
        match &self.begin_tamper {
            Some(f) => Ok(f(resp)),
            None => Ok(resp),
        }
    }

    fn fetch_block_chunk(
        &self,
        session_id: &SessionId,
        block_id: BlockId,
        offset: u64,
        max_length: u64,
    ) -> CopyResult<DataChunk> {
        self.block_requests.fetch_add(1, Ordering::SeqCst);
        let chunk = self
            .inner
            .fetch_block_chunk(session_id, block_id, offset, max_length)?;
        match &self.block_tamper {
            Some(f) => f(block_id.0, chunk),
            None => Ok(chunk),
        }
    }

    fn fetch_wal_chunk(
        &self,
        session_id: &SessionId,
        seqno: u64,
        offset: u64,
        max_length: u64,
    ) -> CopyResult<DataChunk> {
        let chunk = self
            .inner
            .fetch_wal_chunk(session_id, seqno, offset, max_length)?;
        match &self.wal_tamper {
            Some(f) => f(seqno, chunk),
            None => Ok(chunk),
        }
    }

    fn end_copy_session(&self, session_id: &SessionId, is_success: bool) -> CopyResult<()> {
        self.ended.lock().push((session_id.clone(), is_success));
        self.inner.end_copy_session(session_id, is_success)
    }
}
