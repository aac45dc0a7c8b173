//! Tablet copy client: drives one copy session from a source peer into the
//! local data root.
//!
//! Lifecycle: `start` opens the remote session and writes local metadata in
//! `Copying` state; the download calls fetch blocks and WAL segments; `finish`
//! commits the local superblock as `Ready`. Anything else rolls back: `abort`
//! (explicit or from `Drop`) deletes exactly the objects this session created
//! and leaves a tombstone.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use tablet_common::config::TabletCopyConfig;
use tablet_common::error::{CopyError, CopyResult, StorageError};
use tablet_common::shutdown::CancelSignal;
use tablet_common::types::{BlockId, HostPort, SessionId, TabletId};
use tablet_storage::{
    BlockManager, BlockSlot, FsLayout, TabletDataState, TabletMetadata, TabletSuperBlock,
};

use crate::progress::{
    CopyMetrics, CopyMetricsSnapshot, CopyProgress, CopyProgressListener, NoopProgressListener,
};
use crate::reconciler::{init_local_metadata, LocalDescriptor, RemoteDescriptor};
use crate::transfer::{fetch_object, BlockSink, TransferContext, WalSegmentSink};
use crate::transport::{CopyTransport, TransportConnector};

/// Lifecycle of a copy session. Each transition happens at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Started,
    Copying,
    Finished,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NOT_STARTED"),
            Self::Started => write!(f, "STARTED"),
            Self::Copying => write!(f, "COPYING"),
            Self::Finished => write!(f, "FINISHED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Open remote session.
struct Session {
    transport: Arc<dyn CopyTransport>,
    remote: RemoteDescriptor,
}

/// Objects this session created locally. Only these are removed on abort.
#[derive(Debug, Default)]
struct CreatedObjects {
    blocks: BTreeSet<BlockId>,
    wal_paths: BTreeSet<PathBuf>,
    /// The tablet WAL directory did not exist before this session.
    wal_dir: bool,
}

/// Running totals reported to a listener. Shared by download workers.
struct ProgressTracker<'a> {
    listener: &'a dyn CopyProgressListener,
    total_blocks: usize,
    blocks_downloaded: AtomicUsize,
    total_wal_segments: usize,
    wal_segments_downloaded: AtomicUsize,
    bytes_downloaded: AtomicU64,
}

impl<'a> ProgressTracker<'a> {
    fn new(listener: &'a dyn CopyProgressListener, start: CopyProgress) -> Self {
        Self {
            listener,
            total_blocks: start.total_blocks,
            blocks_downloaded: AtomicUsize::new(start.blocks_downloaded),
            total_wal_segments: start.total_wal_segments,
            wal_segments_downloaded: AtomicUsize::new(start.wal_segments_downloaded),
            bytes_downloaded: AtomicU64::new(start.bytes_downloaded),
        }
    }

    fn snapshot(&self) -> CopyProgress {
        CopyProgress {
            total_blocks: self.total_blocks,
            blocks_downloaded: self.blocks_downloaded.load(Ordering::Relaxed),
            total_wal_segments: self.total_wal_segments,
            wal_segments_downloaded: self.wal_segments_downloaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    fn add_bytes(&self, n: usize) {
        self.bytes_downloaded.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn block_done(&self) {
        self.blocks_downloaded.fetch_add(1, Ordering::Relaxed);
        self.listener.on_progress(&self.snapshot());
    }

    fn wal_segment_done(&self) {
        self.wal_segments_downloaded.fetch_add(1, Ordering::Relaxed);
        self.listener.on_progress(&self.snapshot());
    }
}

fn end_remote_session(session: &Session, is_success: bool) {
    if let Err(e) = session
        .transport
        .end_copy_session(&session.remote.session_id, is_success)
    {
        tracing::warn!(
            "Failed to end copy session {}: {}",
            session.remote.session_id,
            e
        );
    }
}

pub struct TabletCopyClient {
    tablet_id: TabletId,
    layout: FsLayout,
    block_manager: Arc<dyn BlockManager>,
    connector: Arc<dyn TransportConnector>,
    config: TabletCopyConfig,
    state: SessionState,
    session: Option<Arc<Session>>,
    meta: Option<Arc<TabletMetadata>>,
    local: Option<LocalDescriptor>,
    created: Mutex<CreatedObjects>,
    downloaded_wals: BTreeSet<u64>,
    metrics: CopyMetrics,
    cancel: CancelSignal,
}

impl TabletCopyClient {
    pub fn new(
        tablet_id: TabletId,
        layout: FsLayout,
        block_manager: Arc<dyn BlockManager>,
        connector: Arc<dyn TransportConnector>,
        config: TabletCopyConfig,
    ) -> Self {
        Self {
            tablet_id,
            layout,
            block_manager,
            connector,
            config,
            state: SessionState::NotStarted,
            session: None,
            meta: None,
            local: None,
            created: Mutex::new(CreatedObjects::default()),
            downloaded_wals: BTreeSet::new(),
            metrics: CopyMetrics::default(),
            cancel: CancelSignal::new(),
        }
    }

    /// Open a copy session with the peer at `addr` and create the local
    /// metadata record in `Copying` state.
    pub fn start(&mut self, addr: &HostPort) -> CopyResult<Arc<TabletMetadata>> {
        if self.state != SessionState::NotStarted {
            return Err(CopyError::illegal_state(format!(
                "copy of tablet {} already started (state {})",
                self.tablet_id, self.state
            )));
        }
        let transport = self.connector.connect(addr)?;
        let resp = transport.begin_copy_session(&self.tablet_id)?;
        let session_id: SessionId = resp.session_id.clone();

        let init = RemoteDescriptor::from_response(&self.tablet_id, resp).and_then(|remote| {
            let meta = init_local_metadata(&self.layout, &remote)?;
            Ok((remote, meta))
        });
        let (remote, meta) = match init {
            Ok(v) => v,
            Err(e) => {
                if let Err(end_err) = transport.end_copy_session(&session_id, false) {
                    tracing::warn!("Failed to end copy session {}: {}", session_id, end_err);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Starting copy of tablet {} from {} (session {}, {} blocks, {} WAL segments)",
            self.tablet_id,
            addr,
            remote.session_id,
            remote.count_blocks(),
            remote.wal_seqnos.len()
        );
        self.local = Some(LocalDescriptor::new(&remote.superblock));
        self.meta = Some(meta.clone());
        self.session = Some(Arc::new(Session { transport, remote }));
        self.state = SessionState::Started;
        Ok(meta)
    }

    /// Download every block and WAL segment, then commit.
    pub fn fetch_all(&mut self, listener: Option<&dyn CopyProgressListener>) -> CopyResult<()> {
        let noop = NoopProgressListener;
        let listener: &dyn CopyProgressListener = match listener {
            Some(l) => l,
            None => &noop,
        };
        listener.status_message(&format!("Copying tablet {}", self.tablet_id));
        self.download_blocks_with_listener(listener)?;
        self.download_wals_with_listener(listener)?;
        self.finish()?;
        listener.status_message(&format!("Tablet {} copy complete", self.tablet_id));
        Ok(())
    }

    pub fn download_blocks(&mut self) -> CopyResult<()> {
        self.download_blocks_with_listener(&NoopProgressListener)
    }

    /// Download every remote block whose slot is not yet backed by a local
    /// block. Successful downloads are mapped even when another one fails.
    pub fn download_blocks_with_listener(
        &mut self,
        listener: &dyn CopyProgressListener,
    ) -> CopyResult<()> {
        self.enter_copying("download blocks")?;
        let session = self.session()?;
        let pending = self.local_descriptor()?.unmapped_slots();
        if pending.is_empty() {
            return Ok(());
        }
        tracing::info!(
            "Downloading {} of {} blocks of tablet {}",
            pending.len(),
            session.remote.count_blocks(),
            self.tablet_id
        );
        let tracker = ProgressTracker::new(listener, self.progress());
        let (done, err) = self.download_slots(&session, pending, &tracker);

        let local = self.local_descriptor_mut()?;
        for (slot, block) in done {
            local.map_block(slot, block);
        }
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Download one remote block into a newly allocated local block and
    /// return its id. The block is not mapped into the local superblock.
    pub fn download_block(&mut self, remote_id: BlockId) -> CopyResult<BlockId> {
        self.enter_copying("download block")?;
        let session = self.session()?;
        let tracker = ProgressTracker::new(&NoopProgressListener, self.progress());
        self.transfer_block(&session, remote_id, &tracker)
    }

    pub fn download_wals(&mut self) -> CopyResult<()> {
        self.download_wals_with_listener(&NoopProgressListener)
    }

    /// Download every required WAL segment not downloaded yet, oldest first.
    pub fn download_wals_with_listener(
        &mut self,
        listener: &dyn CopyProgressListener,
    ) -> CopyResult<()> {
        self.enter_copying("download WAL segments")?;
        let session = self.session()?;
        let tracker = ProgressTracker::new(listener, self.progress());
        for &seqno in &session.remote.wal_seqnos {
            if self.downloaded_wals.contains(&seqno) {
                continue;
            }
            listener.status_message(&format!(
                "Downloading WAL segment {} ({}/{})",
                seqno,
                tracker.wal_segments_downloaded.load(Ordering::Relaxed) + 1,
                tracker.total_wal_segments
            ));
            self.transfer_wal_segment(&session, seqno, &tracker)?;
        }
        Ok(())
    }

    /// Download one required WAL segment into the tablet's WAL directory.
    pub fn download_wal_segment(&mut self, seqno: u64) -> CopyResult<()> {
        self.enter_copying("download WAL segment")?;
        let session = self.session()?;
        let tracker = ProgressTracker::new(&NoopProgressListener, self.progress());
        self.transfer_wal_segment(&session, seqno, &tracker)
    }

    /// Commit the copy: persist the local superblock and mark the tablet
    /// `Ready`. Requires every block and WAL segment to be downloaded.
    pub fn finish(&mut self) -> CopyResult<()> {
        match self.state {
            SessionState::Started => self.state = SessionState::Copying,
            SessionState::Copying => {}
            state => {
                return Err(CopyError::illegal_state(format!(
                    "cannot finish tablet copy of {} in state {}",
                    self.tablet_id, state
                )));
            }
        }
        let session = self.session()?;
        let superblock = self.local_descriptor()?.build()?;
        let missing: Vec<u64> = session
            .remote
            .wal_seqnos
            .iter()
            .filter(|s| !self.downloaded_wals.contains(*s))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(CopyError::illegal_state(format!(
                "{} WAL segments of tablet {} not downloaded: {:?}",
                missing.len(),
                self.tablet_id,
                missing
            )));
        }

        let meta = self.metadata_handle()?;
        meta.replace_superblock(superblock);
        meta.set_data_state(TabletDataState::Ready);
        meta.set_tombstone_last_logged_seqno(None);
        meta.flush()?;

        self.state = SessionState::Finished;
        *self.created.lock() = CreatedObjects::default();
        metrics::counter!("tablet_copy_sessions_total", "outcome" => "finished").increment(1);
        let m = self.metrics.snapshot();
        tracing::info!(
            "Finished copy of tablet {}: {} blocks, {} WAL segments, {} bytes",
            self.tablet_id,
            m.blocks_downloaded,
            m.wal_segments_downloaded,
            m.bytes_downloaded
        );
        end_remote_session(&session, true);
        Ok(())
    }

    /// Roll back: delete every block and WAL segment this session created and
    /// tombstone the local metadata. Every cleanup step is attempted; the
    /// first failure is returned and the session stays abortable.
    pub fn abort(&mut self) -> CopyResult<()> {
        match self.state {
            SessionState::Aborted => return Ok(()),
            SessionState::Finished => {
                return Err(CopyError::illegal_state(format!(
                    "tablet copy of {} already finished",
                    self.tablet_id
                )));
            }
            SessionState::NotStarted => {
                self.state = SessionState::Aborted;
                return Ok(());
            }
            SessionState::Started | SessionState::Copying => {}
        }
        let session = self.session()?;
        let mut first_err: Option<CopyError> = None;
        let created = std::mem::take(&mut *self.created.lock());
        let mut leftover = CreatedObjects::default();

        for id in created.blocks {
            match self.block_manager.delete_block(id) {
                Ok(()) | Err(StorageError::BlockNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!("Failed to delete block {} of aborted copy: {}", id, e);
                    leftover.blocks.insert(id);
                    first_err.get_or_insert(e.into());
                }
            }
        }
        for path in created.wal_paths {
            if let Err(e) = self.layout.remove(&path) {
                tracing::warn!(
                    "Failed to delete WAL segment {} of aborted copy: {}",
                    path.display(),
                    e
                );
                leftover.wal_paths.insert(path);
                first_err.get_or_insert(e.into());
            }
        }
        if created.wal_dir {
            leftover.wal_dir = true;
            match self.layout.remove_wal_dir_if_empty(&self.tablet_id) {
                Ok(_) => leftover.wal_dir = !leftover.wal_paths.is_empty(),
                Err(e) => {
                    tracing::warn!("Failed to remove WAL dir of tablet {}: {}", self.tablet_id, e);
                    first_err.get_or_insert(e.into());
                }
            }
        }
        self.downloaded_wals.clear();
        let local = LocalDescriptor::new(&session.remote.superblock);
        let empty = local.empty();
        self.local = Some(local);

        let meta = self.metadata_handle()?;
        meta.replace_superblock(empty);
        meta.set_data_state(TabletDataState::Tombstoned);
        meta.set_tombstone_last_logged_seqno(session.remote.wal_seqnos.last().copied());
        if let Err(e) = meta.flush() {
            tracing::warn!("Failed to persist tombstone of tablet {}: {}", self.tablet_id, e);
            first_err.get_or_insert(e.into());
        }

        if let Some(e) = first_err {
            let mut created = self.created.lock();
            created.blocks.extend(leftover.blocks);
            created.wal_paths.extend(leftover.wal_paths);
            created.wal_dir |= leftover.wal_dir;
            return Err(e);
        }

        self.state = SessionState::Aborted;
        metrics::counter!("tablet_copy_sessions_total", "outcome" => "aborted").increment(1);
        tracing::info!("Aborted copy of tablet {}", self.tablet_id);
        end_remote_session(&session, false);
        Ok(())
    }

    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Superblock as returned by the peer, in the peer's block namespace.
    pub fn remote_superblock(&self) -> Option<&TabletSuperBlock> {
        self.session.as_ref().map(|s| &s.remote.superblock)
    }

    /// Local superblock built so far; slots not downloaded yet are omitted.
    pub fn local_superblock(&self) -> Option<TabletSuperBlock> {
        self.local.as_ref().map(LocalDescriptor::partial)
    }

    pub fn wal_seqnos(&self) -> &[u64] {
        match &self.session {
            Some(s) => &s.remote.wal_seqnos,
            None => &[],
        }
    }

    pub fn count_remote_blocks(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.remote.count_blocks())
    }

    pub fn meta(&self) -> Option<&Arc<TabletMetadata>> {
        self.meta.as_ref()
    }

    /// Local blocks created by this session and not yet committed or removed.
    pub fn created_blocks(&self) -> Vec<BlockId> {
        self.created.lock().blocks.iter().copied().collect()
    }

    pub fn metrics(&self) -> CopyMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Handle that stops the session's transfers before their next request.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn progress(&self) -> CopyProgress {
        CopyProgress {
            total_blocks: self.count_remote_blocks(),
            blocks_downloaded: self.local.as_ref().map_or(0, LocalDescriptor::mapped_count),
            total_wal_segments: self.wal_seqnos().len(),
            wal_segments_downloaded: self.downloaded_wals.len(),
            bytes_downloaded: self.metrics.snapshot().bytes_downloaded,
        }
    }

    fn enter_copying(&mut self, op: &str) -> CopyResult<()> {
        match self.state {
            SessionState::Started => {
                self.state = SessionState::Copying;
                Ok(())
            }
            SessionState::Copying => Ok(()),
            state => Err(CopyError::illegal_state(format!(
                "cannot {} of tablet {} in state {}",
                op, self.tablet_id, state
            ))),
        }
    }

    fn session(&self) -> CopyResult<Arc<Session>> {
        self.session
            .clone()
            .ok_or_else(|| CopyError::illegal_state("no copy session open"))
    }

    fn metadata_handle(&self) -> CopyResult<Arc<TabletMetadata>> {
        self.meta
            .clone()
            .ok_or_else(|| CopyError::illegal_state("tablet metadata not initialized"))
    }

    fn local_descriptor(&self) -> CopyResult<&LocalDescriptor> {
        self.local
            .as_ref()
            .ok_or_else(|| CopyError::illegal_state("local superblock not initialized"))
    }

    fn local_descriptor_mut(&mut self) -> CopyResult<&mut LocalDescriptor> {
        self.local
            .as_mut()
            .ok_or_else(|| CopyError::illegal_state("local superblock not initialized"))
    }

    fn transfer_context(&self) -> TransferContext<'_> {
        TransferContext {
            tablet_id: &self.tablet_id,
            max_chunk_len: self.config.transfer_chunk_size_bytes,
            cancel: &self.cancel,
        }
    }

    /// Download `pending` slots, sequentially or over a scoped worker pool.
    /// Returns the slots that completed plus the first failure, if any.
    fn download_slots(
        &self,
        session: &Session,
        pending: Vec<(BlockSlot, BlockId)>,
        tracker: &ProgressTracker<'_>,
    ) -> (Vec<(BlockSlot, BlockId)>, Option<CopyError>) {
        let workers = self.config.max_concurrent_downloads.clamp(1, pending.len().max(1));
        if workers == 1 {
            let mut done = Vec::with_capacity(pending.len());
            for (slot, remote) in pending {
                match self.download_slot(session, slot, remote, tracker) {
                    Ok(local) => done.push((slot, local)),
                    Err(e) => return (done, Some(e)),
                }
            }
            return (done, None);
        }

        let queue = Mutex::new(VecDeque::from(pending));
        let done = Mutex::new(Vec::new());
        let first_err: Mutex<Option<CopyError>> = Mutex::new(None);
        let (queue_ref, done_ref, err_ref) = (&queue, &done, &first_err);
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(move || loop {
                        if err_ref.lock().is_some() {
                            break;
                        }
                        let Some((slot, remote)) = queue_ref.lock().pop_front() else {
                            break;
                        };
                        match self.download_slot(session, slot, remote, tracker) {
                            Ok(local) => done_ref.lock().push((slot, local)),
                            Err(e) => {
                                err_ref.lock().get_or_insert(e);
                                break;
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                if h.join().is_err() {
                    first_err.lock().get_or_insert_with(|| {
                        CopyError::illegal_state("block download worker panicked")
                    });
                }
            }
        });
        (done.into_inner(), first_err.into_inner())
    }

    fn download_slot(
        &self,
        session: &Session,
        slot: BlockSlot,
        remote: BlockId,
        tracker: &ProgressTracker<'_>,
    ) -> CopyResult<BlockId> {
        tracker.listener.status_message(&format!(
            "Downloading block {} ({}, {}/{})",
            remote,
            slot,
            tracker.blocks_downloaded.load(Ordering::Relaxed) + 1,
            tracker.total_blocks
        ));
        let local = self.transfer_block(session, remote, tracker)?;
        tracing::debug!(
            "Tablet {}: remote block {} ({}) stored as local block {}",
            self.tablet_id,
            remote,
            slot,
            local
        );
        Ok(local)
    }

    fn transfer_block(
        &self,
        session: &Session,
        remote: BlockId,
        tracker: &ProgressTracker<'_>,
    ) -> CopyResult<BlockId> {
        let sink = BlockSink::new(self.block_manager.create_block()?);
        let local_id = sink.block_id();
        self.created.lock().blocks.insert(local_id);

        let result = fetch_object(
            &self.transfer_context(),
            &format!("block {}", remote),
            |offset, max_len| {
                session.transport.fetch_block_chunk(
                    &session.remote.session_id,
                    remote,
                    offset,
                    max_len,
                )
            },
            sink,
            |n| {
                self.metrics.record_chunk(n);
                tracker.add_bytes(n);
            },
        );
        match result {
            Ok((local, _bytes)) => {
                self.metrics.record_block();
                tracker.block_done();
                Ok(local)
            }
            Err(e) => {
                self.metrics.record_failure();
                // The partial block stays recorded for abort if this fails.
                match self.block_manager.delete_block(local_id) {
                    Ok(()) | Err(StorageError::BlockNotFound(_)) => {
                        self.created.lock().blocks.remove(&local_id);
                    }
                    Err(del_err) => tracing::warn!(
                        "Failed to delete partial block {}: {}",
                        local_id,
                        del_err
                    ),
                }
                Err(e)
            }
        }
    }

    fn transfer_wal_segment(
        &mut self,
        session: &Session,
        seqno: u64,
        tracker: &ProgressTracker<'_>,
    ) -> CopyResult<()> {
        if !session.remote.wal_seqnos.contains(&seqno) {
            return Err(CopyError::invalid_argument(format!(
                "WAL segment {} is not part of the copy of tablet {}",
                seqno, self.tablet_id
            )));
        }
        if !self.layout.exists(&self.layout.wal_dir(&self.tablet_id)) {
            self.layout.ensure_wal_dir(&self.tablet_id)?;
            self.created.lock().wal_dir = true;
        }
        let path = self.layout.wal_segment_path(&self.tablet_id, seqno);
        if self.layout.exists(&path) {
            if !self.created.lock().wal_paths.contains(&path) {
                return Err(CopyError::AlreadyPresent(format!(
                    "WAL segment {} already exists",
                    path.display()
                )));
            }
            // Left over from an earlier attempt of this session.
            self.layout.remove(&path)?;
            self.downloaded_wals.remove(&seqno);
        }
        self.created.lock().wal_paths.insert(path.clone());
        let sink = WalSegmentSink::create(&path)?;

        let result = fetch_object(
            &self.transfer_context(),
            &format!("WAL segment {}", seqno),
            |offset, max_len| {
                session.transport.fetch_wal_chunk(
                    &session.remote.session_id,
                    seqno,
                    offset,
                    max_len,
                )
            },
            sink,
            |n| {
                self.metrics.record_chunk(n);
                tracker.add_bytes(n);
            },
        );
        match result {
            Ok((_, bytes)) => {
                self.downloaded_wals.insert(seqno);
                self.metrics.record_wal_segment();
                tracker.wal_segment_done();
                tracing::debug!(
                    "Tablet {}: downloaded WAL segment {} ({} bytes)",
                    self.tablet_id,
                    seqno,
                    bytes
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failure();
                Err(e)
            }
        }
    }
}

impl Drop for TabletCopyClient {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Started | SessionState::Copying) {
            if let Err(e) = self.abort() {
                tracing::error!(
                    "Failed to abort tablet copy of {} on drop: {}",
                    self.tablet_id,
                    e
                );
            }
        }
    }
}
