//! Transport seam between the copy client and the source peer.
//!
//! The client only ever talks to a `CopyTransport`; how requests reach the
//! peer (RPC, in-process, test doubles) is the implementation's business.
//! Timeouts and connection failures surface as `TransportError`s and are
//! never retried at this layer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use tablet_common::error::{CopyResult, TransportError};
use tablet_common::types::{BlockId, HostPort, SessionId, TabletId};
use tablet_storage::TabletSuperBlock;

use crate::chunk::DataChunk;

/// Reply to `begin_copy_session`: a snapshot of the source tablet's layout
/// taken when the session opened.
#[derive(Debug, Clone)]
pub struct BeginSessionResponse {
    pub session_id: SessionId,
    pub superblock: TabletSuperBlock,
    /// WAL segments needed to replay the tablet from its last durable point.
    pub wal_seqnos: Vec<u64>,
}

/// Requests a copy client issues to the source peer. All calls block until a
/// response or a transport failure.
pub trait CopyTransport: Send + Sync {
    fn begin_copy_session(&self, tablet_id: &TabletId) -> CopyResult<BeginSessionResponse>;

    fn fetch_block_chunk(
        &self,
        session_id: &SessionId,
        block_id: BlockId,
        offset: u64,
        max_length: u64,
    ) -> CopyResult<DataChunk>;

    fn fetch_wal_chunk(
        &self,
        session_id: &SessionId,
        seqno: u64,
        offset: u64,
        max_length: u64,
    ) -> CopyResult<DataChunk>;

    /// Release the session on the peer. `is_success` tells the peer whether
    /// the copy was committed.
    fn end_copy_session(&self, session_id: &SessionId, is_success: bool) -> CopyResult<()>;
}

/// Resolves a peer address to a transport.
pub trait TransportConnector: Send + Sync {
    fn connect(&self, addr: &HostPort) -> CopyResult<Arc<dyn CopyTransport>>;
}

/// Connector over a fixed, in-process table of peers.
#[derive(Default)]
pub struct InProcessConnector {
    peers: Mutex<HashMap<HostPort, Arc<dyn CopyTransport>>>,
}

impl InProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: HostPort, transport: Arc<dyn CopyTransport>) {
        self.peers.lock().insert(addr, transport);
    }

    pub fn unregister(&self, addr: &HostPort) {
        self.peers.lock().remove(addr);
    }
}

impl TransportConnector for InProcessConnector {
    fn connect(&self, addr: &HostPort) -> CopyResult<Arc<dyn CopyTransport>> {
        self.peers
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(addr.to_string()).into())
    }
}
