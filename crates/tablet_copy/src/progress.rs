//! Progress reporting and counters for a copy session.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time progress of a copy session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyProgress {
    pub total_blocks: usize,
    pub blocks_downloaded: usize,
    pub total_wal_segments: usize,
    pub wal_segments_downloaded: usize,
    pub bytes_downloaded: u64,
}

/// Observer of a running copy. Both hooks default to no-ops. Called from the
/// download workers, hence `Sync`.
pub trait CopyProgressListener: Send + Sync {
    /// Human-readable status, e.g. "Downloading block 3/12".
    fn status_message(&self, _msg: &str) {}

    fn on_progress(&self, _progress: &CopyProgress) {}
}

/// Listener used when the caller supplies none.
pub struct NoopProgressListener;

impl CopyProgressListener for NoopProgressListener {}

/// Forwards status messages to the log.
pub struct LoggingProgressListener;

impl CopyProgressListener for LoggingProgressListener {
    fn status_message(&self, msg: &str) {
        tracing::info!("{}", msg);
    }

    fn on_progress(&self, p: &CopyProgress) {
        tracing::debug!(
            "Copy progress: blocks {}/{}, WAL segments {}/{}, {} bytes",
            p.blocks_downloaded,
            p.total_blocks,
            p.wal_segments_downloaded,
            p.total_wal_segments,
            p.bytes_downloaded
        );
    }
}

/// Counters for one copy session.
#[derive(Debug, Default)]
pub struct CopyMetrics {
    pub bytes_downloaded: AtomicU64,
    pub chunks_received: AtomicU64,
    pub blocks_downloaded: AtomicU64,
    pub wal_segments_downloaded: AtomicU64,
    /// Objects whose transfer failed (verification or transport).
    pub failed_transfers: AtomicU64,
}

impl CopyMetrics {
    pub fn record_chunk(&self, bytes: usize) {
        self.bytes_downloaded.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tablet_copy_bytes_total").increment(bytes as u64);
    }

    pub fn record_block(&self) {
        self.blocks_downloaded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tablet_copy_blocks_total").increment(1);
    }

    pub fn record_wal_segment(&self) {
        self.wal_segments_downloaded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tablet_copy_wal_segments_total").increment(1);
    }

    pub fn record_failure(&self) {
        self.failed_transfers.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tablet_copy_failed_transfers_total").increment(1);
    }

    pub fn snapshot(&self) -> CopyMetricsSnapshot {
        CopyMetricsSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            blocks_downloaded: self.blocks_downloaded.load(Ordering::Relaxed),
            wal_segments_downloaded: self.wal_segments_downloaded.load(Ordering::Relaxed),
            failed_transfers: self.failed_transfers.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of `CopyMetrics` for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyMetricsSnapshot {
    pub bytes_downloaded: u64,
    pub chunks_received: u64,
    pub blocks_downloaded: u64,
    pub wal_segments_downloaded: u64,
    pub failed_transfers: u64,
}
