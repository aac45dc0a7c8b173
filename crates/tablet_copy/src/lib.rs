//! Client side of tablet copy.
//!
//! A new replica of a tablet is bootstrapped by streaming the source peer's
//! data blocks and WAL segments in checksummed chunks, remapping every block
//! into the local id namespace, and committing the result atomically. A copy
//! that does not reach `finish` leaves nothing behind but a tombstone.

pub mod chunk;
pub mod client;
pub mod local_source;
pub mod progress;
pub mod reconciler;
pub mod transfer;
pub mod transport;

pub use chunk::{verify_data, DataChunk};
pub use client::{SessionState, TabletCopyClient};
pub use local_source::LocalTabletSource;
pub use progress::{
    CopyMetrics, CopyMetricsSnapshot, CopyProgress, CopyProgressListener, LoggingProgressListener,
    NoopProgressListener,
};
pub use reconciler::{LocalDescriptor, RemoteDescriptor};
pub use transfer::{ChunkSink, TransferContext};
pub use transport::{BeginSessionResponse, CopyTransport, InProcessConnector, TransportConnector};
