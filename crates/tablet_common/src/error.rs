use thiserror::Error;

use crate::types::{BlockId, TabletId};

/// Convenience alias for `Result<T, CopyError>`.
pub type CopyResult<T> = Result<T, CopyError>;

/// Error classification used by callers deciding whether to re-fetch,
/// abort, or escalate.
///
/// - `Transport`      : peer unreachable, session rejected, connection reset
/// - `InvalidArgument`: stream position mismatch or malformed request
/// - `Corruption`     : checksum mismatch or truncated stream; re-fetch from scratch
/// - `NotFound`       : an object expected to be present is absent
/// - `IllegalState`   : operation not allowed in the current session state
/// - `Storage`        : local disk / block manager failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    InvalidArgument,
    Corruption,
    NotFound,
    IllegalState,
    Storage,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum CopyError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Already present: {0}")]
    AlreadyPresent(String),

    #[error("Tablet copy of {0} cancelled")]
    Cancelled(TabletId),
}

/// Errors surfaced by the transport to the remote peer. This layer never
/// retries them.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(String),

    #[error("request rejected by peer: {0}")]
    Rejected(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("no such copy session: {0}")]
    NoSession(String),
}

/// Local storage errors (block manager, filesystem layout, metadata).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Tablet metadata not found: {0}")]
    MetadataNotFound(TabletId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Metadata checksum mismatch for {path}: expected {expected:#010x}, got {actual:#010x}")]
    MetadataChecksum {
        path: String,
        expected: u32,
        actual: u32,
    },
}

impl CopyError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CopyError::Transport(_) => ErrorKind::Transport,
            CopyError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CopyError::Corruption(_) => ErrorKind::Corruption,
            CopyError::Storage(StorageError::MetadataChecksum { .. }) => ErrorKind::Corruption,
            CopyError::NotFound(_) => ErrorKind::NotFound,
            CopyError::Storage(StorageError::BlockNotFound(_)) => ErrorKind::NotFound,
            CopyError::Storage(StorageError::MetadataNotFound(_)) => ErrorKind::NotFound,
            CopyError::Storage(_) => ErrorKind::Storage,
            CopyError::IllegalState(_) => ErrorKind::IllegalState,
            CopyError::AlreadyPresent(_) => ErrorKind::IllegalState,
            CopyError::Cancelled(_) => ErrorKind::IllegalState,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport)
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidArgument)
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self.kind(), ErrorKind::Corruption)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self.kind(), ErrorKind::IllegalState)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        CopyError::InvalidArgument(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        CopyError::Corruption(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        CopyError::IllegalState(msg.into())
    }
}

impl From<std::io::Error> for CopyError {
    fn from(e: std::io::Error) -> Self {
        CopyError::Storage(StorageError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let e: CopyError = TransportError::Unreachable("10.0.0.1:7050".into()).into();
        assert_eq!(e.kind(), ErrorKind::Transport);
        assert!(e.is_transport());

        assert!(CopyError::corruption("bad crc").is_corruption());
        assert!(CopyError::invalid_argument("bad offset").is_invalid_argument());
        assert!(CopyError::illegal_state("not started").is_illegal_state());

        let e: CopyError = StorageError::BlockNotFound(BlockId(7)).into();
        assert!(e.is_not_found());

        let e: CopyError = StorageError::MetadataChecksum {
            path: "/m".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(e.is_corruption());
    }

    #[test]
    fn test_io_error_is_storage() {
        let e: CopyError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(e.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_display_carries_context() {
        let e = CopyError::Cancelled(TabletId::new("t1"));
        assert_eq!(e.to_string(), "Tablet copy of t1 cancelled");
        let e: CopyError = TransportError::Timeout(500).into();
        assert!(e.to_string().contains("500ms"));
    }
}
