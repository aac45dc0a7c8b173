//! Wire chunk and its per-chunk verification.

use serde::{Deserialize, Serialize};

use tablet_common::error::{CopyError, CopyResult};

/// Unit of transfer for blocks and WAL segments.
///
/// `crc32` is the CRC32-C of `data` alone. `total_data_length` is the final
/// size of the object being streamed and is the same on every chunk of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChunk {
    pub offset: u64,
    pub data: Vec<u8>,
    pub crc32: u32,
    pub total_data_length: u64,
}

impl DataChunk {
    /// Build a chunk with a freshly computed checksum.
    pub fn new(offset: u64, data: Vec<u8>, total_data_length: u64) -> Self {
        let crc32 = crc32c::crc32c(&data);
        Self {
            offset,
            data,
            crc32,
            total_data_length,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Check one chunk against the stream position and its checksum before any
/// of its bytes are persisted. `expected_offset` is the number of bytes
/// already accepted for the object.
pub fn verify_data(expected_offset: u64, chunk: &DataChunk) -> CopyResult<()> {
    if chunk.offset != expected_offset {
        return Err(CopyError::invalid_argument(format!(
            "Offset did not match what was asked for: expected {}, got {}",
            expected_offset, chunk.offset
        )));
    }
    let actual = crc32c::crc32c(&chunk.data);
    if actual != chunk.crc32 {
        return Err(CopyError::corruption(format!(
            "CRC32 does not match at offset {} size {}: expected {:#010x}, got {:#010x}",
            chunk.offset,
            chunk.data.len(),
            chunk.crc32,
            actual
        )));
    }
    Ok(())
}
