//! Reconciles the source peer's superblock with the local replica.
//!
//! The remote superblock names blocks in the peer's id namespace. The local
//! descriptor keeps the same structure and fills a slot → local id table as
//! blocks arrive; nothing assumes a remote id means anything locally.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tablet_common::error::{CopyError, CopyResult, StorageError};
use tablet_common::types::{BlockId, SessionId, TabletId};
use tablet_storage::{BlockSlot, FsLayout, TabletDataState, TabletMetadata, TabletSuperBlock};

use crate::transport::BeginSessionResponse;

/// Immutable snapshot of the source tablet taken at session start.
#[derive(Debug, Clone)]
pub struct RemoteDescriptor {
    pub session_id: SessionId,
    pub superblock: TabletSuperBlock,
    /// Required WAL segments, oldest first, without duplicates.
    pub wal_seqnos: Vec<u64>,
}

impl RemoteDescriptor {
    pub fn from_response(requested: &TabletId, resp: BeginSessionResponse) -> CopyResult<Self> {
        if &resp.superblock.tablet_id != requested {
            return Err(CopyError::invalid_argument(format!(
                "peer returned superblock for tablet {} in session {}, requested {}",
                resp.superblock.tablet_id, resp.session_id, requested
            )));
        }
        let mut seen = BTreeSet::new();
        for (slot, remote) in resp.superblock.block_slots() {
            if !seen.insert(slot) {
                return Err(CopyError::invalid_argument(format!(
                    "peer superblock of tablet {} lists {} twice (remote block {})",
                    requested, slot, remote
                )));
            }
        }
        let mut wal_seqnos = resp.wal_seqnos;
        wal_seqnos.sort_unstable();
        wal_seqnos.dedup();
        Ok(Self {
            session_id: resp.session_id,
            superblock: resp.superblock,
            wal_seqnos,
        })
    }

    pub fn count_blocks(&self) -> usize {
        self.superblock.count_blocks()
    }
}

/// Local superblock under construction.
#[derive(Debug, Clone)]
pub struct LocalDescriptor {
    template: TabletSuperBlock,
    mapping: BTreeMap<BlockSlot, BlockId>,
}

impl LocalDescriptor {
    pub fn new(remote: &TabletSuperBlock) -> Self {
        Self {
            template: remote.clone(),
            mapping: BTreeMap::new(),
        }
    }

    /// Record the local block now filling `slot`. Returns the block that
    /// filled it before, if any.
    pub fn map_block(&mut self, slot: BlockSlot, local: BlockId) -> Option<BlockId> {
        self.mapping.insert(slot, local)
    }

    pub fn local_block(&self, slot: &BlockSlot) -> Option<BlockId> {
        self.mapping.get(slot).copied()
    }

    pub fn mapped_count(&self) -> usize {
        self.mapping.len()
    }

    /// Remote slots not yet backed by a local block, with their remote ids.
    pub fn unmapped_slots(&self) -> Vec<(BlockSlot, BlockId)> {
        self.template
            .block_slots()
            .into_iter()
            .filter(|(slot, _)| !self.mapping.contains_key(slot))
            .collect()
    }

    /// Superblock with zero referenced blocks.
    pub fn empty(&self) -> TabletSuperBlock {
        self.template.without_rowsets()
    }

    /// Superblock of the blocks downloaded so far.
    pub fn partial(&self) -> TabletSuperBlock {
        self.template.remap_blocks(&self.mapping)
    }

    /// Complete local superblock. Every remote slot must be mapped.
    pub fn build(&self) -> CopyResult<TabletSuperBlock> {
        let missing = self.unmapped_slots();
        if let Some((slot, remote)) = missing.first() {
            return Err(CopyError::illegal_state(format!(
                "{} of {} blocks not downloaded (first missing: {} remote block {})",
                missing.len(),
                self.template.count_blocks(),
                slot,
                remote
            )));
        }
        Ok(self.template.remap_blocks(&self.mapping))
    }
}

/// Create the local metadata record in `Copying` state with an empty
/// superblock. An existing record is replaced only when it is a tombstone.
pub fn init_local_metadata(
    layout: &FsLayout,
    remote: &RemoteDescriptor,
) -> CopyResult<Arc<TabletMetadata>> {
    let tablet_id = &remote.superblock.tablet_id;
    match TabletMetadata::load(layout, tablet_id) {
        Ok(existing) => match existing.data_state() {
            TabletDataState::Tombstoned | TabletDataState::Deleted => {
                tracing::info!(
                    "Replacing {} metadata of tablet {} with a fresh copy",
                    existing.data_state(),
                    tablet_id
                );
            }
            state => {
                return Err(CopyError::AlreadyPresent(format!(
                    "tablet {} already exists locally in state {}",
                    tablet_id, state
                )));
            }
        },
        Err(StorageError::MetadataNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    let meta = TabletMetadata::create(
        layout,
        remote.superblock.without_rowsets(),
        TabletDataState::Copying,
    )?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_storage::{BlockRole, ColumnBlock, RowSetDescriptor};
    use tempfile::TempDir;

    fn remote_superblock() -> TabletSuperBlock {
        let mut sb = TabletSuperBlock::new(TabletId::new("t1"), "orders");
        sb.rowsets.push(RowSetDescriptor {
            id: 5,
            columns: vec![
                ColumnBlock { column_id: 0, block: BlockId(500) },
                ColumnBlock { column_id: 1, block: BlockId(501) },
            ],
            bloom_block: Some(BlockId(502)),
            ..Default::default()
        });
        sb
    }

    fn response(seqnos: Vec<u64>) -> BeginSessionResponse {
        BeginSessionResponse {
            session_id: SessionId("s1".into()),
            superblock: remote_superblock(),
            wal_seqnos: seqnos,
        }
    }

    #[test]
    fn test_remote_descriptor_orders_wal_seqnos() {
        let remote = RemoteDescriptor::from_response(&TabletId::new("t1"), response(vec![4, 2, 3, 2]))
            .unwrap();
        assert_eq!(remote.wal_seqnos, vec![2, 3, 4]);
        assert_eq!(remote.count_blocks(), 3);
    }

    #[test]
    fn test_remote_descriptor_rejects_wrong_tablet() {
        let err = RemoteDescriptor::from_response(&TabletId::new("other"), response(vec![]))
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_remote_descriptor_rejects_repeated_column() {
        let mut resp = response(vec![]);
        resp.superblock.rowsets[0].columns.push(ColumnBlock {
            column_id: 0,
            block: BlockId(599),
        });
        let err = RemoteDescriptor::from_response(&TabletId::new("t1"), resp).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(err.to_string().contains("rowset 5 column 0"));
    }

    #[test]
    fn test_remote_descriptor_rejects_repeated_rowset_id() {
        let mut resp = response(vec![]);
        let again = resp.superblock.rowsets[0].clone();
        resp.superblock.rowsets.push(again);
        let err = RemoteDescriptor::from_response(&TabletId::new("t1"), resp).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_local_descriptor_starts_empty() {
        let local = LocalDescriptor::new(&remote_superblock());
        assert_eq!(local.mapped_count(), 0);
        assert_eq!(local.partial().count_blocks(), 0);
        assert_eq!(local.empty().count_blocks(), 0);
        assert_eq!(local.unmapped_slots().len(), 3);
        assert!(local.build().unwrap_err().is_illegal_state());
    }

    #[test]
    fn test_local_descriptor_remaps_independently_of_remote_ids() {
        let remote = remote_superblock();
        let mut local = LocalDescriptor::new(&remote);
        for (i, (slot, _)) in remote.block_slots().into_iter().enumerate() {
            assert!(local.map_block(slot, BlockId(i as u64 + 1)).is_none());
        }
        let built = local.build().unwrap();
        assert_eq!(built.list_blocks(), vec![BlockId(1), BlockId(2), BlockId(3)]);
        assert_eq!(built.rowsets[0].id, 5);
        let bloom = BlockSlot { rowset_id: 5, role: BlockRole::Bloom };
        assert_eq!(local.local_block(&bloom), Some(BlockId(3)));
    }

    #[test]
    fn test_init_metadata_fresh_and_over_tombstone() {
        let dir = TempDir::new().unwrap();
        let layout = FsLayout::new(dir.path());
        let remote = RemoteDescriptor::from_response(&TabletId::new("t1"), response(vec![1])).unwrap();

        let meta = init_local_metadata(&layout, &remote).unwrap();
        assert_eq!(meta.data_state(), TabletDataState::Copying);
        assert_eq!(meta.superblock().count_blocks(), 0);

        // A second copy over a live (non-tombstoned) record is refused.
        let err = init_local_metadata(&layout, &remote).unwrap_err();
        assert!(matches!(err, CopyError::AlreadyPresent(_)));

        meta.set_data_state(TabletDataState::Tombstoned);
        meta.flush().unwrap();
        let meta = init_local_metadata(&layout, &remote).unwrap();
        assert_eq!(meta.data_state(), TabletDataState::Copying);
    }
}
