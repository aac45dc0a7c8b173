//! Tablet superblock: the structured listing of a tablet's data blocks.
//!
//! Every block referenced by a superblock occupies a `BlockSlot`, its
//! structural position (rowset + role). Slots are what a copy maps from the
//! remote superblock to the local one; block ids themselves are never
//! compared across nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tablet_common::types::{BlockId, TabletId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnBlock {
    pub column_id: u32,
    pub block: BlockId,
}

/// One on-disk rowset: base column data plus its auxiliary blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSetDescriptor {
    pub id: u64,
    pub columns: Vec<ColumnBlock>,
    pub bloom_block: Option<BlockId>,
    pub adhoc_index_block: Option<BlockId>,
    pub redo_deltas: Vec<BlockId>,
    pub undo_deltas: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSuperBlock {
    pub tablet_id: TabletId,
    pub table_name: String,
    pub schema_version: u32,
    pub rowsets: Vec<RowSetDescriptor>,
}

/// Structural role of a block within its rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockRole {
    Column(u32),
    Bloom,
    AdhocIndex,
    RedoDelta(usize),
    UndoDelta(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockSlot {
    pub rowset_id: u64,
    pub role: BlockRole,
}

impl std::fmt::Display for BlockSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.role {
            BlockRole::Column(c) => write!(f, "rowset {} column {}", self.rowset_id, c),
            BlockRole::Bloom => write!(f, "rowset {} bloom", self.rowset_id),
            BlockRole::AdhocIndex => write!(f, "rowset {} adhoc index", self.rowset_id),
            BlockRole::RedoDelta(i) => write!(f, "rowset {} redo delta {}", self.rowset_id, i),
            BlockRole::UndoDelta(i) => write!(f, "rowset {} undo delta {}", self.rowset_id, i),
        }
    }
}

impl RowSetDescriptor {
    fn slots(&self) -> Vec<(BlockSlot, BlockId)> {
        let slot = |role| BlockSlot {
            rowset_id: self.id,
            role,
        };
        let mut out = Vec::new();
        for col in &self.columns {
            out.push((slot(BlockRole::Column(col.column_id)), col.block));
        }
        if let Some(b) = self.bloom_block {
            out.push((slot(BlockRole::Bloom), b));
        }
        if let Some(b) = self.adhoc_index_block {
            out.push((slot(BlockRole::AdhocIndex), b));
        }
        for (i, b) in self.redo_deltas.iter().enumerate() {
            out.push((slot(BlockRole::RedoDelta(i)), *b));
        }
        for (i, b) in self.undo_deltas.iter().enumerate() {
            out.push((slot(BlockRole::UndoDelta(i)), *b));
        }
        out
    }
}

impl TabletSuperBlock {
    pub fn new(tablet_id: TabletId, table_name: impl Into<String>) -> Self {
        Self {
            tablet_id,
            table_name: table_name.into(),
            schema_version: 0,
            rowsets: Vec::new(),
        }
    }

    /// Every referenced block with its slot, in structural order.
    pub fn block_slots(&self) -> Vec<(BlockSlot, BlockId)> {
        self.rowsets.iter().flat_map(|rs| rs.slots()).collect()
    }

    pub fn list_blocks(&self) -> Vec<BlockId> {
        self.block_slots().into_iter().map(|(_, b)| b).collect()
    }

    pub fn count_blocks(&self) -> usize {
        self.block_slots().len()
    }

    /// A copy of this superblock that references no blocks at all.
    pub fn without_rowsets(&self) -> Self {
        Self {
            rowsets: Vec::new(),
            ..self.clone()
        }
    }

    /// Rewrite block references through `mapping`. Slots missing from the
    /// mapping are dropped, as are rowsets left with no blocks.
    pub fn remap_blocks(&self, mapping: &BTreeMap<BlockSlot, BlockId>) -> Self {
        let lookup = |rowset_id, role| mapping.get(&BlockSlot { rowset_id, role }).copied();
        let rowsets = self
            .rowsets
            .iter()
            .map(|rs| RowSetDescriptor {
                id: rs.id,
                columns: rs
                    .columns
                    .iter()
                    .filter_map(|c| {
                        lookup(rs.id, BlockRole::Column(c.column_id)).map(|block| ColumnBlock {
                            column_id: c.column_id,
                            block,
                        })
                    })
                    .collect(),
                bloom_block: rs.bloom_block.and(lookup(rs.id, BlockRole::Bloom)),
                adhoc_index_block: rs.adhoc_index_block.and(lookup(rs.id, BlockRole::AdhocIndex)),
                redo_deltas: (0..rs.redo_deltas.len())
                    .filter_map(|i| lookup(rs.id, BlockRole::RedoDelta(i)))
                    .collect(),
                undo_deltas: (0..rs.undo_deltas.len())
                    .filter_map(|i| lookup(rs.id, BlockRole::UndoDelta(i)))
                    .collect(),
            })
            .filter(|rs| !rs.slots().is_empty())
            .collect();
        Self {
            rowsets,
            ..self.clone()
        }
    }
}
