//! Local storage collaborators of the tablet copy client: on-disk layout,
//! the block manager, the tablet superblock and durable tablet metadata.

pub mod block_manager;
pub mod fs_layout;
pub mod metadata;
pub mod superblock;

pub use block_manager::{BlockManager, FileBlockManager, WritableBlock};
pub use fs_layout::FsLayout;
pub use metadata::{TabletDataState, TabletMetadata};
pub use superblock::{BlockRole, BlockSlot, ColumnBlock, RowSetDescriptor, TabletSuperBlock};
