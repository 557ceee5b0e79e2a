pub mod blocking_index;

pub use blocking_index::{block_key, shares_block, BlockingIndex, SkippedBlock, NO_UNIT};
