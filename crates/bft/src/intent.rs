//! What the local node should be doing right now.

use strata_types::{BlockRid, NodeIndex};
use std::fmt;

/// The single next action derived by the status state machine.
///
/// Exactly one intent is active at a time. It is recomputed synchronously on
/// every status change and replaced, never queued.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BlockIntent {
    #[default]
    DoNothing,
    /// A quorum of commit signatures is collected; commit the held block.
    CommitBlock,
    /// This node is primary; build a block.
    BuildBlock,
    /// We may be behind; fetch the committed block at `height`.
    FetchBlockAtHeight { height: u64 },
    /// Fetch the primary's unfinished block.
    FetchUnfinishedBlock { block_rid: BlockRid },
    /// Fetch commit signatures for `block_rid` from `nodes`.
    FetchCommitSignatures {
        block_rid: BlockRid,
        nodes: Vec<NodeIndex>,
    },
}

impl BlockIntent {
    /// Whether this is a `FetchUnfinishedBlock` intent for `block_rid`.
    pub fn is_waiting_for(&self, block_rid: &BlockRid) -> bool {
        matches!(self, BlockIntent::FetchUnfinishedBlock { block_rid: rid } if rid == block_rid)
    }

    /// Whether this is a `FetchBlockAtHeight` intent for `height`.
    pub fn is_fetching_height(&self, height: u64) -> bool {
        matches!(self, BlockIntent::FetchBlockAtHeight { height: h } if *h == height)
    }
}

impl fmt::Display for BlockIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockIntent::DoNothing => f.write_str("DNI"),
            BlockIntent::CommitBlock => f.write_str("CBI"),
            BlockIntent::BuildBlock => f.write_str("BBI"),
            BlockIntent::FetchBlockAtHeight { height } => write!(f, "FBAH({})", height),
            BlockIntent::FetchUnfinishedBlock { block_rid } => write!(f, "FUB({:?})", block_rid),
            BlockIntent::FetchCommitSignatures { block_rid, nodes } => {
                write!(f, "FCS({:?}, {:?})", block_rid, nodes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_compares_payload() {
        let a = BlockRid::hash_of(b"a");
        let b = BlockRid::hash_of(b"b");

        assert_eq!(
            BlockIntent::FetchBlockAtHeight { height: 3 },
            BlockIntent::FetchBlockAtHeight { height: 3 }
        );
        assert_ne!(
            BlockIntent::FetchBlockAtHeight { height: 3 },
            BlockIntent::FetchBlockAtHeight { height: 4 }
        );
        assert_ne!(
            BlockIntent::FetchUnfinishedBlock { block_rid: a },
            BlockIntent::FetchUnfinishedBlock { block_rid: b }
        );
        assert_ne!(
            BlockIntent::FetchCommitSignatures {
                block_rid: a,
                nodes: vec![1, 2]
            },
            BlockIntent::FetchCommitSignatures {
                block_rid: a,
                nodes: vec![1]
            }
        );
        assert_ne!(BlockIntent::BuildBlock, BlockIntent::CommitBlock);
    }

    #[test]
    fn test_is_waiting_for() {
        let a = BlockRid::hash_of(b"a");
        let b = BlockRid::hash_of(b"b");
        let intent = BlockIntent::FetchUnfinishedBlock { block_rid: a };
        assert!(intent.is_waiting_for(&a));
        assert!(!intent.is_waiting_for(&b));
        assert!(!BlockIntent::BuildBlock.is_waiting_for(&a));
    }
}
