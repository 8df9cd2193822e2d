//! Messages exchanged between validators.
//!
//! Only the shapes are defined here; encoding is left to the transport.

use serde::{Deserialize, Serialize};
use strata_types::{BlockData, BlockDataWithWitness, BlockRid, NodeIndex, NodeStatus, Signature};

/// A consensus message from or to a peer validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Gossiped status of the sender.
    Status(NodeStatus),

    /// Ask the primary for the block it built at the current height.
    GetUnfinishedBlock { block_rid: BlockRid },

    /// A block that has not been committed yet.
    UnfinishedBlock(BlockData),

    /// Ask for the committed block at `height`.
    GetBlockAtHeight { height: u64 },

    /// A committed block together with its witness.
    CompleteBlock {
        block: BlockDataWithWitness,
        height: u64,
    },

    /// Ask for the sender's commit signature over `block_rid`.
    GetBlockSignature { block_rid: BlockRid },

    BlockSignature {
        block_rid: BlockRid,
        signature: Signature,
    },
}

impl PeerMessage {
    /// Short fixed name of the message variant, for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Status(_) => "status",
            PeerMessage::GetUnfinishedBlock { .. } => "get_unfinished_block",
            PeerMessage::UnfinishedBlock(_) => "unfinished_block",
            PeerMessage::GetBlockAtHeight { .. } => "get_block_at_height",
            PeerMessage::CompleteBlock { .. } => "complete_block",
            PeerMessage::GetBlockSignature { .. } => "get_block_signature",
            PeerMessage::BlockSignature { .. } => "block_signature",
        }
    }
}

/// Outbound side of the peer network.
///
/// Delivery is best effort. Implementations must not block.
pub trait PeerTransport: Send + Sync {
    fn send(&self, to: NodeIndex, message: PeerMessage);

    /// Send to every other validator.
    fn broadcast(&self, message: PeerMessage);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(PeerMessage::Status(NodeStatus::default()).kind(), "status");
        assert_eq!(
            PeerMessage::GetBlockAtHeight { height: 3 }.kind(),
            "get_block_at_height"
        );
        assert_eq!(
            PeerMessage::GetBlockSignature {
                block_rid: BlockRid::ZERO
            }
            .kind(),
            "get_block_signature"
        );
    }
}
