//! Block payloads as seen by the consensus core.

use crate::{BlockRid, Signature};
use serde::{Deserialize, Serialize};

/// Consensus metadata of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Reference of this block.
    pub block_rid: BlockRid,
    /// Reference of the block this one extends.
    pub prev_block_rid: BlockRid,
    /// Height of this block (first block is height 0).
    pub height: u64,
    /// Block timestamp in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// An unfinished (not yet witnessed) block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub header: BlockHeader,
    /// Opaque encoded transactions.
    pub transactions: Vec<Vec<u8>>,
}

impl BlockData {
    pub fn block_rid(&self) -> BlockRid {
        self.header.block_rid
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }
}

/// Aggregated validator signatures attesting to a committed block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWitness {
    pub signatures: Vec<Signature>,
}

impl BlockWitness {
    pub fn new(signatures: Vec<Signature>) -> Self {
        Self { signatures }
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// A committed block as served to peers that are catching up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataWithWitness {
    pub block: BlockData,
    pub witness: BlockWitness,
}

impl BlockDataWithWitness {
    pub fn new(block: BlockData, witness: BlockWitness) -> Self {
        Self { block, witness }
    }

    pub fn block_rid(&self) -> BlockRid {
        self.block.block_rid()
    }
}
