//! Core types for the Strata consensus core.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Identifiers**: [`BlockRid`], [`NodeIndex`]
//! - **Blocks**: [`BlockHeader`], [`BlockData`], [`BlockWitness`], [`BlockDataWithWitness`]
//! - **Signatures**: [`Signature`]
//! - **Status**: [`NodeState`], [`NodeStatus`]
//! - **Arithmetic**: [`bft_quorum`], [`bft_majority`], [`primary_index`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend on
//! any other workspace crates, making it the foundation layer.

mod block;
mod rid;
mod signature;
mod status;

pub use block::{BlockData, BlockDataWithWitness, BlockHeader, BlockWitness};
pub use rid::{BlockRid, HexError};
pub use signature::Signature;
pub use status::{NodeState, NodeStatus};

/// Position of a validator in the (ordered) validator set of a chain.
pub type NodeIndex = usize;

/// Minimum number of validators that form a Byzantine-fault-tolerant
/// supermajority among `node_count` validators.
///
/// With `f = (n - 1) / 3` tolerated faults the quorum is `n - f`, which is
/// `2f + 1` whenever `n = 3f + 1`.
pub fn bft_quorum(node_count: usize) -> usize {
    if node_count == 0 {
        return 0;
    }
    node_count - (node_count - 1) / 3
}

/// Index of the validator that must build the block at `height` in `round`.
///
/// # Panics
///
/// Panics if `node_count` is zero.
pub fn primary_index(height: u64, round: u64, node_count: usize) -> NodeIndex {
    let n = node_count as u64;
    ((height % n + round % n) % n) as NodeIndex
}

/// Smallest number of validators that must include at least one honest
/// one: `f + 1`.
pub fn bft_majority(node_count: usize) -> usize {
    node_count - bft_quorum(node_count) + 1
}
