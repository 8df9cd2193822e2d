//! Status transition events.
//!
//! The [`StatusManager`](crate::StatusManager) reports what happens inside a
//! recompute through a [`StatusObserver`] instead of logging directly. The
//! default [`TracingObserver`] turns events into `tracing` records.

use crate::intent::BlockIntent;
use strata_types::{BlockRid, NodeIndex, NodeState};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Why an input to the status manager was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Node index outside the validator set.
    UnknownNode { node_index: NodeIndex },
    /// Status for our own index arrived from outside.
    OwnStatus,
    /// Height advance did not target `my_height + 1`.
    HeightMismatch { my_height: u64, height: u64 },
    /// Fast-forward target lies behind our height.
    FastForwardBehind { my_height: u64, target: u64 },
    /// Committed block differs from the block we hold.
    WrongCommittedBlock { block_rid: BlockRid },
    /// Received a block we are not waiting for.
    IrrelevantBlock {
        block_rid: BlockRid,
        intent: BlockIntent,
    },
    /// Built a block while not being asked to.
    UnexpectedBuiltBlock { intent: BlockIntent },
    /// Built a block while not primary.
    NotPrimary,
    /// Commit signature outside Prepared or for another block.
    WrongCommitSignature {
        node_index: NodeIndex,
        block_rid: BlockRid,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::UnknownNode { node_index } => write!(f, "unknown node index {}", node_index),
            Rejection::OwnStatus => f.write_str("status update for own node"),
            Rejection::HeightMismatch { my_height, height } => {
                write!(f, "height mismatch: my height {} new height {}", my_height, height)
            }
            Rejection::FastForwardBehind { my_height, target } => {
                write!(f, "cannot fast forward from {} back to {}", my_height, target)
            }
            Rejection::WrongCommittedBlock { block_rid } => {
                write!(f, "committed block with wrong rid {:?}", block_rid)
            }
            Rejection::IrrelevantBlock { block_rid, intent } => {
                write!(f, "received irrelevant block {:?}, intent was {}", block_rid, intent)
            }
            Rejection::UnexpectedBuiltBlock { intent } => {
                write!(f, "built block while not requesting it, intent was {}", intent)
            }
            Rejection::NotPrimary => f.write_str("built a block while not primary"),
            Rejection::WrongCommitSignature {
                node_index,
                block_rid,
            } => write!(
                f,
                "wrong commit signature from node {} for {:?}",
                node_index, block_rid
            ),
        }
    }
}

/// Receives status manager events. Every method defaults to a no-op.
pub trait StatusObserver: Send + Sync {
    fn intent_changed(&self, _from: &BlockIntent, _to: &BlockIntent) {}

    fn state_changed(&self, _height: u64, _from: NodeState, _to: NodeState) {}

    fn round_advanced(&self, _height: u64, _round: u64) {}

    fn height_advanced(&self, _height: u64) {}

    /// A peer was seen revolting against `primary` at (height, round).
    fn revolt_observed(
        &self,
        _node_index: NodeIndex,
        _primary: NodeIndex,
        _height: u64,
        _round: u64,
    ) {
    }

    fn input_rejected(&self, _rejection: &Rejection) {}

    fn recompute_limit_reached(&self, _iterations: usize) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StatusObserver for NoopObserver {}

/// Logs events with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StatusObserver for TracingObserver {
    fn intent_changed(&self, from: &BlockIntent, to: &BlockIntent) {
        debug!(from = %from, to = %to, "Intent changed");
    }

    fn state_changed(&self, height: u64, from: NodeState, to: NodeState) {
        debug!(height, from = %from, to = %to, "Node state changed");
    }

    fn round_advanced(&self, height: u64, round: u64) {
        info!(height, round, "Revolt succeeded, advanced round");
    }

    fn height_advanced(&self, height: u64) {
        debug!(height, "Advanced height");
    }

    fn revolt_observed(&self, node_index: NodeIndex, primary: NodeIndex, height: u64, round: u64) {
        info!(node_index, primary, height, round, "Node is revolting against primary");
    }

    fn input_rejected(&self, rejection: &Rejection) {
        match rejection {
            Rejection::HeightMismatch { .. }
            | Rejection::WrongCommittedBlock { .. }
            | Rejection::IrrelevantBlock { .. } => error!(%rejection, "Rejected input"),
            _ => warn!(%rejection, "Rejected input"),
        }
    }

    fn recompute_limit_reached(&self, iterations: usize) {
        error!(iterations, "Status recompute did not settle, likely a bug");
    }
}
