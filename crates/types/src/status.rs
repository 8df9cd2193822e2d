//! Per-validator consensus status.

use crate::BlockRid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Local per-height protocol state of a validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// PBFT: before PRE-PREPARE.
    #[default]
    WaitBlock,
    /// PBFT: after PRE-PREPARE, PREPARE message is sent.
    HaveBlock,
    /// PBFT: prepared, COMMIT message is sent.
    Prepared,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::WaitBlock => "WaitBlock",
            NodeState::HaveBlock => "HaveBlock",
            NodeState::Prepared => "Prepared",
        };
        f.write_str(s)
    }
}

/// Last known status of one validator, including the local node itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Height of the next block to produce (committed height + 1).
    pub height: u64,
    /// Monotonic freshness counter, bumped on every local status change.
    pub serial: i64,
    /// View number within the height.
    pub round: u64,
    pub state: NodeState,
    /// Block this node currently holds, if any.
    pub block_rid: Option<BlockRid>,
    /// View-change vote.
    pub revolting: bool,
}

impl NodeStatus {
    pub fn new(height: u64, serial: i64) -> Self {
        Self {
            height,
            serial,
            round: 0,
            state: NodeState::WaitBlock,
            block_rid: None,
            revolting: false,
        }
    }

    /// Whether this node holds `block_rid` at `height` in the given state.
    pub fn holds(&self, state: NodeState, height: u64, block_rid: Option<&BlockRid>) -> bool {
        self.height == height && self.state == state && self.block_rid.as_ref() == block_rid
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::new(0, -1)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "h={} r={} s={} {}",
            self.height, self.round, self.serial, self.state
        )?;
        if let Some(rid) = &self.block_rid {
            write!(f, " {:?}", rid)?;
        }
        if self.revolting {
            f.write_str(" R")?;
        }
        Ok(())
    }
}
