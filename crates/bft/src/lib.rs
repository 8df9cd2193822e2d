//! BFT status state machine.
//!
//! This crate provides the synchronous part of the consensus core: it tracks
//! the reported status of every validator and derives what the local node
//! should do next.
//!
//! # Architecture
//!
//! The [`StatusManager`] is fed inputs and answers with a [`BlockIntent`]:
//!
//! - `on_status_update` → peer gossip (height, round, state, block, revolting)
//! - `on_built_block` / `on_received_block` → a block was built or loaded
//! - `on_commit_signature` → a peer's commit signature was verified
//! - `on_committed_block` / `on_height_advance` → the chain moved forward
//! - `on_start_revolting` → the liveness detector gave up on the primary
//!
//! All I/O is performed by the caller. The state machine never blocks and
//! never spawns; it is shared between threads as a [`SharedStatusManager`]
//! whose single mutex is the per-chain consensus lock.
//!
//! # Terminology
//!
//! - **Height**: Position of the next block to produce (committed height + 1).
//!
//! - **Round**: Attempt number at a height. The primary for a (height, round)
//!   is `(height + round) mod N`.
//!
//! - **Quorum**: `N - floor((N - 1) / 3)` validators.
//!
//! # Protocol
//!
//! Each height walks through three states, analogous to PBFT phases:
//!
//! 1. **WaitBlock**: the primary builds a block, everybody else fetches it.
//! 2. **HaveBlock**: the block is loaded and signed locally; once a quorum
//!    reports holding the same block the node is prepared.
//! 3. **Prepared**: commit signatures are collected; with a quorum of them the
//!    block is committed and the height advances.
//!
//! If the primary does not deliver, validators start revolting. When a
//! quorum revolts (or has already moved to a later round), the round
//! increments and the next validator becomes primary.

mod clock;
mod config;
mod intent;
mod observer;
mod revolt;
mod status;
mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BftConfig, ConfigError};
pub use intent::BlockIntent;
pub use observer::{NoopObserver, Rejection, StatusObserver, TracingObserver};
pub use revolt::{RevoltConfig, RevoltTracker};
pub use status::{BftStats, SharedStatusManager, StatusManager};
pub use strategy::{
    BaseBlockBuildingStrategy, BlockBuildingConfig, BlockBuildingStrategy, TransactionQueue,
};
