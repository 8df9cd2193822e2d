//! Status state machine.
//!
//! Tracks the last known [`NodeStatus`] of every validator and derives the
//! local [`BlockIntent`] from them with a bounded fixed-point recompute.

use crate::clock::{Clock, SystemClock};
use crate::config::BftConfig;
use crate::intent::BlockIntent;
use crate::observer::{Rejection, StatusObserver, TracingObserver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use strata_types::{bft_quorum, BlockRid, NodeIndex, NodeState, NodeStatus, Signature};

/// The per-chain consensus lock.
pub type SharedStatusManager = Arc<Mutex<StatusManager>>;

/// Status statistics for monitoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BftStats {
    /// Successful revolts (round advances) observed locally.
    pub view_changes: u64,
    /// Current round within the current height.
    pub current_round: u64,
    /// Height of the next block to produce.
    pub current_height: u64,
    /// Times a recompute ran into the iteration bound.
    pub recompute_limit_hits: u64,
}

/// Outcome of one recompute step.
enum Flow {
    /// Nothing decided yet, move on to the next check.
    RunOn,
    /// Something changed, run the loop again.
    Continue,
    /// Settled.
    Break,
}

/// Status state machine for one chain.
///
/// Synchronous and I/O free. Callers share it as a [`SharedStatusManager`]
/// and hold the lock for the whole duration of each call.
pub struct StatusManager {
    // ═══════════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════════
    node_count: usize,
    my_index: NodeIndex,
    quorum: usize,

    // ═══════════════════════════════════════════════════════════════════════════
    // Protocol State
    // ═══════════════════════════════════════════════════════════════════════════
    /// One slot per validator, ours included at `my_index`.
    node_statuses: Vec<NodeStatus>,

    /// Commit signatures over our current block, indexed by validator.
    commit_signatures: Vec<Option<Signature>>,

    intent: BlockIntent,

    // ═══════════════════════════════════════════════════════════════════════════
    // Liveness Bookkeeping
    // ═══════════════════════════════════════════════════════════════════════════
    /// When each validator's status was last applied.
    status_timestamps: Vec<Option<Duration>>,

    /// Last (height, round) each validator was recorded revolting at.
    revolt_seen: Vec<Option<(u64, u64)>>,

    /// Revolts observed against each validator while it was primary.
    revolts_against: Vec<u64>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Statistics
    // ═══════════════════════════════════════════════════════════════════════════
    view_changes: u64,
    recompute_limit_hits: u64,

    // ═══════════════════════════════════════════════════════════════════════════
    // Configuration
    // ═══════════════════════════════════════════════════════════════════════════
    config: BftConfig,
    observer: Arc<dyn StatusObserver>,

    /// Current time, set by the caller before each batch of calls.
    now: Duration,
}

impl std::fmt::Debug for StatusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusManager")
            .field("my_index", &self.my_index)
            .field("my_status", self.my_status())
            .field("intent", &self.intent)
            .finish_non_exhaustive()
    }
}

impl StatusManager {
    /// Create a status manager for `node_count` validators.
    ///
    /// Our serial is seeded from the wall clock so that status updates sent
    /// after a restart are still considered fresh by peers.
    ///
    /// # Panics
    ///
    /// Panics if `my_index` is not below `node_count`.
    pub fn new(
        node_count: usize,
        my_index: NodeIndex,
        my_next_height: u64,
        config: BftConfig,
    ) -> Self {
        assert!(
            my_index < node_count,
            "my_index {} out of range for {} validators",
            my_index,
            node_count
        );

        let serial = SystemClock
            .now_millis()
            .saturating_sub(config.serial_epoch_millis) as i64;

        let mut node_statuses = vec![NodeStatus::default(); node_count];
        node_statuses[my_index] = NodeStatus::new(my_next_height, serial);

        let mut manager = Self {
            node_count,
            my_index,
            quorum: bft_quorum(node_count),
            node_statuses,
            commit_signatures: vec![None; node_count],
            intent: BlockIntent::DoNothing,
            status_timestamps: vec![None; node_count],
            revolt_seen: vec![None; node_count],
            revolts_against: vec![0; node_count],
            view_changes: 0,
            recompute_limit_hits: 0,
            config,
            observer: Arc::new(TracingObserver),
            now: Duration::ZERO,
        };
        manager.recompute();
        manager
    }

    /// Replace the event observer.
    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Wrap into the shared per-chain lock.
    pub fn into_shared(self) -> SharedStatusManager {
        Arc::new(Mutex::new(self))
    }

    /// Set the current time. Used to timestamp incoming statuses.
    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Inputs
    // ═══════════════════════════════════════════════════════════════════════════

    /// Apply a status reported by a peer.
    ///
    /// The status is applied when it is fresher than what we have: a higher
    /// serial, a higher height, or a higher round at the same height.
    pub fn on_status_update(&mut self, node_index: NodeIndex, status: NodeStatus) -> bool {
        if node_index >= self.node_count {
            self.reject(Rejection::UnknownNode { node_index });
            return false;
        }
        if node_index == self.my_index {
            self.reject(Rejection::OwnStatus);
            return false;
        }

        let existing = &self.node_statuses[node_index];
        let fresher = status.serial > existing.serial
            || status.height > existing.height
            || (status.height == existing.height && status.round > existing.round);
        if !fresher {
            return false;
        }

        self.status_timestamps[node_index] = Some(self.now);
        self.record_revolt(node_index, &status);
        self.node_statuses[node_index] = status;
        self.recompute();
        true
    }

    /// Catch up to a block committed outside of consensus, e.g. by a block
    /// fetched at height.
    pub fn fast_forward_height(&mut self, committed_height: u64) -> bool {
        let target = committed_height.saturating_add(1);
        let my_height = self.my_status().height;
        if target < my_height {
            self.reject(Rejection::FastForwardBehind { my_height, target });
            return false;
        }
        while self.my_status().height < target {
            self.advance_height();
        }
        true
    }

    /// Move to `height`, which must be exactly one above ours.
    pub fn on_height_advance(&mut self, height: u64) -> bool {
        let my_height = self.my_status().height;
        if height != my_height.saturating_add(1) {
            self.reject(Rejection::HeightMismatch { my_height, height });
            return false;
        }
        self.advance_height();
        true
    }

    /// The block we hold was committed.
    pub fn on_committed_block(&mut self, block_rid: &BlockRid) -> bool {
        if self.my_status().block_rid.as_ref() != Some(block_rid) {
            self.reject(Rejection::WrongCommittedBlock {
                block_rid: *block_rid,
            });
            return false;
        }
        self.advance_height();
        true
    }

    /// A block fetched from the primary was loaded and signed.
    pub fn on_received_block(&mut self, block_rid: &BlockRid, my_signature: Signature) -> bool {
        if !self.intent.is_waiting_for(block_rid) {
            self.reject(Rejection::IrrelevantBlock {
                block_rid: *block_rid,
                intent: self.intent.clone(),
            });
            return false;
        }
        self.accept_block(*block_rid, my_signature);
        true
    }

    /// We built a block as primary.
    pub fn on_built_block(&mut self, block_rid: &BlockRid, my_signature: Signature) -> bool {
        if self.intent != BlockIntent::BuildBlock {
            self.reject(Rejection::UnexpectedBuiltBlock {
                intent: self.intent.clone(),
            });
            return false;
        }
        if !self.is_my_node_primary() {
            self.reject(Rejection::NotPrimary);
            return false;
        }
        self.accept_block(*block_rid, my_signature);
        true
    }

    /// A verified commit signature from `node_index` over `block_rid`.
    pub fn on_commit_signature(
        &mut self,
        node_index: NodeIndex,
        block_rid: &BlockRid,
        signature: Signature,
    ) -> bool {
        if node_index >= self.node_count {
            self.reject(Rejection::UnknownNode { node_index });
            return false;
        }
        let my_status = self.my_status();
        if my_status.state != NodeState::Prepared
            || my_status.block_rid.as_ref() != Some(block_rid)
        {
            self.reject(Rejection::WrongCommitSignature {
                node_index,
                block_rid: *block_rid,
            });
            return false;
        }
        self.commit_signatures[node_index] = Some(signature);
        self.recompute();
        true
    }

    /// The liveness detector gave up on the current primary.
    pub fn on_start_revolting(&mut self) {
        let me = self.my_status_mut();
        me.revolting = true;
        me.serial += 1;
        self.recompute();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Readers
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn block_intent(&self) -> &BlockIntent {
        &self.intent
    }

    /// Primary for our current height and round.
    pub fn primary_index(&self) -> NodeIndex {
        let me = self.my_status();
        self.primary_index_for(me.height, me.round)
    }

    pub fn primary_index_for(&self, height: u64, round: u64) -> NodeIndex {
        strata_types::primary_index(height, round, self.node_count)
    }

    pub fn is_my_node_primary(&self) -> bool {
        self.primary_index() == self.my_index
    }

    pub fn my_status(&self) -> &NodeStatus {
        &self.node_statuses[self.my_index]
    }

    pub fn my_index(&self) -> NodeIndex {
        self.my_index
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn node_statuses(&self) -> &[NodeStatus] {
        &self.node_statuses
    }

    pub fn commit_signatures(&self) -> &[Option<Signature>] {
        &self.commit_signatures
    }

    /// Our own commit signature over the block we hold.
    pub fn commit_signature(&self) -> Option<&Signature> {
        self.commit_signatures[self.my_index].as_ref()
    }

    /// When a status from `node_index` was last applied.
    pub fn latest_status_timestamp(&self, node_index: NodeIndex) -> Option<Duration> {
        self.status_timestamps.get(node_index).copied().flatten()
    }

    /// Revolts observed against `node_index` while it was primary.
    pub fn revolts_against(&self, node_index: NodeIndex) -> u64 {
        self.revolts_against.get(node_index).copied().unwrap_or(0)
    }

    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    pub fn stats(&self) -> BftStats {
        let me = self.my_status();
        BftStats {
            view_changes: self.view_changes,
            current_round: me.round,
            current_height: me.height,
            recompute_limit_hits: self.recompute_limit_hits,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════════

    fn my_status_mut(&mut self) -> &mut NodeStatus {
        &mut self.node_statuses[self.my_index]
    }

    fn reject(&self, rejection: Rejection) {
        self.observer.input_rejected(&rejection);
    }

    fn set_intent(&mut self, intent: BlockIntent) {
        if self.intent != intent {
            self.observer.intent_changed(&self.intent, &intent);
            self.intent = intent;
        }
    }

    fn set_state(&mut self, state: NodeState) {
        let me = &mut self.node_statuses[self.my_index];
        let from = me.state;
        if from != state {
            me.state = state;
            let height = me.height;
            self.observer.state_changed(height, from, state);
        }
    }

    fn reset_commit_signatures(&mut self) {
        self.commit_signatures.iter_mut().for_each(|s| *s = None);
    }

    fn record_revolt(&mut self, node_index: NodeIndex, status: &NodeStatus) {
        if !status.revolting || status.height != self.my_status().height {
            return;
        }
        let key = (status.height, status.round);
        if self.revolt_seen[node_index] == Some(key) {
            return;
        }
        self.revolt_seen[node_index] = Some(key);
        let primary = self.primary_index_for(status.height, status.round);
        self.revolts_against[primary] += 1;
        self.observer
            .revolt_observed(node_index, primary, status.height, status.round);
    }

    fn advance_height(&mut self) {
        let me = self.my_status_mut();
        me.height += 1;
        me.serial += 1;
        me.block_rid = None;
        me.round = 0;
        me.revolting = false;
        let height = me.height;
        self.set_state(NodeState::WaitBlock);
        self.reset_commit_signatures();
        self.set_intent(BlockIntent::DoNothing);
        self.observer.height_advanced(height);
        self.recompute();
    }

    fn accept_block(&mut self, block_rid: BlockRid, my_signature: Signature) {
        self.reset_commit_signatures();
        let me = self.my_status_mut();
        me.block_rid = Some(block_rid);
        me.serial += 1;
        self.set_state(NodeState::HaveBlock);
        self.commit_signatures[self.my_index] = Some(my_signature);
        self.set_intent(BlockIntent::DoNothing);
        self.recompute();
    }

    /// Drop the block we hold and go back to waiting for one.
    fn reset_block(&mut self) {
        self.set_state(NodeState::WaitBlock);
        let me = self.my_status_mut();
        me.block_rid = None;
        me.serial += 1;
        self.reset_commit_signatures();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Recompute
    // ═══════════════════════════════════════════════════════════════════════════

    /// Recompute our status and intent until nothing changes.
    ///
    /// Every input already does this; calling it again without new input is
    /// a no-op.
    pub fn recompute(&mut self) {
        let limit = self.config.max_recompute_iterations;
        for _ in 0..limit {
            if !self.recompute_step() {
                return;
            }
        }
        self.recompute_limit_hits += 1;
        self.observer.recompute_limit_reached(limit);
    }

    /// One pass of the recompute loop. Returns whether anything changed.
    fn recompute_step(&mut self) -> bool {
        if self.my_status().state != NodeState::Prepared {
            match self.sync_check() {
                Flow::Continue => return true,
                Flow::Break => return false,
                Flow::RunOn => {}
            }
        }

        if self.my_status().revolting {
            match self.revolt_check() {
                Flow::Continue => return true,
                Flow::Break => return false,
                Flow::RunOn => {}
            }
        }

        let state = self.my_status().state;
        match state {
            NodeState::WaitBlock => self.handle_wait_block(),
            NodeState::HaveBlock => self.handle_have_block(),
            NodeState::Prepared => self.handle_prepared(),
        }
    }

    /// Fetch the block at our height if too few validators are with us and
    /// somebody is ahead.
    fn sync_check(&mut self) -> Flow {
        let my_height = self.my_status().height;
        let same_height = self
            .node_statuses
            .iter()
            .filter(|s| s.height == my_height)
            .count();
        let any_higher = self.node_statuses.iter().any(|s| s.height > my_height);

        if same_height >= self.quorum || !any_higher {
            return Flow::RunOn;
        }
        if self.intent.is_fetching_height(my_height) {
            return Flow::Break;
        }
        if self.my_status().state == NodeState::HaveBlock {
            self.reset_block();
        }
        self.set_intent(BlockIntent::FetchBlockAtHeight { height: my_height });
        Flow::Continue
    }

    /// Advance the round once a quorum at our height revolts or has moved on.
    fn revolt_check(&mut self) -> Flow {
        let me = self.my_status();
        let (my_height, my_round) = (me.height, me.round);
        let votes = self
            .node_statuses
            .iter()
            .filter(|s| s.height == my_height)
            .filter(|s| (s.round == my_round && s.revolting) || s.round > my_round)
            .count();

        if votes < self.quorum {
            return Flow::RunOn;
        }

        // A prepared block survives the view change.
        if self.my_status().state == NodeState::HaveBlock {
            self.reset_block();
        }
        let me = self.my_status_mut();
        me.revolting = false;
        me.round += 1;
        me.serial += 1;
        let round = me.round;
        self.view_changes += 1;
        self.observer.round_advanced(my_height, round);
        Flow::Continue
    }

    fn handle_wait_block(&mut self) -> bool {
        if self.is_my_node_primary() {
            if self.intent == BlockIntent::BuildBlock {
                return false;
            }
            self.set_intent(BlockIntent::BuildBlock);
            return true;
        }

        let my_height = self.my_status().height;
        let primary = &self.node_statuses[self.primary_index()];
        let next = match primary.block_rid {
            Some(block_rid) if primary.height == my_height => {
                BlockIntent::FetchUnfinishedBlock { block_rid }
            }
            _ => BlockIntent::DoNothing,
        };
        if self.intent == next {
            return false;
        }
        self.set_intent(next);
        true
    }

    fn handle_have_block(&mut self) -> bool {
        let me = self.my_status();
        let (height, block_rid) = (me.height, me.block_rid);
        let holding = self
            .node_statuses
            .iter()
            .filter(|s| {
                s.holds(NodeState::HaveBlock, height, block_rid.as_ref())
                    || s.holds(NodeState::Prepared, height, block_rid.as_ref())
            })
            .count();

        if holding < self.quorum {
            return false;
        }
        self.set_state(NodeState::Prepared);
        self.my_status_mut().serial += 1;
        true
    }

    fn handle_prepared(&mut self) -> bool {
        if self.intent == BlockIntent::CommitBlock {
            return false;
        }

        let signed = self.commit_signatures.iter().flatten().count();
        if signed >= self.quorum {
            self.set_intent(BlockIntent::CommitBlock);
            return true;
        }

        let me = self.my_status();
        let Some(block_rid) = me.block_rid else {
            return false;
        };
        let my_height = me.height;
        let nodes: Vec<NodeIndex> = self
            .node_statuses
            .iter()
            .enumerate()
            .filter(|(i, _)| self.commit_signatures[*i].is_none())
            .filter(|(_, s)| {
                s.height > my_height || s.holds(NodeState::Prepared, my_height, Some(&block_rid))
            })
            .map(|(i, _)| i)
            .collect();

        let next = if nodes.is_empty() {
            BlockIntent::DoNothing
        } else {
            BlockIntent::FetchCommitSignatures { block_rid, nodes }
        };
        if self.intent == next {
            return false;
        }
        self.set_intent(next);
        true
    }
}
