//! Validator sync manager.
//!
//! Connects the peer network to the consensus core:
//! - Applies peer statuses to the status manager
//! - Hands fetched blocks and commit signatures to the intent executor
//! - Answers peers' block and signature requests
//! - Turns fetch intents into requests
//! - Gossips our own status
//! - Drives the revolt tracker
//! - Fast-syncs committed blocks when far behind
//!
//! Everything runs on one tokio task; the status manager lock serializes it
//! against pipeline completions.

use crate::executor::IntentExecutor;
use crate::messages::{PeerMessage, PeerTransport};
use crate::metrics;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use strata_bft::{BlockIntent, RevoltTracker};
use strata_types::{bft_majority, BlockRid, NodeIndex, NodeStatus};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

// ═══════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════

/// Configuration for the sync manager.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often `run` ticks.
    pub tick_interval: Duration,
    /// Re-broadcast our status this often even when it did not change.
    pub status_resend_interval: Duration,
    /// Repeat an unanswered fetch request after this long.
    pub request_resend_interval: Duration,
    /// Seed for peer selection.
    pub seed: u64,
    /// Fast-sync when enough peers are this many heights ahead. Zero disables
    /// fast sync.
    pub fast_sync_threshold: u64,
    /// Unanswered or failed fast-sync requests in a row before falling back
    /// to normal sync.
    pub fast_sync_max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(25),
            status_resend_interval: Duration::from_millis(1000),
            request_resend_interval: Duration::from_millis(1000),
            seed: 0,
            fast_sync_threshold: 3,
            fast_sync_max_retries: 3,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_status_resend_interval(mut self, interval: Duration) -> Self {
        self.status_resend_interval = interval;
        self
    }

    pub fn with_request_resend_interval(mut self, interval: Duration) -> Self {
        self.request_resend_interval = interval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_fast_sync_threshold(mut self, threshold: u64) -> Self {
        self.fast_sync_threshold = threshold;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Shutdown
// ═══════════════════════════════════════════════════════════════════════════

/// Handle for stopping a running sync manager.
///
/// Dropping the handle also triggers shutdown.
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Create a handle and the signal that `run` waits on.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sync Manager
// ═══════════════════════════════════════════════════════════════════════════

/// Inbound messages tagged with the sender's validator index.
pub type InboundMessages = mpsc::UnboundedReceiver<(NodeIndex, PeerMessage)>;

/// Network-facing driver of one validator.
pub struct ValidatorSyncManager {
    executor: IntentExecutor,
    revolt_tracker: RevoltTracker,
    transport: Arc<dyn PeerTransport>,
    config: SyncConfig,
    rng: ChaCha8Rng,

    /// Last status we broadcast and when.
    last_broadcast: Option<(NodeStatus, Duration)>,

    /// Last fetch request we sent and when.
    last_request: Option<(BlockIntent, Duration)>,

    /// Set when peers are far enough ahead; `run` then fast-syncs on its
    /// next tick.
    fast_sync: bool,
}

impl ValidatorSyncManager {
    pub fn new(
        executor: IntentExecutor,
        transport: Arc<dyn PeerTransport>,
        config: SyncConfig,
    ) -> Self {
        let now = executor.clock().now();
        let revolt_tracker = {
            let status = executor.status_manager().lock();
            RevoltTracker::new(status.config().revolt.clone(), status.my_status(), now)
        };
        Self {
            executor,
            revolt_tracker,
            transport,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            last_broadcast: None,
            last_request: None,
            fast_sync: false,
        }
    }

    pub fn executor(&self) -> &IntentExecutor {
        &self.executor
    }

    pub fn revolt_tracker(&self) -> &RevoltTracker {
        &self.revolt_tracker
    }

    pub fn is_fast_syncing(&self) -> bool {
        self.fast_sync
    }

    /// Handle a message from validator `from`.
    ///
    /// Must be called from within a tokio runtime; block and signature reads
    /// are answered from spawned tasks.
    pub fn handle_message(&mut self, from: NodeIndex, message: PeerMessage) {
        metrics::record_peer_message_received(message.kind());

        let known_peer = {
            let status = self.executor.status_manager().lock();
            from < status.node_count() && from != status.my_index()
        };
        if !known_peer {
            metrics::record_invalid_message();
            warn!(
                from,
                kind = message.kind(),
                "Dropping message from unexpected sender"
            );
            return;
        }

        trace!(from, kind = message.kind(), "Received peer message");
        match message {
            PeerMessage::Status(status) => {
                {
                    let mut manager = self.executor.status_manager().lock();
                    manager.set_time(self.executor.clock().now());
                    manager.on_status_update(from, status);
                }
                self.check_fast_sync();
            }
            PeerMessage::GetUnfinishedBlock { block_rid } => {
                self.answer_unfinished_block(from, block_rid);
            }
            PeerMessage::UnfinishedBlock(block) => {
                self.executor.on_received_unfinished_block(block);
            }
            PeerMessage::GetBlockAtHeight { height } => {
                self.answer_block_at_height(from, height);
            }
            PeerMessage::CompleteBlock { block, height } => {
                self.executor.on_received_block_at_height(block, height);
            }
            PeerMessage::GetBlockSignature { block_rid } => {
                self.answer_block_signature(from, block_rid);
            }
            PeerMessage::BlockSignature { block_rid, signature } => {
                self.executor
                    .on_received_commit_signature(from, block_rid, signature);
            }
        }
    }

    fn answer_unfinished_block(&self, to: NodeIndex, block_rid: BlockRid) {
        match self.executor.current_block() {
            Some(block) if block.block_rid() == block_rid => {
                self.send(to, PeerMessage::UnfinishedBlock(block));
            }
            _ => debug!(to, %block_rid, "Don't have the requested unfinished block"),
        }
    }

    fn answer_block_at_height(&self, to: NodeIndex, height: u64) {
        let read = self.executor.pipeline().block_at_height(height, true);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            match read.await {
                Ok(Some(block)) => {
                    transport.send(to, PeerMessage::CompleteBlock { block, height });
                    metrics::record_peer_message_sent();
                }
                Ok(None) => trace!(to, height, "Don't have the requested block"),
                Err(e) => debug!(to, height, error = %e, "Can't read block at height"),
            }
        });
    }

    fn answer_block_signature(&self, to: NodeIndex, block_rid: BlockRid) {
        let current = {
            let status = self.executor.status_manager().lock();
            if status.my_status().block_rid == Some(block_rid) {
                status.commit_signature().cloned()
            } else {
                None
            }
        };
        if let Some(signature) = current {
            self.send(to, PeerMessage::BlockSignature { block_rid, signature });
            return;
        }

        // Possibly an already committed block.
        let read = self.executor.pipeline().block_signature(block_rid);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            match read.await {
                Ok(Some(signature)) => {
                    transport.send(to, PeerMessage::BlockSignature { block_rid, signature });
                    metrics::record_peer_message_sent();
                }
                Ok(None) => trace!(to, %block_rid, "No signature for requested block"),
                Err(e) => debug!(to, %block_rid, error = %e, "Can't read block signature"),
            }
        });
    }

    /// One round of periodic work. Returns the intent acted on.
    pub fn tick(&mut self) -> BlockIntent {
        let now = self.executor.clock().now();
        let should_build = self.executor.strategy().should_build_block(now);
        {
            let mut status = self.executor.status_manager().lock();
            status.set_time(now);
            if self.revolt_tracker.update(&mut status, should_build, now) {
                metrics::record_revolt_started();
            }
        }

        let intent = self.executor.pump();
        self.request_for_intent(&intent, now);
        self.maybe_broadcast_status(now);
        intent
    }

    fn request_for_intent(&mut self, intent: &BlockIntent, now: Duration) {
        let due = match &self.last_request {
            Some((last, at)) if last == intent => {
                now.saturating_sub(*at) >= self.config.request_resend_interval
            }
            _ => true,
        };
        if !due {
            return;
        }

        let sent = match intent {
            BlockIntent::FetchUnfinishedBlock { block_rid } => {
                let my_height = self.executor.status_manager().lock().my_status().height;
                let holder = self.random_peer(|s| {
                    s.height == my_height && s.block_rid.as_ref() == Some(block_rid)
                });
                match holder {
                    Some(peer) => {
                        debug!(%block_rid, peer, "Fetching unfinished block");
                        self.send(
                            peer,
                            PeerMessage::GetUnfinishedBlock {
                                block_rid: *block_rid,
                            },
                        );
                        true
                    }
                    None => false,
                }
            }
            BlockIntent::FetchBlockAtHeight { height } => {
                match self.random_peer(|s| s.height > *height) {
                    Some(peer) => {
                        debug!(height, peer, "Fetching block at height");
                        self.send(peer, PeerMessage::GetBlockAtHeight { height: *height });
                        true
                    }
                    None => false,
                }
            }
            BlockIntent::FetchCommitSignatures { block_rid, nodes } => {
                for &node in nodes {
                    self.send(
                        node,
                        PeerMessage::GetBlockSignature {
                            block_rid: *block_rid,
                        },
                    );
                }
                !nodes.is_empty()
            }
            BlockIntent::DoNothing | BlockIntent::BuildBlock | BlockIntent::CommitBlock => false,
        };
        if sent {
            self.last_request = Some((intent.clone(), now));
        }
    }

    fn maybe_broadcast_status(&mut self, now: Duration) {
        let my_status = self.executor.status_manager().lock().my_status().clone();
        let due = match &self.last_broadcast {
            Some((last, at)) => {
                *last != my_status || now.saturating_sub(*at) >= self.config.status_resend_interval
            }
            None => true,
        };
        if due {
            self.transport.broadcast(PeerMessage::Status(my_status.clone()));
            metrics::record_peer_message_sent();
            self.last_broadcast = Some((my_status, now));
        }
    }

    /// A random peer, other than us, whose last status matches.
    fn random_peer(&mut self, matches: impl Fn(&NodeStatus) -> bool) -> Option<NodeIndex> {
        let candidates: Vec<NodeIndex> = {
            let status = self.executor.status_manager().lock();
            status
                .node_statuses()
                .iter()
                .enumerate()
                .filter(|(index, s)| *index != status.my_index() && matches(s))
                .map(|(index, _)| index)
                .collect()
        };
        candidates.choose(&mut self.rng).copied()
    }

    fn send(&self, to: NodeIndex, message: PeerMessage) {
        self.transport.send(to, message);
        metrics::record_peer_message_sent();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Fast sync
    // ═══════════════════════════════════════════════════════════════════════════

    /// Switch fast sync on or off depending on how many peers are at least
    /// `fast_sync_threshold` heights ahead of us.
    fn check_fast_sync(&mut self) {
        let threshold = self.config.fast_sync_threshold;
        if threshold == 0 {
            return;
        }
        let (my_height, ahead, needed) = {
            let status = self.executor.status_manager().lock();
            let my_height = status.my_status().height;
            let ahead = status
                .node_statuses()
                .iter()
                .filter(|s| s.height >= my_height.saturating_add(threshold))
                .count();
            (my_height, ahead, bft_majority(status.node_count()))
        };

        let fast_sync = ahead >= needed;
        if fast_sync && !self.fast_sync {
            info!(my_height, ahead, "Switching to fast sync");
            metrics::record_fast_sync_started();
        }
        self.fast_sync = fast_sync;
    }

    /// Pull committed blocks from peers ahead of us straight into the
    /// pipeline, then move the status manager to the height reached.
    ///
    /// Consensus is paused meanwhile. Other inbound messages are handled as
    /// usual. Breaks on shutdown or when the inbound channel closes.
    async fn run_fast_sync(
        &mut self,
        inbound: &mut InboundMessages,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> ControlFlow<()> {
        self.executor.wait_for_running_operations().await;
        let pipeline = self.executor.pipeline().clone();
        let mut height = match pipeline.last_block_height().await {
            Ok(height) => height.unwrap_or(0),
            Err(e) => {
                debug!(error = %e, "Can't start fast sync");
                self.fast_sync = false;
                return ControlFlow::Continue(());
            }
        };
        info!(height, "Starting fast sync");

        let mut last_timestamp = None;
        let mut failures = 0;
        while failures <= self.config.fast_sync_max_retries {
            let next = height + 1;
            let Some(peer) = self.random_peer(|s| s.height > next) else {
                break;
            };
            self.send(peer, PeerMessage::GetBlockAtHeight { height: next });

            let timeout = tokio::time::sleep(self.config.request_resend_interval);
            tokio::pin!(timeout);
            let received = loop {
                tokio::select! {
                    biased;

                    _ = &mut *shutdown => return ControlFlow::Break(()),

                    message = inbound.recv() => match message {
                        Some((_, PeerMessage::CompleteBlock { block, height: fetched }))
                            if fetched == next =>
                        {
                            break Some(block);
                        }
                        Some((from, message)) => self.handle_message(from, message),
                        None => return ControlFlow::Break(()),
                    },

                    _ = &mut timeout => break None,
                }
            };

            let Some(block) = received else {
                debug!(height = next, peer, "Fast sync request timed out");
                failures += 1;
                continue;
            };
            let timestamp = block.block.header.timestamp;
            match pipeline.add_block(block).await {
                Ok(()) => {
                    trace!(height = next, "Fast-synced block");
                    metrics::record_fast_synced_block();
                    height = next;
                    last_timestamp = Some(timestamp);
                    failures = 0;
                }
                Err(e) if e.is_closed() => {
                    debug!(error = %e, "Pipeline closed during fast sync");
                    break;
                }
                Err(e) => {
                    warn!(height = next, peer, error = %e, "Can't add fast-synced block");
                    failures += 1;
                    // The block may have been added by another path.
                    if let Ok(Some(last)) = pipeline.last_block_height().await {
                        height = height.max(last);
                    }
                }
            }
        }

        self.finish_fast_sync(last_timestamp).await;
        ControlFlow::Continue(())
    }

    /// Leave fast sync and fast-forward the status manager to the chain.
    async fn finish_fast_sync(&mut self, last_timestamp: Option<u64>) {
        self.fast_sync = false;
        let last = match self.executor.pipeline().last_block_height().await {
            Ok(last) => last.unwrap_or(0),
            Err(e) => {
                debug!(error = %e, "Can't read chain height after fast sync");
                return;
            }
        };

        let advanced = {
            let mut status = self.executor.status_manager().lock();
            status.set_time(self.executor.clock().now());
            let before = status.my_status().height;
            status.fast_forward_height(last) && status.my_status().height > before
        };
        if advanced {
            self.executor.clear_current_block();
            if let Some(timestamp) = last_timestamp {
                self.executor
                    .strategy()
                    .block_committed(Duration::from_millis(timestamp));
            }
        }
        info!(height = last, advanced, "Fast sync finished");
    }

    /// Process inbound messages and tick until shutdown or until the inbound
    /// channel closes. Then waits for the in-flight pipeline operation and
    /// stops the pipeline.
    pub async fn run(
        mut self,
        mut inbound: InboundMessages,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let my_index = self.executor.status_manager().lock().my_index();
        info!(node = my_index, "Starting validator sync manager");

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!(node = my_index, "Shutdown signal received");
                    break;
                }

                message = inbound.recv() => match message {
                    Some((from, message)) => self.handle_message(from, message),
                    None => {
                        debug!(node = my_index, "Inbound channel closed");
                        break;
                    }
                },

                _ = tick.tick() => {
                    if !self.fast_sync {
                        self.tick();
                    } else if self.run_fast_sync(&mut inbound, &mut shutdown).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.executor.wait_for_running_operations().await;
        let pipeline = self.executor.pipeline().clone();
        match tokio::task::spawn_blocking(move || pipeline.stop()).await {
            Ok(true) => info!(node = my_index, "Validator sync manager stopped"),
            Ok(false) => warn!(node = my_index, "Pipeline did not stop in time"),
            Err(e) => warn!(node = my_index, error = %e, "Pipeline stop task failed"),
        }
    }
}
