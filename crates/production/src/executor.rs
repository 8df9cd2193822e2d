//! Turns block intents into pipeline operations.
//!
//! The executor sits between the [`StatusManager`] and the [`BlockPipeline`].
//! `pump` reads the current intent under the status lock and, for
//! `BuildBlock` and `CommitBlock`, submits the matching pipeline job. Fetch
//! intents are left to the sync layer, which calls back into
//! `on_received_*` once the requested data arrives.
//!
//! At most one pipeline operation is in flight. Its completion runs on the
//! tokio runtime, re-takes the status lock, applies the result and pumps
//! again.
//!
//! Lock order: status manager, then executor state.

use crate::engine::EngineError;
use crate::pipeline::{BlockPipeline, PipelineError, PipelineFuture};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use strata_bft::{BlockBuildingStrategy, BlockIntent, Clock, SharedStatusManager, StatusManager};
use strata_types::{BlockData, BlockDataWithWitness, BlockRid, NodeIndex, NodeState, Signature};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Executor state guarded by its own lock, always taken after the status lock.
#[derive(Debug, Default)]
struct ExecutorState {
    /// Intent handed to the sync layer. `DoNothing` while an operation runs.
    intent: BlockIntent,

    /// Intent seen by the last pump.
    previous_intent: BlockIntent,

    /// The block we built or loaded at the current height.
    current_block: Option<BlockData>,

    /// Header timestamp of the last block we held. Unset until the first
    /// pipeline operation succeeds.
    last_block_timestamp: Option<Duration>,
}

struct Inner {
    status: SharedStatusManager,
    pipeline: Arc<BlockPipeline>,
    strategy: Arc<dyn BlockBuildingStrategy>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    /// Single permit; held for the lifetime of an in-flight operation.
    in_flight: Arc<Semaphore>,
    state: Mutex<ExecutorState>,
}

/// Cloneable handle to the intent executor of one chain.
#[derive(Clone)]
pub struct IntentExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IntentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentExecutor")
            .field("pipeline", &self.inner.pipeline.name())
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

impl IntentExecutor {
    /// Create an executor. Completions are spawned on `runtime`.
    pub fn new(
        status: SharedStatusManager,
        pipeline: Arc<BlockPipeline>,
        strategy: Arc<dyn BlockBuildingStrategy>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                status,
                pipeline,
                strategy,
                clock,
                runtime,
                in_flight: Arc::new(Semaphore::new(1)),
                state: Mutex::new(ExecutorState::default()),
            }),
        }
    }

    pub fn status_manager(&self) -> &SharedStatusManager {
        &self.inner.status
    }

    pub fn pipeline(&self) -> &Arc<BlockPipeline> {
        &self.inner.pipeline
    }

    pub fn strategy(&self) -> &Arc<dyn BlockBuildingStrategy> {
        &self.inner.strategy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Current intent as seen by the sync layer.
    pub fn block_intent(&self) -> BlockIntent {
        let _status = self.inner.status.lock();
        self.inner.state.lock().intent.clone()
    }

    pub fn current_block(&self) -> Option<BlockData> {
        let _status = self.inner.status.lock();
        self.inner.state.lock().current_block.clone()
    }

    pub fn last_block_timestamp(&self) -> Option<Duration> {
        let _status = self.inner.status.lock();
        self.inner.state.lock().last_block_timestamp
    }

    /// Forget the block held at the current height. Used after the chain was
    /// advanced outside the executor.
    pub fn clear_current_block(&self) {
        let _status = self.inner.status.lock();
        self.inner.state.lock().current_block = None;
    }

    /// Whether a pipeline operation is in flight.
    pub fn is_processing(&self) -> bool {
        self.inner.in_flight.available_permits() == 0
    }

    /// Wait until the in-flight operation, if any, has completed.
    pub async fn wait_for_running_operations(&self) {
        // The semaphore is never closed.
        let _permit = self.inner.in_flight.acquire().await;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Intent processing
    // ═══════════════════════════════════════════════════════════════════════════

    /// Act on the status manager's current intent and return the intent the
    /// sync layer should follow.
    pub fn pump(&self) -> BlockIntent {
        let mut status = self.inner.status.lock();
        status.set_time(self.inner.clock.now());
        let mut state = self.inner.state.lock();
        self.update(&mut status, &mut state);
        state.intent.clone()
    }

    fn update(&self, status: &mut StatusManager, state: &mut ExecutorState) {
        if self.is_processing() {
            return;
        }

        let intent = status.block_intent().clone();
        if state.previous_intent == BlockIntent::BuildBlock && intent != BlockIntent::BuildBlock {
            self.inner.strategy.set_force_stop_block_building(true);
        }
        state.previous_intent = intent.clone();
        state.intent = BlockIntent::DoNothing;

        match intent {
            BlockIntent::CommitBlock => self.commit_current_block(status, state),
            BlockIntent::BuildBlock => self.build_block(status, state),
            other => state.intent = other,
        }
    }

    fn commit_current_block(&self, status: &mut StatusManager, state: &mut ExecutorState) {
        let Some(block) = state.current_block.clone() else {
            error!(
                height = status.my_status().height,
                "Don't have a block the status manager wants committed"
            );
            return;
        };
        trace!(block_rid = %block.block_rid(), "Scheduling block commit");

        let signatures = status.commit_signatures().to_vec();
        self.run_pipeline_op(
            state,
            |pipeline| pipeline.commit_block(signatures),
            move |executor, status, state, ()| {
                let block_rid = block.block_rid();
                info!(height = block.height(), %block_rid, "Committed block");
                status.on_committed_block(&block_rid);
                let timestamp = block_timestamp(&block);
                state.last_block_timestamp = Some(timestamp);
                state.current_block = None;
                executor.inner.strategy.block_committed(timestamp);
            },
            |_, _, state, e| {
                let block_rid = state.current_block.as_ref().map(BlockData::block_rid);
                error!(?block_rid, error = %e, "Can't commit block");
            },
        );
    }

    fn build_block(&self, status: &mut StatusManager, state: &mut ExecutorState) {
        let strategy = &self.inner.strategy;
        strategy.set_force_stop_block_building(false);

        let now = self.inner.clock.now();
        if strategy.must_wait_before_build_block(now) || !strategy.should_build_block(now) {
            return;
        }
        trace!(height = status.my_status().height, "Scheduling block build");

        self.run_pipeline_op(
            state,
            |pipeline| pipeline.build_block(),
            |_, status, state, (block, signature)| {
                if status.on_built_block(&block.block_rid(), signature) {
                    state.last_block_timestamp = Some(block_timestamp(&block));
                    state.current_block = Some(block);
                }
            },
            |executor, status, _, e| {
                let height = status.my_status().height;
                match e {
                    PipelineError::Engine(EngineError::ForceStopped) => {
                        debug!(height, error = %e, "Can't build block");
                    }
                    e if e.is_closed() => {
                        debug!(height, error = %e, "Can't build block");
                        executor.inner.strategy.block_failed(executor.inner.clock.now());
                    }
                    e => {
                        error!(height, error = %e, "Can't build block");
                        executor.inner.strategy.block_failed(executor.inner.clock.now());
                    }
                }
            },
        );
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Data from peers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Load the primary's unfinished block if it is the one we are waiting for.
    pub fn on_received_unfinished_block(&self, block: BlockData) {
        let _status = self.inner.status.lock();
        let mut state = self.inner.state.lock();
        let block_rid = block.block_rid();
        if !state.intent.is_waiting_for(&block_rid) {
            trace!(%block_rid, intent = %state.intent, "Ignoring unfinished block");
            return;
        }

        let to_load = block.clone();
        self.run_pipeline_op(
            &mut state,
            move |pipeline| pipeline.load_unfinished_block(to_load),
            move |_, status, state, signature| {
                if status.on_received_block(&block_rid, signature) {
                    state.last_block_timestamp = Some(block_timestamp(&block));
                    state.current_block = Some(block);
                }
            },
            move |_, _, _, e| log_load_failure(&e, "Can't load unfinished block", block_rid),
        );
    }

    /// Add a committed block fetched from a peer if we are fetching `height`.
    pub fn on_received_block_at_height(&self, block: BlockDataWithWitness, height: u64) {
        let _status = self.inner.status.lock();
        let mut state = self.inner.state.lock();
        if !state.intent.is_fetching_height(height) {
            trace!(height, intent = %state.intent, "Ignoring block at height");
            return;
        }

        let block_rid = block.block_rid();
        let timestamp = block_timestamp(&block.block);
        self.run_pipeline_op(
            &mut state,
            move |pipeline| pipeline.add_block(block),
            move |executor, status, state, ()| {
                executor.apply_fetched_block(status, state, height, timestamp);
            },
            move |_, _, _, e| log_load_failure(&e, "Can't add received block", block_rid),
        );
    }

    /// Advance past a fetched block at `height` once it is on our chain.
    fn apply_fetched_block(
        &self,
        status: &mut StatusManager,
        state: &mut ExecutorState,
        height: u64,
        timestamp: Duration,
    ) {
        if status.on_height_advance(height + 1) {
            state.current_block = None;
            state.last_block_timestamp = Some(timestamp);
            self.inner.strategy.block_committed(timestamp);
        }
    }

    /// Verify a peer's commit signature on the pipeline and hand it to the
    /// status manager if valid.
    ///
    /// Not gated by the in-flight operation.
    pub fn on_received_commit_signature(
        &self,
        node_index: NodeIndex,
        block_rid: BlockRid,
        signature: Signature,
    ) {
        let verified = {
            let status = self.inner.status.lock();
            let my_status = status.my_status();
            if my_status.state != NodeState::Prepared || my_status.block_rid != Some(block_rid) {
                debug!(from = node_index, %block_rid, "Commit signature not needed");
                return;
            }
            self.inner.pipeline.verify_block_signature(signature.clone())
        };

        let executor = self.clone();
        self.inner.runtime.spawn(async move {
            match verified.await {
                Ok(true) => {
                    {
                        let mut status = executor.inner.status.lock();
                        status.set_time(executor.inner.clock.now());
                        status.on_commit_signature(node_index, &block_rid, signature);
                    }
                    executor.pump();
                }
                Ok(false) => warn!(from = node_index, %block_rid, "Invalid commit signature"),
                Err(e) if e.is_closed() => debug!(error = %e, "Can't verify commit signature"),
                Err(e) => error!(error = %e, "Can't verify commit signature"),
            }
        });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Operation plumbing
    // ═══════════════════════════════════════════════════════════════════════════

    /// Submit a pipeline operation unless one is already in flight.
    ///
    /// Called with both locks held. The completion re-takes them, applies
    /// `on_success` or `on_failure`, releases the in-flight permit and pumps.
    fn run_pipeline_op<T, Op, S, F>(
        &self,
        state: &mut ExecutorState,
        op: Op,
        on_success: S,
        on_failure: F,
    ) where
        T: Send + 'static,
        Op: FnOnce(&BlockPipeline) -> PipelineFuture<T>,
        S: FnOnce(&IntentExecutor, &mut StatusManager, &mut ExecutorState, T) + Send + 'static,
        F: FnOnce(&IntentExecutor, &mut StatusManager, &mut ExecutorState, PipelineError)
            + Send
            + 'static,
    {
        let Ok(permit) = self.inner.in_flight.clone().try_acquire_owned() else {
            trace!("Pipeline operation already in flight");
            return;
        };
        state.intent = BlockIntent::DoNothing;
        let future = op(&self.inner.pipeline);

        let executor = self.clone();
        self.inner.runtime.spawn(async move {
            let result = future.await;
            let mut status = executor.inner.status.lock();
            status.set_time(executor.inner.clock.now());
            let mut state = executor.inner.state.lock();
            match result {
                Ok(value) => on_success(&executor, &mut status, &mut state, value),
                Err(e) => on_failure(&executor, &mut status, &mut state, e),
            }
            // The follow-up runs under the same locks, so no reader sees the
            // result applied without its next operation scheduled.
            drop(permit);
            executor.update(&mut status, &mut state);
        });
    }
}

fn block_timestamp(block: &BlockData) -> Duration {
    Duration::from_millis(block.header.timestamp)
}

fn log_load_failure(error: &PipelineError, message: &str, block_rid: BlockRid) {
    match error {
        e if e.is_closed() => debug!(%block_rid, error = %e, "{}", message),
        PipelineError::Engine(EngineError::BadData(_)) => {
            warn!(%block_rid, error = %error, "{}", message)
        }
        e => error!(%block_rid, error = %e, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_block, make_executor, settle, wait_until};
    use std::sync::atomic::Ordering;
    use strata_types::{BlockWitness, NodeStatus};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_validator_builds_and_commits() {
        let h = make_executor(1, 0, 1);
        assert_eq!(h.executor.pump(), BlockIntent::DoNothing);
        h.strategy.build.store(true, Ordering::SeqCst);

        h.executor.pump();
        assert!(wait_until(|| h.chain.height.load(Ordering::SeqCst) >= 3).await);
        h.strategy.build.store(false, Ordering::SeqCst);

        // A build may still be in flight; wait for its commit to land.
        let idle = wait_until(|| {
            let status = h.executor.inner.status.lock();
            let state = h.executor.inner.state.lock();
            !h.executor.is_processing()
                && state.current_block.is_none()
                && status.my_status().height == h.chain.height.load(Ordering::SeqCst) + 1
        })
        .await;
        assert!(idle);

        let committed = h.chain.height.load(Ordering::SeqCst);
        assert!(committed >= 3);
        assert_eq!(
            h.executor.status_manager().lock().my_status().height,
            committed + 1
        );
        assert!(h.strategy.committed.load(Ordering::SeqCst) >= 3);
        assert!(h.executor.current_block().is_none());
        assert_eq!(
            h.executor.last_block_timestamp(),
            Some(Duration::from_millis(1_000 * committed))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completion_schedules_next_operation_before_release() {
        let h = make_executor(1, 0, 1);
        h.strategy.build.store(true, Ordering::SeqCst);
        h.executor.pump();

        // Whenever the executor is observed idle under the locks, the held
        // block has already been committed.
        for _ in 0..200 {
            {
                let _status = h.executor.inner.status.lock();
                let state = h.executor.inner.state.lock();
                if !h.executor.is_processing() {
                    assert!(state.current_block.is_none());
                }
            }
            if h.chain.height.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        h.strategy.build.store(false, Ordering::SeqCst);
        settle(&h.executor).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_fetched_block_is_not_reported_committed() {
        let h = make_executor(4, 0, 4);
        let mut status = h.executor.inner.status.lock();
        let mut state = h.executor.inner.state.lock();
        // Height already moved on by another path.
        assert!(status.on_height_advance(5));

        h.executor
            .apply_fetched_block(&mut status, &mut state, 4, Duration::from_secs(4));
        assert_eq!(status.my_status().height, 5);
        assert_eq!(state.last_block_timestamp, None);
        assert_eq!(h.strategy.committed.load(Ordering::SeqCst), 0);

        h.executor
            .apply_fetched_block(&mut status, &mut state, 5, Duration::from_secs(5));
        assert_eq!(status.my_status().height, 6);
        assert_eq!(state.last_block_timestamp, Some(Duration::from_secs(5)));
        assert_eq!(h.strategy.committed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_build_backs_off_without_transition() {
        let h = make_executor(1, 0, 1);
        h.fail_builds.store(true, Ordering::SeqCst);
        h.strategy.build.store(true, Ordering::SeqCst);

        h.executor.pump();
        // Each completion pumps and retries; stop retrying before settling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.strategy.build.store(false, Ordering::SeqCst);
        settle(&h.executor).await;

        assert!(h.strategy.failed.load(Ordering::SeqCst) >= 1);
        let status = h.executor.status_manager().lock();
        assert_eq!(status.my_status().height, 1);
        assert_eq!(status.my_status().state, NodeState::WaitBlock);
        assert_eq!(*status.block_intent(), BlockIntent::BuildBlock);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_leaving_build_intent_raises_force_stop() {
        // Primary for height 4, round 0 is node 0.
        let h = make_executor(4, 0, 4);
        assert_eq!(h.executor.pump(), BlockIntent::DoNothing);
        assert!(!h.strategy.force_stop.load(Ordering::SeqCst));

        {
            let mut status = h.executor.status_manager().lock();
            for node in 1..4 {
                status.on_status_update(node, NodeStatus::new(6, 1));
            }
        }
        assert_eq!(
            h.executor.pump(),
            BlockIntent::FetchBlockAtHeight { height: 4 }
        );
        assert!(h.strategy.force_stop.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fetched_block_advances_height() {
        let h = make_executor(4, 0, 4);
        {
            let mut status = h.executor.status_manager().lock();
            for node in 1..4 {
                status.on_status_update(node, NodeStatus::new(6, 1));
            }
        }
        h.executor.pump();

        // Wrong height is ignored.
        h.executor.on_received_block_at_height(
            BlockDataWithWitness::new(make_block(5), BlockWitness::default()),
            5,
        );
        assert!(!h.executor.is_processing());

        h.executor.on_received_block_at_height(
            BlockDataWithWitness::new(make_block(4), BlockWitness::default()),
            4,
        );
        settle(&h.executor).await;

        assert_eq!(h.chain.height.load(Ordering::SeqCst), 4);
        let status = h.executor.status_manager().lock();
        assert_eq!(status.my_status().height, 5);
        assert_eq!(
            *status.block_intent(),
            BlockIntent::FetchBlockAtHeight { height: 5 }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unfinished_block_is_loaded_only_when_wanted() {
        // Height 5: primary is node 1.
        let h = make_executor(4, 0, 5);
        let block = make_block(5);
        let mut primary_status = NodeStatus::new(5, 1);
        primary_status.state = NodeState::HaveBlock;
        primary_status.block_rid = Some(block.block_rid());

        h.executor.on_received_unfinished_block(block.clone());
        assert!(!h.executor.is_processing());

        h.executor
            .status_manager()
            .lock()
            .on_status_update(1, primary_status);
        assert_eq!(
            h.executor.pump(),
            BlockIntent::FetchUnfinishedBlock {
                block_rid: block.block_rid()
            }
        );

        h.executor.on_received_unfinished_block(make_block(6));
        assert!(!h.executor.is_processing());

        h.executor.on_received_unfinished_block(block.clone());
        settle(&h.executor).await;

        assert_eq!(h.executor.current_block(), Some(block.clone()));
        let status = h.executor.status_manager().lock();
        assert_eq!(status.my_status().state, NodeState::HaveBlock);
        assert_eq!(status.my_status().block_rid, Some(block.block_rid()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commit_without_block_is_refused() {
        let h = make_executor(1, 0, 1);
        // No current block is held, so a forged commit intent must not reach
        // the pipeline.
        let mut status = h.executor.inner.status.lock();
        let mut state = h.executor.inner.state.lock();
        h.executor.commit_current_block(&mut status, &mut state);
        assert!(!h.executor.is_processing());
        assert_eq!(state.intent, BlockIntent::DoNothing);
    }
}
