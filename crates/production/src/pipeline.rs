//! Serialized block database pipeline.
//!
//! All engine access goes through one dedicated worker thread that executes
//! jobs strictly in submission order. Every operation returns a
//! [`PipelineFuture`] that resolves once the worker has run the job.
//!
//! # Pending block
//!
//! The worker holds at most one uncommitted [`BlockBuilder`]. Loading or
//! building a block, and adding a fetched block, first roll back a builder
//! left over from an earlier operation, handing its taken transactions back
//! to the queue.

use crate::engine::{BlockBuilder, BlockchainEngine, EngineError};
use crate::metrics;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use strata_types::{BlockData, BlockDataWithWitness, BlockRid, Signature};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, trace, warn};

/// Errors from pipeline operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The pipeline was stopped before the operation ran.
    #[error("Block pipeline is closed")]
    Closed,

    #[error("No pending block to commit")]
    NoPendingBlock,

    #[error("Failed to spawn pipeline worker: {0}")]
    Spawn(String),
}

impl PipelineError {
    /// Whether the failure stems from shutdown rather than a real fault.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            PipelineError::Closed | PipelineError::Engine(EngineError::AlreadyClosed)
        )
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How long `stop` waits for the worker to finish.
    pub stop_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_millis(1000),
        }
    }
}

/// Result handle of a pipeline operation.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread.
#[must_use = "pipeline results should be awaited or explicitly dropped"]
pub struct PipelineFuture<T> {
    rx: oneshot::Receiver<Result<T, PipelineError>>,
}

impl<T> PipelineFuture<T> {
    /// Block the current thread until the operation completes.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime.
    pub fn wait(self) -> Result<T, PipelineError> {
        self.rx.blocking_recv().unwrap_or(Err(PipelineError::Closed))
    }
}

impl<T> Future for PipelineFuture<T> {
    type Output = Result<T, PipelineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PipelineError::Closed)))
    }
}

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

/// State owned by the worker thread.
struct Worker {
    engine: Box<dyn BlockchainEngine>,
    builder: Option<Box<dyn BlockBuilder>>,
}

impl Worker {
    fn maybe_rollback(&mut self) {
        if let Some(builder) = self.builder.take() {
            debug!(height = builder.height(), "Rolling back pending block");
            self.engine.retry_taken_transactions();
            builder.rollback();
        }
    }
}

/// Decrements the queued block counter when an add-block job is consumed,
/// whether it ran or was dropped.
struct QueuedBlock(Arc<AtomicUsize>);

impl Drop for QueuedBlock {
    fn drop(&mut self) {
        let left = self.0.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_pipeline_queued_blocks(left);
    }
}

/// Single-worker executor for block database operations.
pub struct BlockPipeline {
    name: String,
    config: PipelineConfig,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    stopped: Arc<AtomicBool>,
    queued_blocks: Arc<AtomicUsize>,
    exited: Mutex<Option<std_mpsc::Receiver<()>>>,
}

impl BlockPipeline {
    /// Start the worker thread `"{name}-block-pipeline"` around `engine`.
    pub fn new(
        name: impl Into<String>,
        engine: Box<dyn BlockchainEngine>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let (exit_tx, exit_rx) = std_mpsc::channel();

        let mut worker = Worker {
            engine,
            builder: None,
        };
        thread::Builder::new()
            .name(format!("{}-block-pipeline", name))
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&mut worker);
                }
                worker.maybe_rollback();
                worker.engine.close();
                trace!("Block pipeline worker exited");
                let _ = exit_tx.send(());
            })
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        Ok(Self {
            name,
            config,
            tx: Mutex::new(Some(tx)),
            stopped: Arc::new(AtomicBool::new(false)),
            queued_blocks: Arc::new(AtomicUsize::new(0)),
            exited: Mutex::new(Some(exit_rx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `op` on the worker.
    fn submit<T, F>(&self, operation: &'static str, op: F) -> PipelineFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> Result<T, PipelineError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let stopped = self.stopped.clone();

        let job: Job = Box::new(move |worker| {
            // Dropping the reply resolves the future to `Closed`.
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            let _span = debug_span!("pipeline_job", operation).entered();
            let started = Instant::now();
            let result = op(worker);
            metrics::record_pipeline_job(operation, started.elapsed().as_secs_f64());
            if let Err(e) = &result {
                if !e.is_closed() {
                    metrics::record_pipeline_failure(operation);
                }
                debug!(error = %e, "Pipeline operation failed");
            }
            let _ = reply_tx.send(result);
        });

        if let Some(tx) = self.tx.lock().as_ref() {
            // A send error drops the job and with it the reply sender.
            let _ = tx.send(job);
        }
        PipelineFuture { rx: reply_rx }
    }

    /// Load and validate a block built by the primary; keep it pending and
    /// return our signature over it.
    pub fn load_unfinished_block(&self, block: BlockData) -> PipelineFuture<Signature> {
        self.submit("load_unfinished_block", move |worker| {
            worker.maybe_rollback();
            let builder = worker.engine.load_unfinished_block(&block)?;
            let signature = builder.my_signature();
            worker.builder = Some(builder);
            metrics::record_block_loaded();
            Ok(signature)
        })
    }

    /// Build a block as primary; keep it pending.
    pub fn build_block(&self) -> PipelineFuture<(BlockData, Signature)> {
        self.submit("build_block", |worker| {
            worker.maybe_rollback();
            let builder = worker.engine.build_block()?;
            let block = builder.block_data().clone();
            let signature = builder.my_signature();
            worker.builder = Some(builder);
            metrics::record_block_built();
            Ok((block, signature))
        })
    }

    /// Add a complete block fetched from a peer.
    pub fn add_block(&self, block: BlockDataWithWitness) -> PipelineFuture<()> {
        let count = self.queued_blocks.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_pipeline_queued_blocks(count);
        let queued = QueuedBlock(self.queued_blocks.clone());

        self.submit("add_block", move |worker| {
            drop(queued);
            worker.maybe_rollback();
            let height = block.block.height();
            let builder = worker.engine.load_unfinished_block(&block.block)?;
            builder.commit(&block.witness)?;
            metrics::record_block_committed(height);
            Ok(())
        })
    }

    /// Commit the pending block with the collected commit signatures.
    pub fn commit_block(&self, signatures: Vec<Option<Signature>>) -> PipelineFuture<()> {
        self.submit("commit_block", move |worker| {
            let mut builder = worker.builder.take().ok_or(PipelineError::NoPendingBlock)?;
            let my_signature = builder.my_signature();
            for signature in signatures.iter().flatten() {
                if signature.subject_id == my_signature.subject_id {
                    continue;
                }
                if let Err(e) = builder.apply_signature(signature) {
                    worker.builder = Some(builder);
                    return Err(e.into());
                }
            }
            let height = builder.height();
            let witness = builder.witness();
            builder.commit(&witness)?;
            metrics::record_block_committed(height);
            Ok(())
        })
    }

    /// Check a peer's commit signature against the pending block. Valid
    /// signatures are added to its witness.
    pub fn verify_block_signature(&self, signature: Signature) -> PipelineFuture<bool> {
        self.submit("verify_block_signature", move |worker| {
            let Some(builder) = worker.builder.as_mut() else {
                return Ok(false);
            };
            match builder.apply_signature(&signature) {
                Ok(()) => Ok(true),
                Err(e) => {
                    debug!(error = %e, "Signature invalid");
                    Ok(false)
                }
            }
        })
    }

    pub fn block_at_height(
        &self,
        height: u64,
        include_transactions: bool,
    ) -> PipelineFuture<Option<BlockDataWithWitness>> {
        self.submit("block_at_height", move |worker| {
            Ok(worker.engine.block_at_height(height, include_transactions)?)
        })
    }

    /// Our signature over a committed block.
    pub fn block_signature(&self, block_rid: BlockRid) -> PipelineFuture<Option<Signature>> {
        self.submit("block_signature", move |worker| {
            Ok(worker.engine.block_signature(&block_rid)?)
        })
    }

    pub fn last_block_height(&self) -> PipelineFuture<Option<u64>> {
        self.submit("last_block_height", |worker| {
            Ok(worker.engine.last_block_height()?)
        })
    }

    /// Fetched blocks submitted but not yet picked up by the worker.
    pub fn queued_block_count(&self) -> usize {
        self.queued_blocks.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the pipeline.
    ///
    /// Queued jobs are dropped and resolve to [`PipelineError::Closed`]. Waits
    /// up to `stop_timeout` for the worker to finish its current job and roll
    /// back any pending block. Blocks the calling thread; returns whether the
    /// worker exited in time.
    pub fn stop(&self) -> bool {
        self.stopped.store(true, Ordering::SeqCst);
        self.tx.lock().take();

        let Some(exited) = self.exited.lock().take() else {
            return true;
        };
        match exited.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                debug!(pipeline = %self.name, "Block pipeline stopped");
                true
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    pipeline = %self.name,
                    timeout = ?self.config.stop_timeout,
                    "Block pipeline worker did not stop in time"
                );
                false
            }
        }
    }
}

impl Drop for BlockPipeline {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.tx.lock().take();
    }
}
