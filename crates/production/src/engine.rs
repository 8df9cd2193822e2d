//! Storage and execution engine interface.
//!
//! The engine itself lives outside the consensus core. The block pipeline
//! drives it from a single worker thread, so implementations only need to be
//! `Send`.

use strata_types::{BlockData, BlockDataWithWitness, BlockRid, BlockWitness, Signature};
use thiserror::Error;

/// Errors reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine was shut down while an operation was pending.
    #[error("Engine is already closed")]
    AlreadyClosed,

    /// The block or signature is invalid.
    #[error("Bad data: {0}")]
    BadData(String),

    /// Block building was aborted through the strategy's force-stop flag.
    #[error("Block building was force stopped")]
    ForceStopped,

    #[error("Unknown signer: {0}")]
    UnknownSigner(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// An uncommitted block together with its witness under construction.
pub trait BlockBuilder: Send {
    fn height(&self) -> u64;

    fn block_data(&self) -> &BlockData;

    /// Our own signature over the block.
    fn my_signature(&self) -> Signature;

    /// Validate a peer's signature over the block and add it to the witness.
    fn apply_signature(&mut self, signature: &Signature) -> Result<(), EngineError>;

    /// The witness collected so far.
    fn witness(&self) -> BlockWitness;

    /// Commit the block with `witness`. On failure the builder is rolled back.
    fn commit(self: Box<Self>, witness: &BlockWitness) -> Result<(), EngineError>;

    /// Discard the block.
    fn rollback(self: Box<Self>);
}

/// Block storage and execution.
pub trait BlockchainEngine: Send {
    /// Validate and execute a block built by somebody else.
    fn load_unfinished_block(
        &mut self,
        block: &BlockData,
    ) -> Result<Box<dyn BlockBuilder>, EngineError>;

    /// Build a new block from queued transactions.
    fn build_block(&mut self) -> Result<Box<dyn BlockBuilder>, EngineError>;

    fn block_at_height(
        &self,
        height: u64,
        include_transactions: bool,
    ) -> Result<Option<BlockDataWithWitness>, EngineError>;

    /// Our signature over a committed block.
    fn block_signature(&self, block_rid: &BlockRid) -> Result<Option<Signature>, EngineError>;

    /// Height of the last committed block, `None` for an empty chain.
    fn last_block_height(&self) -> Result<Option<u64>, EngineError>;

    /// Return transactions taken by an abandoned builder to the queue.
    fn retry_taken_transactions(&mut self);

    /// Release resources. Called once from the pipeline worker on exit.
    fn close(&mut self) {}
}
