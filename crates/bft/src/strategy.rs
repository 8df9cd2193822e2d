//! Block building policy.
//!
//! A `BuildBlock` intent only says that this node is primary. Whether a
//! block is worth building right now is decided here, from the transaction
//! queue and the time since the last block.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pending transactions waiting to be included in a block.
pub trait TransactionQueue: Send + Sync {
    fn queue_size(&self) -> usize;
}

/// Decides when the primary builds a block.
pub trait BlockBuildingStrategy: Send + Sync {
    /// Whether a block should be built now.
    fn should_build_block(&self, now: Duration) -> bool;

    /// Whether building is paused after a failed attempt.
    fn must_wait_before_build_block(&self, now: Duration) -> bool;

    /// Whether a block under construction with `transaction_count`
    /// transactions is full.
    fn should_stop_building_block(&self, transaction_count: usize) -> bool;

    /// A block with header `timestamp` was committed.
    fn block_committed(&self, timestamp: Duration);

    /// Building a block failed.
    fn block_failed(&self, now: Duration);

    /// Ask an in-progress build to give up.
    fn set_force_stop_block_building(&self, value: bool);

    fn should_force_stop_block_building(&self) -> bool;
}

/// Block building configuration.
#[derive(Debug, Clone)]
pub struct BlockBuildingConfig {
    /// Build a block at least this often, even an empty one.
    pub max_block_time: Duration,

    /// Build as soon as this many transactions are queued. Also the block
    /// size limit.
    pub max_block_transactions: usize,

    /// Longest a queued transaction waits for a block.
    pub max_tx_delay: Duration,

    /// Minimum time between two blocks.
    pub min_inter_block_interval: Duration,

    pub min_backoff_time: Duration,
    pub max_backoff_time: Duration,
}

impl Default for BlockBuildingConfig {
    fn default() -> Self {
        Self {
            max_block_time: Duration::from_millis(3000),
            max_block_transactions: 100,
            max_tx_delay: Duration::from_millis(1000),
            min_inter_block_interval: Duration::from_millis(25),
            min_backoff_time: Duration::from_millis(20),
            max_backoff_time: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Default)]
struct Timers {
    last_block_time: Duration,
    /// When a non-empty queue was first seen since the last block.
    first_tx_time: Option<Duration>,
    failed_block_time: Option<Duration>,
    failed_block_count: u32,
}

/// Default [`BlockBuildingStrategy`]: time and size based batching with
/// exponential backoff after failures.
pub struct BaseBlockBuildingStrategy {
    config: BlockBuildingConfig,
    queue: Arc<dyn TransactionQueue>,
    timers: Mutex<Timers>,
    force_stop: AtomicBool,
}

impl BaseBlockBuildingStrategy {
    /// `last_block_time` is the timestamp of the last committed block, or
    /// zero for an empty chain.
    pub fn new(
        config: BlockBuildingConfig,
        queue: Arc<dyn TransactionQueue>,
        last_block_time: Duration,
    ) -> Self {
        Self {
            config,
            queue,
            timers: Mutex::new(Timers {
                last_block_time,
                ..Timers::default()
            }),
            force_stop: AtomicBool::new(false),
        }
    }

    /// Current pause after a failed build.
    pub fn backoff_time(&self) -> Duration {
        let failed = self.timers.lock().failed_block_count;
        let exp = 2u64.checked_pow(failed).unwrap_or(u64::MAX);
        let backoff = Duration::from_millis(exp).saturating_add(self.config.min_backoff_time);
        backoff.min(self.config.max_backoff_time)
    }

    fn time_constraints_reached(
        &self,
        timers: &mut Timers,
        have_seen_txs: bool,
        now: Duration,
    ) -> bool {
        if now.saturating_sub(timers.last_block_time) > self.config.max_block_time {
            return true;
        }
        if let Some(first) = timers.first_tx_time {
            if now.saturating_sub(first) > self.config.max_tx_delay {
                return true;
            }
        }
        if timers.first_tx_time.is_none() && have_seen_txs {
            timers.first_tx_time = Some(now);
        }
        false
    }
}

impl BlockBuildingStrategy for BaseBlockBuildingStrategy {
    fn should_build_block(&self, now: Duration) -> bool {
        let mut timers = self.timers.lock();
        if now.saturating_sub(timers.last_block_time) < self.config.min_inter_block_interval {
            return false;
        }
        let queued = self.queue.queue_size();
        if queued >= self.config.max_block_transactions {
            return true;
        }
        self.time_constraints_reached(&mut timers, queued > 0, now)
    }

    fn must_wait_before_build_block(&self, now: Duration) -> bool {
        let failed_at = self.timers.lock().failed_block_time;
        match failed_at {
            Some(failed_at) => now.saturating_sub(failed_at) < self.backoff_time(),
            None => false,
        }
    }

    fn should_stop_building_block(&self, transaction_count: usize) -> bool {
        transaction_count >= self.config.max_block_transactions
    }

    fn block_committed(&self, timestamp: Duration) {
        let mut timers = self.timers.lock();
        *timers = Timers {
            last_block_time: timestamp,
            ..Timers::default()
        };
    }

    fn block_failed(&self, now: Duration) {
        let mut timers = self.timers.lock();
        timers.failed_block_time = Some(now);
        timers.failed_block_count += 1;
    }

    fn set_force_stop_block_building(&self, value: bool) {
        self.force_stop.store(value, Ordering::SeqCst);
    }

    fn should_force_stop_block_building(&self) -> bool {
        self.force_stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FixedQueue(AtomicUsize);

    impl FixedQueue {
        fn set(&self, size: usize) {
            self.0.store(size, Ordering::SeqCst);
        }
    }

    impl TransactionQueue for FixedQueue {
        fn queue_size(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn make_strategy() -> (BaseBlockBuildingStrategy, Arc<FixedQueue>) {
        let queue = Arc::new(FixedQueue::default());
        let strategy = BaseBlockBuildingStrategy::new(
            BlockBuildingConfig::default(),
            queue.clone(),
            ms(10_000),
        );
        (strategy, queue)
    }

    #[test]
    fn test_min_inter_block_interval() {
        let (strategy, queue) = make_strategy();
        queue.set(500);
        assert!(!strategy.should_build_block(ms(10_010)));
        assert!(strategy.should_build_block(ms(10_025)));
    }

    #[test]
    fn test_full_queue_builds_immediately() {
        let (strategy, queue) = make_strategy();
        queue.set(99);
        assert!(!strategy.should_build_block(ms(10_100)));
        queue.set(100);
        assert!(strategy.should_build_block(ms(10_100)));
    }

    #[test]
    fn test_max_block_time_builds_empty_block() {
        let (strategy, _queue) = make_strategy();
        assert!(!strategy.should_build_block(ms(13_000)));
        assert!(strategy.should_build_block(ms(13_001)));
    }

    #[test]
    fn test_max_tx_delay() {
        let (strategy, queue) = make_strategy();
        queue.set(1);
        // First sighting starts the clock.
        assert!(!strategy.should_build_block(ms(10_500)));
        assert!(!strategy.should_build_block(ms(11_500)));
        assert!(strategy.should_build_block(ms(11_501)));
    }

    #[test]
    fn test_block_committed_resets_timers() {
        let (strategy, queue) = make_strategy();
        queue.set(1);
        strategy.should_build_block(ms(10_500));
        strategy.block_failed(ms(10_600));

        strategy.block_committed(ms(11_000));
        assert!(!strategy.must_wait_before_build_block(ms(11_001)));
        // The tx delay clock restarts on the next sighting.
        assert!(!strategy.should_build_block(ms(11_600)));
    }

    #[test]
    fn test_backoff_after_failures() {
        let (strategy, _queue) = make_strategy();
        assert!(!strategy.must_wait_before_build_block(ms(0)));

        strategy.block_failed(ms(1000));
        // 2^1 + 20
        assert_eq!(strategy.backoff_time(), ms(22));
        assert!(strategy.must_wait_before_build_block(ms(1021)));
        assert!(!strategy.must_wait_before_build_block(ms(1022)));

        for _ in 0..20 {
            strategy.block_failed(ms(1000));
        }
        assert_eq!(strategy.backoff_time(), ms(2000));
    }

    #[test]
    fn test_force_stop_flag() {
        let (strategy, _queue) = make_strategy();
        assert!(!strategy.should_force_stop_block_building());
        strategy.set_force_stop_block_building(true);
        assert!(strategy.should_force_stop_block_building());
    }

    #[test]
    fn test_block_size_limit() {
        let (strategy, _queue) = make_strategy();
        assert!(!strategy.should_stop_building_block(99));
        assert!(strategy.should_stop_building_block(100));
    }
}
