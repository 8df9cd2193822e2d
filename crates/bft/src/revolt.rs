//! Liveness detector.
//!
//! Watches the local status and starts a revolt when the primary fails to
//! deliver a block in time. The timeout grows exponentially with the round so
//! that a network with slow validators eventually settles on a round long
//! enough for a block to get through.

use crate::status::StatusManager;
use std::time::Duration;
use strata_types::NodeStatus;
use tracing::info;

/// Growth factor of the per-round delay.
const DELAY_GROWTH: f64 = 1.2;

/// Revolt timing configuration.
#[derive(Debug, Clone)]
pub struct RevoltConfig {
    /// Time a primary gets at round 0.
    pub timeout: Duration,

    /// Scale of the extra per-round delay `base * 1.2^round - base`.
    pub exponential_delay_base: Duration,

    /// Cap on the extra per-round delay.
    pub exponential_delay_max: Duration,

    /// Revolt early when the primary's last status is older than this.
    /// Disabled when `None`.
    pub fast_revolt_status_timeout: Option<Duration>,
}

impl Default for RevoltConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            exponential_delay_base: Duration::from_secs(1),
            exponential_delay_max: Duration::from_secs(600),
            fast_revolt_status_timeout: None,
        }
    }
}

impl RevoltConfig {
    /// Extra delay granted to the primary of `round`.
    pub fn delay_for_round(&self, round: u64) -> Duration {
        let base = self.exponential_delay_base.as_millis() as f64;
        let max = self.exponential_delay_max.as_millis() as f64;
        if base <= 0.0 {
            return Duration::ZERO;
        }
        // First round whose delay would reach the cap.
        let max_round = ((max / base).ln() / DELAY_GROWTH.ln()).floor();
        if round as f64 >= max_round {
            return self.exponential_delay_max;
        }
        let delay = base * DELAY_GROWTH.powf(round as f64) - base;
        Duration::from_millis(delay as u64)
    }
}

/// Starts revolts against an unresponsive primary.
#[derive(Debug)]
pub struct RevoltTracker {
    config: RevoltConfig,
    deadline: Duration,
    prev_height: u64,
    prev_round: u64,
}

impl RevoltTracker {
    pub fn new(config: RevoltConfig, status: &NodeStatus, now: Duration) -> Self {
        let mut tracker = Self {
            config,
            deadline: Duration::ZERO,
            prev_height: status.height,
            prev_round: status.round,
        };
        tracker.reset_deadline(status.round, now);
        tracker
    }

    /// Time after which a revolt is started.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Check for a stalled primary and revolt against it.
    ///
    /// Returns whether `on_start_revolting` was called.
    pub fn update(
        &mut self,
        status_manager: &mut StatusManager,
        should_build_block: bool,
        now: Duration,
    ) -> bool {
        let primary = status_manager.primary_index();
        let revolt = self.should_revolt(
            status_manager.my_status(),
            status_manager.is_my_node_primary(),
            status_manager.latest_status_timestamp(primary),
            should_build_block,
            now,
        );
        if revolt {
            let status = status_manager.my_status();
            info!(
                height = status.height,
                round = status.round,
                primary,
                "Starting revolt"
            );
            status_manager.on_start_revolting();
        }
        revolt
    }

    fn reset_deadline(&mut self, round: u64, now: Duration) {
        self.deadline = now + self.config.timeout + self.config.delay_for_round(round);
    }

    fn should_revolt(
        &mut self,
        status: &NodeStatus,
        is_primary: bool,
        primary_last_seen: Option<Duration>,
        should_build_block: bool,
        now: Duration,
    ) -> bool {
        if status.height != self.prev_height || status.round != self.prev_round {
            self.prev_height = status.height;
            self.prev_round = status.round;
            self.reset_deadline(status.round, now);
        }

        // Nothing to build, nothing to wait for.
        if !should_build_block {
            self.reset_deadline(status.round, now);
        }

        if status.revolting {
            return false;
        }

        if let Some(fast_timeout) = self.config.fast_revolt_status_timeout {
            if !is_primary && status.height > 0 {
                let last_seen = primary_last_seen.unwrap_or(Duration::ZERO);
                if now.saturating_sub(last_seen) > fast_timeout {
                    return true;
                }
            }
        }

        now > self.deadline
    }
}
