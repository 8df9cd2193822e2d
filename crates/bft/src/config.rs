//! BFT configuration.

use crate::revolt::RevoltConfig;
use crate::strategy::BlockBuildingConfig;
use thiserror::Error;

/// Errors from configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_recompute_iterations must be at least 1")]
    ZeroRecomputeIterations,

    #[error("Invalid revolt configuration: {0}")]
    InvalidRevolt(String),

    #[error("Invalid block building configuration: {0}")]
    InvalidBlockBuilding(String),
}

/// BFT consensus configuration.
#[derive(Debug, Clone)]
pub struct BftConfig {
    /// Upper bound on fixed-point iterations of a single status recompute.
    /// Reaching it indicates a bug; the loop stops and the anomaly is reported.
    pub max_recompute_iterations: usize,

    /// Subtracted from wall-clock milliseconds to seed the own status serial.
    /// Keeps serials fresh across restarts as long as fewer than 1000 status
    /// changes happen per second.
    pub serial_epoch_millis: u64,

    /// Liveness detector settings.
    pub revolt: RevoltConfig,

    /// Block building policy settings.
    pub block_building: BlockBuildingConfig,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            max_recompute_iterations: 1000,
            serial_epoch_millis: 1_518_000_000_000,
            revolt: RevoltConfig::default(),
            block_building: BlockBuildingConfig::default(),
        }
    }
}

impl BftConfig {
    /// Create a new BFT configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the recompute iteration bound.
    pub fn with_max_recompute_iterations(mut self, iterations: usize) -> Self {
        self.max_recompute_iterations = iterations;
        self
    }

    /// Set the serial seeding epoch.
    pub fn with_serial_epoch_millis(mut self, epoch: u64) -> Self {
        self.serial_epoch_millis = epoch;
        self
    }

    /// Set the revolt configuration.
    pub fn with_revolt(mut self, revolt: RevoltConfig) -> Self {
        self.revolt = revolt;
        self
    }

    /// Set the block building configuration.
    pub fn with_block_building(mut self, block_building: BlockBuildingConfig) -> Self {
        self.block_building = block_building;
        self
    }

    /// Check the configuration for values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_recompute_iterations == 0 {
            return Err(ConfigError::ZeroRecomputeIterations);
        }
        if self.revolt.timeout.is_zero() {
            return Err(ConfigError::InvalidRevolt("timeout must be positive".into()));
        }
        if self.revolt.exponential_delay_max < self.revolt.exponential_delay_base {
            return Err(ConfigError::InvalidRevolt(
                "exponential_delay_max is below exponential_delay_base".into(),
            ));
        }
        let bb = &self.block_building;
        if bb.max_block_transactions == 0 {
            return Err(ConfigError::InvalidBlockBuilding(
                "max_block_transactions must be positive".into(),
            ));
        }
        if bb.max_backoff_time < bb.min_backoff_time {
            return Err(ConfigError::InvalidBlockBuilding(
                "max_backoff_time is below min_backoff_time".into(),
            ));
        }
        Ok(())
    }
}
