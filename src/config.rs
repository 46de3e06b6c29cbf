//! Engine configuration
//!
//! Values come from the command line once at startup and are passed into
//! every engine the supervisor constructs. Engines never re-read them.

use std::time::Duration;

use crate::retry::RetryConfig;

/// Default number of retries for a failing event before it is abandoned
pub const DEFAULT_REQUEUE_LIMIT: u32 = 3;

/// Default period of the endpoint repair pass
pub const DEFAULT_REPAIR_PERIOD: Duration = Duration::from_secs(60);

/// Settings shared by every engine of the process
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Retries per failing event before it is abandoned
    pub requeue_limit: u32,
    /// Period of the endpoint repair pass
    pub repair_period: Duration,
    /// Delay sequence between retries of one event
    pub requeue_backoff: RetryConfig,
    /// Delay sequence between attempts to re-establish the remote watch
    pub reconnect_backoff: RetryConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            requeue_limit: DEFAULT_REQUEUE_LIMIT,
            repair_period: DEFAULT_REPAIR_PERIOD,
            requeue_backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
            reconnect_backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
        }
    }
}

impl EngineSettings {
    /// Settings with the given requeue limit and repair period, default backoff
    pub fn new(requeue_limit: u32, repair_period: Duration) -> Self {
        Self {
            requeue_limit,
            repair_period,
            ..Default::default()
        }
    }
}
