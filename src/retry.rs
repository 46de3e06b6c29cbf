//! Backoff delays for remote and local API calls
//!
//! Engines own their retry loops (a requeued event or a watch reconnect
//! must be cancellable by a stop), so they only take delays from a
//! [`Backoff`]. One-shot calls outside an engine, like loading the
//! credentials secret for a Link event, go through [`retry_with_backoff`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Delay policy: exponential growth from `initial_delay` up to `max_delay`
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempts before giving up; 0 never gives up
    pub max_attempts: u32,
    /// First delay
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default delays, giving up after `attempts` calls
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Constant 1ms delays, for tests
    pub fn immediate() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        }
    }
}

/// Jittered delay sequence for one retry loop
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
}

impl Backoff {
    /// Start at the initial delay
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            current: config.initial_delay,
        }
    }

    /// Next delay, jittered to 0.5x-1.5x and capped at `max_delay`
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter)
            .min(self.config.max_delay);

        let grown = self.current.as_secs_f64() * self.config.backoff_multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.config.max_delay.as_secs_f64()));

        delay
    }

    /// Back to the initial delay, after a success
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

/// Call `call` until it succeeds or `config.max_attempts` calls have failed.
///
/// Returns the last error once attempts run out. `what` names the call in logs.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    what: &str,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config);
    let mut failures = 0u32;

    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        failures += 1;

        if config.max_attempts > 0 && failures >= config.max_attempts {
            error!(call = %what, failures, error = %err, "giving up");
            return Err(err);
        }

        let delay = backoff.next_delay();
        warn!(
            call = %what,
            failures,
            error = %err,
            delay_ms = delay.as_millis(),
            "call failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
