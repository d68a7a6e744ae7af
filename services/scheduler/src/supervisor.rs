//! Outer loop that keeps a subscription open.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::connection::{ConnectionError, ConnectionManager, SessionEnd};

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(0.0..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter) as u64)
    }
}

/// Restarts sessions on a fixed tick, backing off while they fail.
pub struct Supervisor {
    manager: Arc<ConnectionManager>,
    interval: Duration,
    backoff: BackoffPolicy,
}

impl Supervisor {
    pub fn new(manager: Arc<ConnectionManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            "Starting subscription supervisor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.manager.run_session(shutdown.clone()).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(end) => {
                    debug!(reason = ?end, "Resubscribing");
                    failures = 0;
                    None
                }
                Err(ConnectionError::SessionActive) => None,
                Err(e) => {
                    let delay = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Subscription attempt failed"
                    );
                    Some(delay)
                }
            };

            if let Some(delay) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("Subscription supervisor shutting down");
    }
}
