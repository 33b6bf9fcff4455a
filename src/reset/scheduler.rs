//! Background reset scheduling.
//!
//! Polls instead of sleeping until the first of the month: a poll-based
//! loop self-heals after downtime, because the first tick after a
//! restart performs any reset the process slept through.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::ResetRunner;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodically checks whether the monthly reset is due and runs it.
pub struct ResetScheduler {
    runner: Arc<ResetRunner>,
    check_interval: Duration,
}

impl ResetScheduler {
    pub fn new(runner: Arc<ResetRunner>) -> Self {
        Self {
            runner,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Override the polling interval. Mainly for tests.
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Spawn the polling loop. The first check runs immediately so a
    /// reset missed while the service was down happens at startup.
    pub fn spawn(self) -> SchedulerHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            info!(interval_secs = self.check_interval.as_secs(), "reset scheduler started");
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => {
                        info!("reset scheduler stopping");
                        break;
                    }
                    // The tick arm awaits the whole check, so
                    // cancellation never interrupts a reset mid-flight.
                    _ = interval.tick() => {
                        Self::check(&self.runner).await;
                    }
                }
            }
        });

        SchedulerHandle { token, handle }
    }

    async fn check(runner: &ResetRunner) {
        match runner.perform_reset().await {
            Ok(outcome) if outcome.performed => {
                info!(
                    users_affected = outcome.users_affected,
                    total_credits_granted = %outcome.total_credits_granted,
                    "scheduled monthly reset performed"
                );
            }
            Ok(_) => {
                debug!("monthly reset not due");
            }
            Err(err) => {
                // Leave the loop running; the next tick retries.
                error!(error = %err, "scheduled monthly reset failed");
            }
        }
    }
}

/// Controls a spawned scheduler loop.
pub struct SchedulerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request the loop to stop and wait for it to finish. An in-flight
    /// reset completes before this returns.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            error!(error = %err, "reset scheduler task panicked");
        }
    }
}
