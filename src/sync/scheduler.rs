//! Periodic sync cycles

use super::{FormSynchronizer, SyncMode};
use crate::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Why [`SyncScheduler::run`] returned
#[derive(Debug)]
pub enum SchedulerStop {
    /// Shutdown was requested, or the mode is manual
    Shutdown { cycles: usize },
    /// The server rejected the credentials; cycles stay paused until they change
    CredentialsRequired { cycles: usize, error: Error },
}

/// Runs [`FormSynchronizer::sync`] on a fixed interval
pub struct SyncScheduler {
    synchronizer: Arc<FormSynchronizer>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(synchronizer: Arc<FormSynchronizer>, interval: Duration) -> Self {
        Self {
            synchronizer,
            interval,
        }
    }

    /// Run cycles until `shutdown` flips to true or its sender is dropped.
    ///
    /// The first cycle starts immediately. A failed cycle is logged and the
    /// next tick tries again, except for authentication failures, which end
    /// the loop. Never runs a cycle in manual mode.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SchedulerStop {
        if self.synchronizer.mode() == SyncMode::Manual {
            tracing::info!("sync mode is manual; scheduler not started");
            return SchedulerStop::Shutdown { cycles: 0 };
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0;

        tracing::info!(
            mode = %self.synchronizer.mode(),
            interval_secs = self.interval.as_secs(),
            "sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cycles += 1;
                    match self.synchronizer.sync().await {
                        Ok(report) => {
                            if !report.failures.is_empty() {
                                tracing::warn!(cycle = cycles, failures = report.failures.len(), "sync cycle had failures");
                            }
                        }
                        Err(e) if e.requires_credentials() => {
                            tracing::warn!(cycle = cycles, error = %e, "sync paused until credentials change");
                            return SchedulerStop::CredentialsRequired { cycles, error: e };
                        }
                        Err(e) => {
                            tracing::warn!(cycle = cycles, error = %e, "sync cycle failed; retrying next interval");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(cycles, "sync scheduler stopped");
        SchedulerStop::Shutdown { cycles }
    }
}
