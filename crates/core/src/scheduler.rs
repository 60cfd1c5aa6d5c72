//! Periodic live sweeps on a background task.
//!
//! The loop sleeps, sweeps, and repeats. Shutdown is only observed while
//! sleeping: a sweep that has started runs to completion. A failed sweep is
//! logged and the loop carries on to the next interval.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::service::InvalidationService;
use crate::sweep::SweepOptions;

/// Counters returned when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub sweeps_run: usize,
    pub sweeps_failed: usize,
}

pub struct SweepScheduler {
    service: InvalidationService,
    interval: Duration,
}

impl SweepScheduler {
    pub fn new(service: InvalidationService, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Scheduler using the service's configured sweep interval.
    pub fn from_service(service: InvalidationService) -> Self {
        let interval = service.config().sweep_interval;
        Self::new(service, interval)
    }

    /// Start the loop on the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> SchedulerReport {
        let mut report = SchedulerReport::default();
        info!(interval_secs = self.interval.as_secs_f64(), "sweep scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    // A dropped handle also stops the loop.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.service.run_sweep(&SweepOptions::live()).await {
                Ok(result) => {
                    report.sweeps_run += 1;
                    info!(
                        status = ?result.status,
                        facts_invalidated = result.facts_invalidated,
                        "scheduled sweep finished"
                    );
                }
                Err(e) => {
                    report.sweeps_failed += 1;
                    warn!(error = %e, "scheduled sweep failed; retrying next interval");
                }
            }
        }

        info!(
            sweeps_run = report.sweeps_run,
            sweeps_failed = report.sweeps_failed,
            "sweep scheduler stopped"
        );
        report
    }
}

/// Handle to a running [`SweepScheduler`].
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<SchedulerReport>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for it, including any in-flight sweep.
    pub async fn shutdown(self) -> Result<SchedulerReport> {
        // The receiver is gone only if the task already ended.
        let _ = self.shutdown_tx.send(true);
        Ok(self.task.await?)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
