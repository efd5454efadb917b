use config_manager::AggregationConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::job_store::{AggregationJobStore, Finalization};
use crate::{JobFinalizer, Result};

/// Periodically forces jobs past their deadline into a terminal state
pub struct TimeoutMonitor {
    store: Arc<dyn AggregationJobStore>,
    finalizer: Arc<JobFinalizer>,
    job_timeout: Duration,
    scan_interval: Duration,
    retention: Duration,
}

impl TimeoutMonitor {
    pub fn new(
        store: Arc<dyn AggregationJobStore>,
        finalizer: Arc<JobFinalizer>,
        job_timeout: Duration,
        scan_interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            finalizer,
            job_timeout,
            scan_interval,
            retention,
        }
    }

    pub fn from_config(
        store: Arc<dyn AggregationJobStore>,
        finalizer: Arc<JobFinalizer>,
        config: &AggregationConfig,
    ) -> Self {
        Self::new(
            store,
            finalizer,
            Duration::from_secs(config.job_timeout_seconds),
            Duration::from_secs(config.timeout_scan_interval_seconds),
            Duration::from_secs(config.job_retention_seconds),
        )
    }

    /// One pass: time out overdue jobs and drop expired terminal ones.
    /// Returns how many jobs this pass forced terminal.
    pub async fn sweep(&self) -> Result<usize> {
        let overdue = self.store.list_open_jobs_older_than(self.job_timeout).await?;
        let mut forced = 0;

        for job_id in overdue {
            // A job that completed naturally since the listing is skipped here
            let Some(snapshot) = self.store.try_mark_final(job_id, Finalization::Deadline).await? else {
                continue;
            };
            forced += 1;
            warn!(
                "Job {} hit its {}s deadline: {:?}, timed out providers {:?}",
                job_id,
                self.job_timeout.as_secs(),
                snapshot.status,
                snapshot.timed_out_providers()
            );
            if let Err(e) = self.finalizer.finalize(&snapshot).await {
                error!("Finalizing timed out job {} failed: {}", job_id, e);
            }
        }

        // Final jobs whose completion event never made it onto the bus
        for job_id in self.store.list_unpublished_final_jobs().await? {
            if let Err(e) = self.finalizer.resume(job_id).await {
                error!("Retrying completion of job {} failed: {}", job_id, e);
            }
        }

        let purged = self.store.purge_terminal_older_than(self.retention).await?;
        if forced > 0 || purged > 0 {
            debug!("Timeout sweep: {} forced, {} purged", forced, purged);
        }
        Ok(forced)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Timeout monitor started (timeout {}s, every {}s)",
            self.job_timeout.as_secs(),
            self.scan_interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Timeout sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Timeout monitor stopped");
    }
}
