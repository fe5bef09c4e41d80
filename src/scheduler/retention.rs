//! Periodic retention sweeps over job records and persisted series.

use super::Scheduler;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Runs `Scheduler::cleanup_older_than` on a fixed cadence.
pub struct RetentionManager {
    scheduler: Arc<Scheduler>,
    retention_days: u32,
    interval: Duration,
    stop: broadcast::Sender<()>,
}

impl RetentionManager {
    pub fn new(scheduler: Arc<Scheduler>, retention_days: u32, interval: Duration) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            scheduler,
            retention_days,
            interval,
            stop,
        }
    }

    /// Run a single sweep with an explicit window. Failures are logged.
    pub async fn sweep(scheduler: &Scheduler, days: u32) {
        match scheduler.cleanup_older_than(days).await {
            Ok(summary) => {
                if summary.jobs_removed > 0 || summary.store.jobs > 0 || summary.store.artifacts > 0 {
                    tracing::info!(
                        "RetentionManager: removed {} job records, {} series, {} export files",
                        summary.jobs_removed,
                        summary.store.jobs,
                        summary.store.artifacts
                    );
                }
            }
            Err(e) => tracing::error!("RetentionManager: cleanup failed: {}", e),
        }
    }

    /// Start the background task. The first sweep happens one interval
    /// from now.
    pub fn start(&self) {
        let scheduler = self.scheduler.clone();
        let days = self.retention_days;
        let period = self.interval;
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => Self::sweep(&scheduler, days).await,
                }
            }
            tracing::debug!("RetentionManager: stopped");
        });
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}
