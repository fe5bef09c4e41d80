//! Supervisory task that tracks one job's progress and deadline.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::job::{compute_progress, SharedRegistry};
use super::sampler::Sampler;

/// Publish progress every `tick` until the sampler exits or the deadline
/// passes, then move the job to its terminal state.
pub(super) async fn watch_job(registry: SharedRegistry, sampler: Arc<Sampler>, duration: Duration, tick: Duration) {
    let job_id = sampler.job_id().to_string();
    let started = Instant::now();
    let deadline = started + duration;

    let mut ticker = tokio::time::interval_at(started + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sampler.exited() => break,
            _ = tokio::time::sleep_until(deadline) => {
                if !sampler.stop().await {
                    tracing::warn!("Watcher {}: sampler still running past its deadline", job_id);
                }
                break;
            }
            _ = ticker.tick() => {
                let elapsed = started.elapsed();
                let progress = compute_progress(elapsed, duration);
                let mut reg = registry.lock().await;
                if let Some(job) = reg.get_mut(&job_id) {
                    job.record_progress(progress, elapsed);
                }
            }
        }
    }

    let status = registry.lock().await.finish(&job_id, Utc::now());
    tracing::info!("Watcher {}: job ended with status {:?}", job_id, status);
}
