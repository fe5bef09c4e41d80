//! Scheduler module: admits monitoring jobs and supervises their lifecycle.

mod job;
mod report;
mod retention;
mod sampler;
mod watcher;

pub use job::*;
pub use report::*;
pub use retention::*;
pub use sampler::*;

#[cfg(test)]
pub(crate) use sampler::testing;

use crate::db::{PurgeSummary, Store, StoreError};
use crate::probe::Prober;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("maximum number of concurrent jobs reached ({limit})")]
    CapacityExceeded { limit: usize },
    #[error("duration must be positive and at most {max_hours} hours")]
    InvalidDuration { max_hours: u64 },
    #[error("target must not be empty")]
    InvalidTarget,
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// Admission and supervision limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub max_duration: Duration,
    /// Cadence of watcher progress updates.
    pub watch_interval: Duration,
    pub sampler: SamplerSettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            max_duration: Duration::from_secs(24 * 3600),
            watch_interval: Duration::from_secs(5),
            sampler: SamplerSettings::default(),
        }
    }
}

/// Result of a retention cleanup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupSummary {
    pub jobs_removed: usize,
    pub store: PurgeSummary,
}

/// Runs monitoring jobs under a concurrency ceiling.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: SharedRegistry,
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, registry: SharedRegistry, store: Arc<Store>, prober: Arc<dyn Prober>) -> Self {
        Self {
            config,
            registry,
            store,
            prober,
        }
    }

    fn max_hours(&self) -> u64 {
        self.config.max_duration.as_secs() / 3600
    }

    /// Start a job probing `target` for `duration_hours`.
    pub async fn create_job(&self, target: &str, duration_hours: i64) -> Result<String, SchedulerError> {
        let hours = u64::try_from(duration_hours).unwrap_or(0);
        if hours == 0 || hours > self.max_hours() {
            return Err(SchedulerError::InvalidDuration {
                max_hours: self.max_hours(),
            });
        }
        self.create_job_with_duration(target, Duration::from_secs(hours * 3600))
            .await
    }

    /// Start a job with an arbitrary duration, bounded like `create_job`.
    pub async fn create_job_with_duration(&self, target: &str, duration: Duration) -> Result<String, SchedulerError> {
        if duration.is_zero() || duration > self.config.max_duration {
            return Err(SchedulerError::InvalidDuration {
                max_hours: self.max_hours(),
            });
        }
        let target = target.trim();
        if target.is_empty() {
            return Err(SchedulerError::InvalidTarget);
        }

        let now = Utc::now();
        let job_id = self.claim_job_id(target, now, JobRegistry::fresh_id).await?;

        let admitted = {
            let mut reg = self.registry.lock().await;
            if reg.active_count() >= self.config.max_concurrent_jobs {
                None
            } else {
                let sampler = Arc::new(Sampler::new(
                    &job_id,
                    target,
                    duration,
                    self.config.sampler.clone(),
                    self.store.clone(),
                    self.prober.clone(),
                ));
                reg.insert(Job::new(job_id.clone(), target.to_string(), duration, now), sampler.clone());
                Some(sampler)
            }
        };

        let Some(sampler) = admitted else {
            if let Err(e) = self.store.release_job(&job_id) {
                tracing::warn!("Scheduler: failed to release id {}: {}", job_id, e);
            }
            return Err(SchedulerError::CapacityExceeded {
                limit: self.config.max_concurrent_jobs,
            });
        };

        sampler.start();
        tokio::spawn(watcher::watch_job(
            self.registry.clone(),
            sampler,
            duration,
            self.config.watch_interval,
        ));

        tracing::info!("Scheduler: started job {} against {} for {:?}", job_id, target, duration);
        Ok(job_id)
    }

    /// Pick an id unused both in memory and in the manifest, and claim it
    /// in the manifest.
    async fn claim_job_id(
        &self,
        target: &str,
        now: DateTime<Utc>,
        mut next_id: impl FnMut(&JobRegistry) -> String,
    ) -> Result<String, SchedulerError> {
        loop {
            let candidate = next_id(&*self.registry.lock().await);
            if self.store.register_job(&candidate, target, now)? {
                return Ok(candidate);
            }
            tracing::debug!("Scheduler: id {} already persisted, drawing another", candidate);
        }
    }

    /// Stop an active job. Returns false if the job is unknown or already
    /// finished.
    pub async fn stop_job(&self, job_id: &str) -> bool {
        let sampler = self.registry.lock().await.stop(job_id, Utc::now());

        match sampler {
            Some(sampler) => {
                sampler.stop().await;
                tracing::info!("Scheduler: stopped job {}", job_id);
                true
            }
            None => false,
        }
    }

    pub async fn get_status(&self, job_id: &str) -> Option<Job> {
        self.registry.lock().await.get(job_id).cloned()
    }

    /// Every known job, most recently started first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        self.registry.lock().await.list()
    }

    pub async fn active_count(&self) -> usize {
        self.registry.lock().await.active_count()
    }

    /// Forget finished jobs that ended more than `days` ago and purge
    /// persisted data older than the same cutoff.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<CleanupSummary, SchedulerError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));

        let (removed, active) = {
            let mut reg = self.registry.lock().await;
            (reg.purge_ended_before(cutoff), reg.active_ids())
        };
        let store = self.store.purge_older_than(cutoff, &active)?;

        tracing::info!(
            "Scheduler: cleanup older than {} days removed {} jobs, {} stored series",
            days,
            removed.len(),
            store.jobs
        );
        Ok(CleanupSummary {
            jobs_removed: removed.len(),
            store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::sampler::testing::{ScriptedProber, Step};
    use super::*;
    use crate::probe::ProbeError;
    use tempfile::TempDir;
    use tokio::task::JoinSet;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        _dir: TempDir,
        registry: SharedRegistry,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture(max_concurrent_jobs: usize, prober: Arc<ScriptedProber>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("test.db"), dir.path().join("exports")).unwrap());
        let registry = JobRegistry::new().shared();
        let config = SchedulerConfig {
            max_concurrent_jobs,
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(Scheduler::new(config, registry.clone(), store.clone(), prober));
        Fixture {
            _dir: dir,
            registry,
            store,
            scheduler,
        }
    }

    fn running_count(jobs: &[Job]) -> usize {
        jobs.iter().filter(|j| j.status == JobStatus::Running).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_ceiling() {
        let f = fixture(2, ScriptedProber::steady());

        let first = assert_ok!(f.scheduler.create_job("10.0.0.1", 1).await);
        assert_ok!(f.scheduler.create_job("10.0.0.2", 1).await);

        let third = f.scheduler.create_job("10.0.0.3", 1).await;
        assert!(matches!(third, Err(SchedulerError::CapacityExceeded { limit: 2 })));
        assert_eq!(running_count(&f.scheduler.list_jobs().await), 2);

        assert!(f.scheduler.stop_job(&first).await);
        assert_ok!(f.scheduler.create_job("10.0.0.3", 1).await);
        assert_eq!(f.scheduler.active_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admission_never_oversubscribes() {
        let f = fixture(5, ScriptedProber::steady());

        let mut attempts = JoinSet::new();
        for i in 0..12 {
            let scheduler = f.scheduler.clone();
            attempts.spawn(async move { scheduler.create_job(&format!("10.0.0.{}", i), 1).await });
        }

        let mut admitted = 0;
        let mut refused = 0;
        while let Some(result) = attempts.join_next().await {
            match result.unwrap() {
                Ok(_) => admitted += 1,
                Err(SchedulerError::CapacityExceeded { .. }) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(refused, 7);
        assert_eq!(running_count(&f.scheduler.list_jobs().await), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_bound() {
        let f = fixture(5, ScriptedProber::steady());

        let too_long = f.scheduler.create_job("10.0.0.1", 25).await;
        assert!(matches!(too_long, Err(SchedulerError::InvalidDuration { max_hours: 24 })));
        assert_err!(f.scheduler.create_job("10.0.0.1", 0).await);
        assert_err!(f.scheduler.create_job("10.0.0.1", -3).await);
        assert_ok!(f.scheduler.create_job("10.0.0.1", 24).await);

        assert_eq!(f.scheduler.list_jobs().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_target_rejected() {
        let f = fixture(5, ScriptedProber::steady());
        let result = f.scheduler.create_job("   ", 1).await;
        assert!(matches!(result, Err(SchedulerError::InvalidTarget)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic_and_completes_at_100() {
        let f = fixture(5, ScriptedProber::steady());
        let id = f
            .scheduler
            .create_job_with_duration("10.0.0.1", Duration::from_secs(60))
            .await
            .unwrap();

        let mut last = 0.0;
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let job = f.scheduler.get_status(&id).await.unwrap();
            assert!(job.progress >= last, "progress went from {} to {}", last, job.progress);
            assert!(job.progress <= 100.0);
            last = job.progress;
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        let job = f.scheduler.get_status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.ended_at.is_some());
        assert_eq!(f.scheduler.active_count().await, 0);
        assert_eq!(f.store.load_report(&id).unwrap().total_samples, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_updates_while_running() {
        let f = fixture(5, ScriptedProber::steady());
        let id = f
            .scheduler
            .create_job_with_duration("10.0.0.1", Duration::from_secs(100))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25_500)).await;
        let job = f.scheduler.get_status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 25.0);
        assert_eq!(job.elapsed, "0:00:25");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_preempts_completion() {
        let f = fixture(5, ScriptedProber::steady());
        let id = f
            .scheduler
            .create_job_with_duration("10.0.0.1", Duration::from_secs(30))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(f.scheduler.stop_job(&id).await);
        assert!(!f.scheduler.stop_job(&id).await);

        let stopped = f.scheduler.get_status(&id).await.unwrap();
        assert_eq!(stopped.status, JobStatus::Stopped);
        assert!(stopped.ended_at.is_some());

        // Past the deadline the watcher must not overwrite the stop.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let job = f.scheduler.get_status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Stopped);
        assert_eq!(job.ended_at, stopped.ended_at);
        assert_eq!(f.scheduler.active_count().await, 0);
        assert!(!f.scheduler.stop_job(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_job() {
        let f = fixture(5, ScriptedProber::steady());
        assert!(f.scheduler.get_status("deadbeef").await.is_none());
        assert!(!f.scheduler.stop_job("deadbeef").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_jobs_newest_first() {
        let f = fixture(5, ScriptedProber::steady());
        let mut ids = Vec::new();
        for host in ["a.example", "b.example", "c.example"] {
            ids.push(f.scheduler.create_job(host, 1).await.unwrap());
            std::thread::sleep(Duration::from_millis(2));
        }
        f.scheduler.stop_job(&ids[1]).await;

        let listed: Vec<String> = f.scheduler.list_jobs().await.into_iter().map(|j| j.id).collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_report() {
        let ms = Duration::from_millis;
        let prober = ScriptedProber::new(vec![
            Step::Reply(ms(10)),
            Step::Reply(ms(12)),
            Step::Fail(ProbeError::Timeout(Duration::from_secs(2))),
            Step::Reply(ms(11)),
            Step::Reply(ms(13)),
            Step::Fail(ProbeError::Command("ping failed".to_string())),
            Step::Reply(ms(9)),
            Step::Fail(ProbeError::Timeout(Duration::from_secs(2))),
            Step::Reply(ms(14)),
            Step::Reply(ms(10)),
        ]);
        let f = fixture(5, prober.clone());
        let id = f
            .scheduler
            .create_job_with_duration("10.0.0.1", Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(prober.calls(), 10);

        let report = f.store.load_report(&id).unwrap();
        assert_eq!(report.total_samples, 10);
        assert_eq!(report.successful, 7);
        assert_eq!(report.timeouts, 2);
        assert_eq!(report.errors, 1);
        assert!((report.avg_latency_ms.unwrap() - 11.29).abs() < 0.01);
        assert!((report.min_latency_ms.unwrap() - 9.0).abs() < 1e-9);
        assert!((report.max_latency_ms.unwrap() - 14.0).abs() < 1e-9);
        assert!((report.availability - 70.0).abs() < 1e-9);

        let known = f.store.list_known_jobs().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].job_id, id);
        assert_eq!(known[0].target, "10.0.0.1");
        assert_eq!(known[0].sample_count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_leaves_running_series_intact() {
        let f = fixture(5, ScriptedProber::steady());
        let id = f
            .scheduler
            .create_job_with_duration("10.0.0.1", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(25_500)).await;
        assert_eq!(f.store.load_samples(&id).unwrap().len(), 20);

        let summary = f.scheduler.cleanup_older_than(0).await.unwrap();
        assert_eq!(summary.store.jobs, 0);
        assert_eq!(summary.store.samples, 0);
        assert_eq!(f.store.load_samples(&id).unwrap().len(), 20);

        tokio::time::sleep(Duration::from_secs(40)).await;
        let job = f.scheduler.get_status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(f.store.load_report(&id).unwrap().total_samples, 60);

        let known = f.store.list_known_jobs().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].started_at, job.started_at);

        // Finished now, so the same window removes it.
        let summary = f.scheduler.cleanup_older_than(0).await.unwrap();
        assert_eq!(summary.store.jobs, 1);
        assert_eq!(summary.store.samples, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_id_skips_persisted_series() {
        let f = fixture(5, ScriptedProber::steady());
        let then = Utc::now() - ChronoDuration::days(2);
        f.store.register_job("aaaa0000", "10.0.0.9", then).unwrap();
        f.store
            .append_samples("aaaa0000", &[crate::db::Sample::success(then, "10.0.0.9", 3.0)])
            .unwrap();

        let mut candidates = vec!["bbbb0000".to_string(), "aaaa0000".to_string()];
        let id = f
            .scheduler
            .claim_job_id("10.0.0.1", Utc::now(), |_| candidates.pop().unwrap())
            .await
            .unwrap();
        assert_eq!(id, "bbbb0000");

        let old = f.store.load_samples("aaaa0000").unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].target, "10.0.0.9");
        let targets: Vec<String> = f.store.list_known_jobs().unwrap().into_iter().map(|k| k.target).collect();
        assert_eq!(targets, vec!["10.0.0.9".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_admission_releases_claimed_id() {
        let f = fixture(1, ScriptedProber::steady());
        let first = f.scheduler.create_job("10.0.0.1", 1).await.unwrap();

        let rejected = f.scheduler.create_job("10.0.0.2", 1).await;
        assert!(matches!(rejected, Err(SchedulerError::CapacityExceeded { .. })));

        // Only the admitted job still owns a manifest row.
        let purged = f
            .store
            .purge_older_than(Utc::now() + ChronoDuration::minutes(1), &[first])
            .unwrap();
        assert_eq!(purged.jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_retention_window() {
        let f = fixture(5, ScriptedProber::steady());
        let now = Utc::now();

        for (id, days) in [("stale001", 31), ("fresh001", 29)] {
            let ended = now - ChronoDuration::days(days);
            let mut job = Job::new(
                id.to_string(),
                "10.0.0.1".to_string(),
                Duration::from_secs(3600),
                ended - ChronoDuration::hours(1),
            );
            job.complete(ended);
            f.registry.lock().await.insert_record(job);

            f.store.register_job(id, "10.0.0.1", ended - ChronoDuration::hours(1)).unwrap();
            f.store.append_samples(id, &[crate::db::Sample::success(ended, "10.0.0.1", 4.0)]).unwrap();
            f.store.set_last_modified(id, ended).unwrap();
        }

        let summary = f.scheduler.cleanup_older_than(30).await.unwrap();
        assert_eq!(summary.jobs_removed, 1);
        assert_eq!(summary.store.jobs, 1);

        let listed: Vec<String> = f.scheduler.list_jobs().await.into_iter().map(|j| j.id).collect();
        assert_eq!(listed, vec!["fresh001".to_string()]);

        let known: Vec<String> = f.store.list_known_jobs().unwrap().into_iter().map(|k| k.job_id).collect();
        assert_eq!(known, vec!["fresh001".to_string()]);
    }
}
