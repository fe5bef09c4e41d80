//! Job records and the lock-guarded registry that owns them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::sampler::Sampler;

/// Lifecycle state of a job. Only `Running` may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// Snapshot of one monitoring run.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub target: String,
    pub duration_secs: u64,
    pub duration_hours: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub progress: f64,
    pub elapsed: String,
}

impl Job {
    pub fn new(id: String, target: String, duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id,
            target,
            duration_secs: duration.as_secs(),
            duration_hours: duration.as_secs_f64() / 3600.0,
            created_at: now,
            started_at: now,
            ended_at: None,
            status: JobStatus::Running,
            progress: 0.0,
            elapsed: format_elapsed(Duration::ZERO),
        }
    }

    /// Record watcher progress. Ignored once terminal; never moves backwards.
    pub fn record_progress(&mut self, progress: f64, elapsed: Duration) {
        if self.status.is_terminal() {
            return;
        }
        if progress > self.progress {
            self.progress = progress;
        }
        self.elapsed = format_elapsed(elapsed);
    }

    /// `Running -> Completed`. Returns false for any other transition.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = JobStatus::Completed;
        self.ended_at = Some(now);
        self.progress = 100.0;
        true
    }

    /// `Running -> Stopped`. Progress stays where the watcher left it.
    pub fn stop(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = JobStatus::Stopped;
        self.ended_at = Some(now);
        true
    }
}

/// Progress percentage rounded to two decimals, capped at 100.
pub fn compute_progress(elapsed: Duration, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 100.0;
    }
    let pct = (elapsed.as_secs_f64() / duration.as_secs_f64() * 100.0).min(100.0);
    (pct * 100.0).round() / 100.0
}

/// `H:MM:SS`, truncated to whole seconds.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Registry shared by the scheduler and its watchers.
pub type SharedRegistry = Arc<Mutex<JobRegistry>>;

/// Every job record known to this process plus the samplers still running.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Job>,
    active: HashMap<String, Arc<Sampler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// An 8-character id not yet used in this registry.
    pub fn fresh_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            if !self.jobs.contains_key(&id) {
                return id;
            }
        }
    }

    /// Ids of jobs whose sampler is still running.
    pub fn active_ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn insert(&mut self, job: Job, sampler: Arc<Sampler>) {
        self.active.insert(job.id.clone(), sampler);
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// All jobs, most recently started first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Mark an active job stopped and hand back its sampler.
    pub fn stop(&mut self, id: &str, now: DateTime<Utc>) -> Option<Arc<Sampler>> {
        let sampler = self.active.remove(id)?;
        if let Some(job) = self.jobs.get_mut(id) {
            job.stop(now);
        }
        Some(sampler)
    }

    /// Leave the active set; completes the job unless it was already stopped.
    pub fn finish(&mut self, id: &str, now: DateTime<Utc>) -> Option<JobStatus> {
        self.active.remove(id);
        let job = self.jobs.get_mut(id)?;
        job.complete(now);
        Some(job.status)
    }

    /// Drop terminal jobs that ended before `cutoff`; returns their ids.
    pub fn purge_ended_before(&mut self, cutoff: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .jobs
            .values()
            .filter(|job| job.status.is_terminal() && job.ended_at.map_or(false, |t| t < cutoff))
            .map(|job| job.id.clone())
            .collect();
        for id in &stale {
            self.jobs.remove(id);
        }
        stale
    }

    #[cfg(test)]
    pub(crate) fn insert_record(&mut self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }
}
