//! Per-job sampling loop.
//!
//! A [`Sampler`] probes one target at a fixed cadence until its deadline or
//! until it is stopped, appends samples to the store in batches and writes
//! the job report once the loop has exited.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::report::build_report;
use crate::db::{Sample, Store, StoreError};
use crate::probe::{ProbeError, Prober};

/// Timing and batching knobs for a sampling loop.
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    /// Pause between probes.
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Samples buffered before an append to the store.
    pub batch_size: usize,
    /// How long `stop` waits for the loop to exit.
    pub stop_timeout: Duration,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            batch_size: 10,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Sampler {
    job_id: String,
    target: String,
    duration: Duration,
    settings: SamplerSettings,
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    started: AtomicBool,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    done: Arc<watch::Sender<bool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sampler {
    pub fn new(
        job_id: &str,
        target: &str,
        duration: Duration,
        settings: SamplerSettings,
        store: Arc<Store>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            job_id: job_id.to_string(),
            target: target.to_string(),
            duration,
            settings,
            store,
            prober,
            started: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            done: Arc::new(done),
            handle: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Spawn the sampling loop. Calling it again has no effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let worker = SamplingLoop {
            job_id: self.job_id.clone(),
            target: self.target.clone(),
            deadline: Instant::now() + self.duration,
            settings: self.settings.clone(),
            store: self.store.clone(),
            prober: self.prober.clone(),
            running: self.running.clone(),
            wake: self.wake.clone(),
            done: self.done.clone(),
        };

        let handle = tokio::spawn(worker.run());
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Ask the loop to exit and wait, bounded by `stop_timeout`, for it to
    /// finish its final flush and report. Returns false if the wait timed
    /// out; the loop is left to finish on its own.
    pub async fn stop(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();

        if !self.started.load(Ordering::SeqCst) {
            return true;
        }

        let exited = tokio::time::timeout(self.settings.stop_timeout, self.exited()).await;
        if exited.is_err() {
            tracing::warn!(
                "Sampler {}: loop did not exit within {:?}, detaching",
                self.job_id,
                self.settings.stop_timeout
            );
            return false;
        }

        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Sampler {}: loop task failed: {}", self.job_id, e);
            }
        }
        true
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolve once the loop has exited and the report step is over.
    pub async fn exited(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|exited| *exited).await;
    }
}

/// State moved into the spawned loop task.
struct SamplingLoop {
    job_id: String,
    target: String,
    deadline: Instant,
    settings: SamplerSettings,
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    done: Arc<watch::Sender<bool>>,
}

impl SamplingLoop {
    async fn run(self) {
        tracing::info!("Sampler {}: probing {}", self.job_id, self.target);

        let mut buffer: Vec<Sample> = Vec::with_capacity(self.settings.batch_size);

        while self.running.load(Ordering::SeqCst) && Instant::now() < self.deadline {
            buffer.push(self.sample_once().await);
            if buffer.len() >= self.settings.batch_size {
                self.flush(&mut buffer);
            }

            let next = (Instant::now() + self.settings.interval).min(self.deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.flush(&mut buffer);
        self.write_report();
        self.done.send_replace(true);

        tracing::info!("Sampler {}: finished", self.job_id);
    }

    async fn sample_once(&self) -> Sample {
        let timestamp = Utc::now();
        let timeout = self.settings.probe_timeout;
        let result = tokio::time::timeout(timeout, self.prober.probe(&self.target, timeout)).await;

        match result {
            Ok(Ok(latency)) => Sample::success(timestamp, &self.target, latency.as_secs_f64() * 1000.0),
            Ok(Err(ProbeError::Timeout(_))) | Err(_) => Sample::timeout(timestamp, &self.target),
            Ok(Err(e)) => Sample::error(timestamp, &self.target, e.to_string()),
        }
    }

    /// Append the buffer to the store. A failed append drops the batch.
    fn flush(&self, buffer: &mut Vec<Sample>) {
        if buffer.is_empty() {
            return;
        }

        match self.store.append_samples(&self.job_id, buffer) {
            Ok(()) => tracing::debug!("Sampler {}: flushed {} samples", self.job_id, buffer.len()),
            Err(e) => tracing::error!(
                "Sampler {}: failed to flush {} samples: {}",
                self.job_id,
                buffer.len(),
                e
            ),
        }
        buffer.clear();
    }

    fn write_report(&self) {
        let samples = match self.store.load_samples(&self.job_id) {
            Ok(samples) => samples,
            Err(StoreError::NotFound) => {
                tracing::info!("Sampler {}: no samples recorded, skipping report", self.job_id);
                return;
            }
            Err(e) => {
                tracing::error!("Sampler {}: failed to load samples for report: {}", self.job_id, e);
                return;
            }
        };

        let Some(report) = build_report(&samples) else {
            return;
        };
        match self.store.save_report(&self.job_id, &report) {
            Ok(()) => tracing::info!(
                "Sampler {}: report saved ({} samples, {:.2}% available)",
                self.job_id,
                report.total_samples,
                report.availability
            ),
            Err(e) => tracing::error!("Sampler {}: failed to save report: {}", self.job_id, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Prober that answers from a script, then with a fixed latency.
    pub struct ScriptedProber {
        script: Mutex<Vec<Step>>,
        calls: AtomicUsize,
    }

    pub enum Step {
        Reply(Duration),
        Fail(ProbeError),
        Hang(Duration),
    }

    impl ScriptedProber {
        pub fn new(mut script: Vec<Step>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn steady() -> Arc<Self> {
            Self::new(Vec::new())
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _target: &str, _timeout: Duration) -> Result<Duration, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop();
            match step {
                Some(Step::Reply(d)) => Ok(d),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Hang(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(Duration::from_millis(1))
                }
                None => Ok(Duration::from_millis(5)),
            }
        }
    }
}
