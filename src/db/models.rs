//! Persisted data types: samples, reports and the job manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome classification of a single probe, as stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Success,
    Timeout,
    Error,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Success => "success",
            SampleStatus::Timeout => "timeout",
            SampleStatus::Error => "error",
        }
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SampleStatus::Success),
            "timeout" => Ok(SampleStatus::Timeout),
            "error" => Ok(SampleStatus::Error),
            other => Err(format!("unknown sample status: {}", other)),
        }
    }
}

/// What a probe observed. Only a successful probe carries a latency.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { latency_ms: f64 },
    Timeout,
    Error { message: String },
}

/// A single probe observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "SampleRecord")]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub outcome: Outcome,
}

impl Sample {
    /// Build a successful sample. Negative latencies are clamped to zero.
    pub fn success(timestamp: DateTime<Utc>, target: &str, latency_ms: f64) -> Self {
        Self {
            timestamp,
            target: target.to_string(),
            outcome: Outcome::Success {
                latency_ms: latency_ms.max(0.0),
            },
        }
    }

    pub fn timeout(timestamp: DateTime<Utc>, target: &str) -> Self {
        Self {
            timestamp,
            target: target.to_string(),
            outcome: Outcome::Timeout,
        }
    }

    pub fn error(timestamp: DateTime<Utc>, target: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            target: target.to_string(),
            outcome: Outcome::Error {
                message: message.into(),
            },
        }
    }

    pub fn status(&self) -> SampleStatus {
        match self.outcome {
            Outcome::Success { .. } => SampleStatus::Success,
            Outcome::Timeout => SampleStatus::Timeout,
            Outcome::Error { .. } => SampleStatus::Error,
        }
    }

    /// Round-trip latency in milliseconds; `None` unless the probe succeeded.
    pub fn response_time(&self) -> Option<f64> {
        match self.outcome {
            Outcome::Success { latency_ms } => Some(latency_ms),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Error { message } => Some(message),
            _ => None,
        }
    }
}

/// Flat row shape of a sample, matching the persisted columns.
#[derive(Debug, Clone, Serialize)]
pub struct SampleRecord {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub response_time: Option<f64>,
    pub status: SampleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Sample> for SampleRecord {
    fn from(sample: Sample) -> Self {
        let status = sample.status();
        let response_time = sample.response_time();
        let error = match sample.outcome {
            Outcome::Error { message } => Some(message),
            _ => None,
        };
        Self {
            timestamp: sample.timestamp,
            target: sample.target,
            response_time,
            status,
            error,
        }
    }
}

/// Summary statistics over a job's full sample series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub total_samples: u64,
    pub successful: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    /// Percentage of samples that succeeded.
    pub availability: f64,
}

/// A persisted sample series discovered through the manifest.
#[derive(Debug, Clone, Serialize)]
pub struct KnownJob {
    pub job_id: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub sample_count: i64,
    pub size_bytes: i64,
}

/// What a retention purge removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PurgeSummary {
    pub jobs: usize,
    pub samples: usize,
    pub reports: usize,
    pub artifacts: usize,
}
