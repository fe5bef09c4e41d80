//! Report aggregation over a sealed sample series.

use tdigests::TDigest;

use crate::db::{Report, Sample, SampleStatus};

/// Summarize a series. Returns `None` for an empty series.
///
/// Latency statistics cover successful samples only and are `None` when
/// there are none. Percentiles are t-digest estimates.
pub fn build_report(samples: &[Sample]) -> Option<Report> {
    if samples.is_empty() {
        return None;
    }

    let mut timeouts = 0u64;
    let mut errors = 0u64;
    let mut latencies: Vec<f64> = Vec::with_capacity(samples.len());

    for s in samples {
        match s.status() {
            SampleStatus::Success => latencies.extend(s.response_time()),
            SampleStatus::Timeout => timeouts += 1,
            SampleStatus::Error => errors += 1,
        }
    }

    let total = samples.len() as u64;
    let successful = latencies.len() as u64;

    let (avg, min, max) = if latencies.is_empty() {
        (None, None, None)
    } else {
        let sum: f64 = latencies.iter().sum();
        let min = latencies.iter().copied().fold(f64::INFINITY, f64::min);
        let max = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (Some(sum / successful as f64), Some(min), Some(max))
    };

    let (p50, p95, p99) = if latencies.is_empty() {
        (None, None, None)
    } else {
        let td = TDigest::from_values(latencies);
        (
            finite(td.estimate_quantile(0.50)),
            finite(td.estimate_quantile(0.95)),
            finite(td.estimate_quantile(0.99)),
        )
    };

    Some(Report {
        total_samples: total,
        successful,
        timeouts,
        errors,
        avg_latency_ms: avg,
        min_latency_ms: min,
        max_latency_ms: max,
        p50_latency_ms: p50,
        p95_latency_ms: p95,
        p99_latency_ms: p99,
        availability: successful as f64 / total as f64 * 100.0,
    })
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn synthetic_series() -> Vec<Sample> {
        let now = Utc::now();
        let mut samples: Vec<Sample> = [10.0, 12.0, 11.0, 13.0, 9.0, 14.0, 10.0]
            .into_iter()
            .map(|ms| Sample::success(now, "10.0.0.1", ms))
            .collect();
        samples.push(Sample::timeout(now, "10.0.0.1"));
        samples.push(Sample::timeout(now, "10.0.0.1"));
        samples.push(Sample::error(now, "10.0.0.1", "network unreachable"));
        samples
    }

    #[test]
    fn test_report_on_synthetic_series() {
        let report = build_report(&synthetic_series()).unwrap();

        assert_eq!(report.total_samples, 10);
        assert_eq!(report.successful, 7);
        assert_eq!(report.timeouts, 2);
        assert_eq!(report.errors, 1);
        assert!((report.avg_latency_ms.unwrap() - 11.29).abs() < 0.01);
        assert_eq!(report.min_latency_ms, Some(9.0));
        assert_eq!(report.max_latency_ms, Some(14.0));
        assert!((report.availability - 70.0).abs() < 1e-9);

        let p50 = report.p50_latency_ms.unwrap();
        assert!((9.0..=14.0).contains(&p50));
    }

    #[test]
    fn test_empty_series_has_no_report() {
        assert!(build_report(&[]).is_none());
    }

    #[test]
    fn test_all_failures_has_no_latency_stats() {
        let now = Utc::now();
        let report = build_report(&[Sample::timeout(now, "h"), Sample::error(now, "h", "x")]).unwrap();
        assert_eq!(report.successful, 0);
        assert_eq!(report.avg_latency_ms, None);
        assert_eq!(report.min_latency_ms, None);
        assert_eq!(report.p99_latency_ms, None);
        assert_eq!(report.availability, 0.0);
    }
}
