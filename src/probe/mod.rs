//! Probe module for reachability measurements.
//!
//! Plain hosts are probed with ICMP echo; `http://` and `https://` targets
//! with an HTTP GET.

mod http;
mod ping;

pub use http::*;
pub use ping::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// How a target is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Ping,
    Http,
}

impl ProbeKind {
    pub fn for_target(target: &str) -> Self {
        if target.starts_with("http://") || target.starts_with("https://") {
            ProbeKind::Http
        } else {
            ProbeKind::Ping
        }
    }
}

/// A single round-trip measurement against a target.
///
/// Implementations return the observed latency, `ProbeError::Timeout` when
/// no answer arrived in time, and any other error for everything else.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Prober that talks to the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkProber;

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, target: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        run_probe(target, timeout).await
    }
}

/// Run the probe matching the target's kind.
pub async fn run_probe(target: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ProbeError::Config("empty target".to_string()));
    }

    let result = match ProbeKind::for_target(target) {
        ProbeKind::Ping => run_ping_probe(target, timeout).await,
        ProbeKind::Http => run_http_probe(target, timeout).await,
    };

    match result {
        Ok(latency) if latency >= timeout => Err(ProbeError::Timeout(timeout)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_kind_for_target() {
        assert_eq!(ProbeKind::for_target("8.8.8.8"), ProbeKind::Ping);
        assert_eq!(ProbeKind::for_target("example.com"), ProbeKind::Ping);
        assert_eq!(ProbeKind::for_target("http://example.com"), ProbeKind::Http);
        assert_eq!(ProbeKind::for_target("https://example.com/health"), ProbeKind::Http);
    }

    #[tokio::test]
    async fn test_empty_target_is_config_error() {
        let err = run_probe("  ", Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }
}
