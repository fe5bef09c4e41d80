//! HTTP probe implementation.

use std::time::{Duration, Instant};
use super::ProbeError;

/// Time an HTTP GET against `address` up to the response headers.
///
/// Any HTTP status counts as reachable.
pub async fn run_http_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let url = normalize_url(address);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let start = Instant::now();
    let response = client.get(&url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;
    let elapsed = start.elapsed();

    tracing::trace!("HTTP probe {} -> {} in {:?}", url, response.status(), elapsed);
    Ok(elapsed)
}

fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
