//! Liveness probes
//!
//! A probe never takes longer than its timeout. A refused connection is
//! a confirmed `Unhealthy`; a probe that runs out of time is `Unknown`.

use std::time::Duration;

use tokio::net::TcpStream;

use dh_core::model::HealthStatus;
use dh_core::service::HealthProbe;

/// Probe the service listening on `127.0.0.1:port`
pub async fn probe(
    client: &reqwest::Client,
    port: u16,
    probe: &HealthProbe,
    timeout: Duration,
) -> HealthStatus {
    match probe {
        HealthProbe::Tcp => probe_tcp(port, timeout).await,
        HealthProbe::Http { path } => probe_http(client, port, path, timeout).await,
    }
}

async fn probe_tcp(port: u16, timeout: Duration) -> HealthStatus {
    match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_)) => HealthStatus::Healthy,
        Ok(Err(e)) => {
            tracing::trace!("TCP probe of port {} failed: {}", port, e);
            HealthStatus::Unhealthy
        }
        Err(_) => HealthStatus::Unknown,
    }
}

async fn probe_http(
    client: &reqwest::Client,
    port: u16,
    path: &str,
    timeout: Duration,
) -> HealthStatus {
    let url = format!("http://127.0.0.1:{}{}", port, path);
    let request = client.get(&url).timeout(timeout).send();

    match tokio::time::timeout(timeout, request).await {
        // Any HTTP answer means the service is up, even an error status
        Ok(Ok(_)) => HealthStatus::Healthy,
        Ok(Err(e)) if e.is_timeout() => HealthStatus::Unknown,
        Ok(Err(e)) => {
            tracing::trace!("HTTP probe of {} failed: {}", url, e);
            HealthStatus::Unhealthy
        }
        Err(_) => HealthStatus::Unknown,
    }
}
