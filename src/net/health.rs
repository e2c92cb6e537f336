use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};

use crate::config::HealthCheckConfig;
use crate::core::backend::Backend;
use crate::metrics;

/// Spawn the TCP-only health checker for a single backend (spec §4.7): a
/// plain connect-and-close probe on a fixed interval, flipping `Backend::up`
/// on change. Dropped from the teacher's health checker: the HTTP variant
/// (spec scope is TCP ingest backends, not HTTP services).
pub fn start_health_check(backend: Arc<Backend>, config: HealthCheckConfig) {
    if !config.enabled {
        return;
    }
    tokio::spawn(async move {
        info!("starting health check for {}", backend.addr());
        loop {
            let healthy = check_tcp(&backend.addr(), Duration::from_millis(config.timeout_ms)).await;
            let was_up = backend.is_up();
            backend.set_up(healthy);
            metrics::BACKEND_HEALTH.with_label_values(&[&backend.addr()]).set(if healthy { 1.0 } else { 0.0 });
            if was_up != healthy {
                if healthy {
                    info!("backend {} marked healthy", backend.addr());
                } else {
                    warn!("backend {} marked unhealthy", backend.addr());
                }
            }
            sleep(Duration::from_millis(config.interval_ms)).await;
        }
    });
}

async fn check_tcp(addr: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("tcp health check failed for {}: {}", addr, e);
            false
        }
        Err(_) => {
            debug!("tcp health check timed out for {}", addr);
            false
        }
    }
}
