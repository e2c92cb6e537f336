use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter_vec, Gauge, GaugeVec, IntCounterVec,
};

lazy_static! {
    pub static ref BACKEND_ARRIVAL_RATE: GaugeVec = register_gauge_vec!(
        "resolver_backend_arrival_rate",
        "Decayed arrival rate (events/sec) observed on a backend",
        &["backend_addr"]
    ).unwrap();

    pub static ref BACKEND_HEALTH: GaugeVec = register_gauge_vec!(
        "resolver_backend_health",
        "Health status of a backend (1 = up, 0 = down)",
        &["backend_addr"]
    ).unwrap();

    /// Size of the metric->Backend map (spec §4.9: a single scalar gauge).
    pub static ref ASSIGNMENTS_TOTAL: Gauge = register_gauge!(
        "resolver_assignments_total",
        "Current number of metric-to-backend assignments held in memory"
    ).unwrap();

    /// Per-backend breakdown of the same map, for dashboards that want to
    /// see the distribution rather than just the total.
    pub static ref BACKEND_ASSIGNMENTS_TOTAL: GaugeVec = register_gauge_vec!(
        "resolver_backend_assignments_total",
        "Current number of metric-to-backend assignments held per backend",
        &["backend_addr"]
    ).unwrap();

    pub static ref REASSIGNMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "resolver_reassignments_total",
        "Total number of metric reassignments performed by rebalancing",
        &["reason"]
    ).unwrap();
}

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler(_req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::from(format!("metrics encoding error: {}", e))))
            .unwrap());
    }

    Ok(Response::builder()
        .header("Content-Type", encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .unwrap())
}
