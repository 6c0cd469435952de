//! Metrics facade.
//!
//! All subsystems emit through the helpers here so the label sets stay
//! consistent. The Prometheus recorder is installed once at startup and
//! rendered by a small hyper server on the metrics bind address;
//! per-plane emission is gated by the static configuration flags.

use anyhow::Result;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Response, Server, StatusCode};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

use crate::config::MetricsConfig;

static ENTRY_POINT_METRICS: AtomicBool = AtomicBool::new(false);
static ROUTER_METRICS: AtomicBool = AtomicBool::new(false);
static SERVICE_METRICS: AtomicBool = AtomicBool::new(false);

/// Install the Prometheus recorder and serve the exposition endpoint.
/// Returns the spawned server's join handle.
pub async fn start_metrics_server(
    config: &MetricsConfig,
) -> Result<tokio::task::JoinHandle<()>> {
    ENTRY_POINT_METRICS.store(config.entry_points, Ordering::Relaxed);
    ROUTER_METRICS.store(config.routers, Ordering::Relaxed);
    SERVICE_METRICS.store(config.services, Ordering::Relaxed);

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

    let bind = config.bind;
    let make_service = make_service_fn(move |_conn: &AddrStream| {
        let handle = handle.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handle = handle.clone();
                async move { Ok::<_, Infallible>(render(req.method(), req.uri().path(), &handle)) }
            }))
        }
    });

    let server = Server::try_bind(&bind)
        .map_err(|e| anyhow::anyhow!("failed to bind metrics endpoint {}: {}", bind, e))?
        .serve(make_service);

    info!(bind = %bind, "Metrics endpoint listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    }))
}

fn render(method: &Method, path: &str, handle: &PrometheusHandle) -> Response<Body> {
    match (method, path) {
        (&Method::GET, "/metrics") => Response::new(Body::from(handle.render())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty())),
    }
}

/// Entry-point request counter and duration histogram.
pub fn entry_point_request(
    entry_point: &str,
    method: &str,
    protocol: &str,
    status: u16,
    duration: Duration,
) {
    if !ENTRY_POINT_METRICS.load(Ordering::Relaxed) {
        return;
    }
    let labels = [
        ("entrypoint", entry_point.to_string()),
        ("method", method.to_string()),
        ("protocol", protocol.to_string()),
        ("code", status.to_string()),
    ];
    metrics::counter!("fluxgate_entrypoint_requests_total", &labels).increment(1);

    let duration_labels = [("entrypoint", entry_point.to_string())];
    metrics::histogram!("fluxgate_entrypoint_request_duration_seconds", &duration_labels)
        .record(duration.as_secs_f64());
}

/// Open connections gauge per entry point.
pub fn open_connections(entry_point: &str, delta: i64) {
    let labels = [("entrypoint", entry_point.to_string())];
    metrics::gauge!("fluxgate_open_connections", &labels).increment(delta as f64);
}

/// Per-router request counter.
pub fn router_request(router: &str) {
    if !ROUTER_METRICS.load(Ordering::Relaxed) {
        return;
    }
    let labels = [("router", router.to_string())];
    metrics::counter!("fluxgate_router_requests_total", &labels).increment(1);
}

/// Per-service request counter, partitioned by status.
pub fn service_request(service: &str, status: hyper::StatusCode) {
    if !SERVICE_METRICS.load(Ordering::Relaxed) {
        return;
    }
    let labels = [
        ("service", service.to_string()),
        ("code", status.as_u16().to_string()),
    ];
    metrics::counter!("fluxgate_service_requests_total", &labels).increment(1);
}

/// TLS request counter, partitioned by negotiated version and cipher.
pub fn tls_request(entry_point: &str, version: &str, cipher: &str) {
    if !ENTRY_POINT_METRICS.load(Ordering::Relaxed) {
        return;
    }
    let labels = [
        ("entrypoint", entry_point.to_string()),
        ("version", version.to_string()),
        ("cipher", cipher.to_string()),
    ];
    metrics::counter!("fluxgate_tls_requests_total", &labels).increment(1);
}

/// Request/response byte counters per entry point. Sizes come from the
/// Content-Length headers; chunked transfers are not counted.
pub fn entry_point_bytes(entry_point: &str, request_bytes: u64, response_bytes: u64) {
    if !ENTRY_POINT_METRICS.load(Ordering::Relaxed) {
        return;
    }
    let labels = [("entrypoint", entry_point.to_string())];
    if request_bytes > 0 {
        metrics::counter!("fluxgate_request_bytes_total", &labels).increment(request_bytes);
    }
    if response_bytes > 0 {
        metrics::counter!("fluxgate_response_bytes_total", &labels).increment(response_bytes);
    }
}

/// Retry counter per retry middleware.
pub fn retry(middleware: &str) {
    let labels = [("middleware", middleware.to_string())];
    metrics::counter!("fluxgate_retries_total", &labels).increment(1);
}

/// Health gauge: 1 while the server receives traffic, 0 otherwise.
pub fn set_server_up(service: &str, url: &str, up: bool) {
    let labels = [
        ("service", service.to_string()),
        ("url", url.to_string()),
    ];
    metrics::gauge!("fluxgate_server_up", &labels).set(if up { 1.0 } else { 0.0 });
}

/// Configuration reload counter plus last-success timestamp.
pub fn config_reload(success: bool) {
    let labels = [("success", success.to_string())];
    metrics::counter!("fluxgate_config_reloads_total", &labels).increment(1);
    if success {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        metrics::gauge!("fluxgate_config_last_reload_success_timestamp_seconds").set(now);
    }
}
