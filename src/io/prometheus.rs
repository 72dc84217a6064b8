//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics, plus the
//! current poll status as JSON at /status.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::poller::PollStatus;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with tenant label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    tenant: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{tenant=\"{tenant}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    tenant: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{tenant=\"{tenant}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{tenant=\"{tenant}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{tenant=\"{tenant}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{tenant=\"{tenant}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
///
/// Reads cumulative totals, so scraping does not disturb the periodic log window.
fn format_prometheus_metrics(metrics: &Metrics, tenant: &str) -> String {
    let summary = metrics.totals();
    let mut output = String::with_capacity(4096);

    write_poll_metrics(&mut output, tenant, &summary);
    write_refresh_metrics(&mut output, tenant, &summary);
    write_health_metrics(&mut output, tenant, &summary);

    output
}

fn write_poll_metrics(output: &mut String, tenant: &str, s: &MetricsSummary) {
    let counters: [(&str, &str, u64); 6] = [
        ("presence_probes_total", "Change probes completed", s.probes_total),
        ("presence_probes_unchanged_total", "Probes that reported no change", s.unchanged_total),
        ("presence_refreshes_total", "Full refreshes completed", s.refreshes_total),
        ("presence_failures_total", "Failed probes or fetches", s.failures_total),
        ("presence_stale_results_dropped_total", "Superseded results discarded", s.stale_dropped_total),
        ("presence_watchdog_fired_total", "Loading watchdog expiries", s.watchdog_fired_total),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, tenant, val);
    }
}

fn write_refresh_metrics(output: &mut String, tenant: &str, s: &MetricsSummary) {
    write_histogram(
        output,
        "presence_refresh_latency_ms",
        "Fetch-to-snapshot refresh latency in milliseconds",
        tenant,
        &s.refresh_buckets,
        s.refresh_sum_ms,
    );
    write_metric(
        output,
        "presence_refresh_latency_p99_ms",
        "99th percentile refresh latency",
        MetricType::Gauge,
        tenant,
        s.refresh_p99_ms,
    );
    write_metric(
        output,
        "presence_snapshots_published_total",
        "Snapshots handed to consumers",
        MetricType::Counter,
        tenant,
        s.snapshots_published_total,
    );
    write_metric(
        output,
        "presence_markers",
        "Markers in the last published snapshot",
        MetricType::Gauge,
        tenant,
        s.markers_last,
    );
    write_metric(
        output,
        "presence_parse_issues_total",
        "Data issues reported in published snapshots",
        MetricType::Counter,
        tenant,
        s.parse_issues_total,
    );
}

fn write_health_metrics(output: &mut String, tenant: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "presence_degraded",
        "1 while the failure ceiling is exceeded",
        MetricType::Gauge,
        tenant,
        u64::from(s.degraded),
    );
    write_metric(
        output,
        "presence_degraded_episodes_total",
        "Times the poller entered the degraded state",
        MetricType::Counter,
        tenant,
        s.degraded_episodes_total,
    );
    write_metric(
        output,
        "presence_consecutive_failures",
        "Current consecutive failure count",
        MetricType::Gauge,
        tenant,
        s.consecutive_failures,
    );
    write_metric(
        output,
        "presence_updates_dropped_total",
        "Updates dropped on a full consumer channel",
        MetricType::Counter,
        tenant,
        s.updates_dropped_total,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    tenant: Arc<String>,
    status: watch::Receiver<PollStatus>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &tenant),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".into()),
        (&Method::GET, "/status") => {
            let current = status.borrow().clone();
            match serde_json::to_string(&current) {
                Ok(json) => text_response(StatusCode::OK, "application/json", json),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".into()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    tenant: String,
    status: watch::Receiver<PollStatus>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let tenant = Arc::new(tenant);

    info!(port = %port, tenant = %tenant, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let tenant = tenant.clone();
                        let status = status.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let tenant = tenant.clone();
                                let status = status.clone();
                                async move { handle_request(req, metrics, tenant, status).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
