//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server. Scrapes read the cumulative totals, so
//! they never disturb the periodic log window.

use crate::infra::metrics::{
    percentile_from_buckets, Metrics, MetricsTotals, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS,
};
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

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.totals();
    let mut output = String::with_capacity(4096);

    write_admission_metrics(&mut output, site_id, &summary);
    write_device_metrics(&mut output, site_id, &summary);
    write_notification_metrics(&mut output, site_id, &summary);

    output
}

fn write_admission_metrics(output: &mut String, site: &str, summary: &MetricsTotals) {
    let _ = writeln!(output, "# HELP petgate_admissions_total Door admission decisions by outcome");
    let _ = writeln!(output, "# TYPE petgate_admissions_total counter");
    for (outcome, val) in [
        ("granted", summary.admissions_granted),
        ("denied", summary.admissions_denied),
    ] {
        let _ = writeln!(
            output,
            "petgate_admissions_total{{site=\"{site}\",outcome=\"{outcome}\"}} {val}"
        );
    }
    write_metric(
        output,
        "petgate_admissions_unrecognized_total",
        "Denials where no fingerprint matched above threshold",
        MetricType::Counter,
        site,
        summary.admissions_unrecognized,
    );
    write_histogram(
        output,
        "petgate_recognition_latency_us",
        "Frame persist and identify latency in microseconds",
        site,
        &summary.recognition_buckets,
        summary.recognition_sum_us,
    );
    write_metric(
        output,
        "petgate_recognition_latency_p99_us",
        "99th percentile recognition latency since start",
        MetricType::Gauge,
        site,
        percentile_from_buckets(&summary.recognition_buckets, 0.99),
    );
}

fn write_device_metrics(output: &mut String, site: &str, summary: &MetricsTotals) {
    let _ = writeln!(output, "# HELP petgate_verifications_total Device challenge verifications");
    let _ = writeln!(output, "# TYPE petgate_verifications_total counter");
    for (result, val) in [
        ("passed", summary.verifications_passed),
        ("failed", summary.verifications_failed),
    ] {
        let _ = writeln!(
            output,
            "petgate_verifications_total{{site=\"{site}\",result=\"{result}\"}} {val}"
        );
    }
    write_metric(
        output,
        "petgate_telemetry_samples_total",
        "Location samples accepted",
        MetricType::Counter,
        site,
        summary.telemetry_samples,
    );
    write_metric(
        output,
        "petgate_telemetry_unknown_device_total",
        "Telemetry batches from unknown devices",
        MetricType::Counter,
        site,
        summary.telemetry_unknown_device,
    );
    write_metric(
        output,
        "petgate_geofence_syncs_total",
        "Geofence sync requests served",
        MetricType::Counter,
        site,
        summary.geofence_syncs,
    );
    write_metric(
        output,
        "petgate_geofence_events_total",
        "Geofence crossings recorded",
        MetricType::Counter,
        site,
        summary.geofence_events,
    );
    write_metric(
        output,
        "petgate_geofence_breaches_total",
        "Geofence breaches recorded",
        MetricType::Counter,
        site,
        summary.geofence_breaches,
    );
}

fn write_notification_metrics(output: &mut String, site: &str, summary: &MetricsTotals) {
    let _ = writeln!(output, "# HELP petgate_notifications_total Owner notifications by state");
    let _ = writeln!(output, "# TYPE petgate_notifications_total counter");
    for (state, val) in [
        ("queued", summary.notifications_queued),
        ("dropped", summary.notifications_dropped),
        ("delivered", summary.notifications_delivered),
        ("failed", summary.notifications_failed),
    ] {
        let _ = writeln!(
            output,
            "petgate_notifications_total{{site=\"{site}\",state=\"{state}\"}} {val}"
        );
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, content_type, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => (
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => (StatusCode::OK, "text/plain", "ok".to_string()),
        _ => (StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
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
