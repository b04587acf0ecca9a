//! Prometheus metrics
//!
//! Counters and histograms for the ingest pipeline, exported over a
//! small hyper server on /metrics.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tracing::{error, info};

use crate::error::{IngestionError, Result};

static EVENTS_INGESTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_events_ingested_total",
        "Normalized events published, by platform and event type",
        &["platform", "event_type"]
    )
    .expect("Failed to create events_ingested metric")
});

static DUPLICATES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_duplicates_total",
        "Events dropped as duplicates, by platform",
        &["platform"]
    )
    .expect("Failed to create duplicates metric")
});

static INGEST_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_ingest_errors_total",
        "Platform-level ingestion failures",
        &["platform"]
    )
    .expect("Failed to create ingest_errors metric")
});

static NORMALIZATION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_normalization_failures_total",
        "Raw records that could not be normalized",
        &["platform"]
    )
    .expect("Failed to create normalization_failures metric")
});

static DEAD_LETTERS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pulse_dead_letters_total",
        "Messages routed to the dead-letter topic",
        &["platform"]
    )
    .expect("Failed to create dead_letters metric")
});

static STAGE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];
    register_histogram_vec!(
        HistogramOpts::new(
            "pulse_stage_latency_seconds",
            "Latency of each pipeline stage"
        )
        .buckets(buckets),
        &["stage", "platform"]
    )
    .expect("Failed to create stage_latency metric")
});

static ALERTS_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pulse_alerts_active",
        "Currently active alerts by severity",
        &["severity"]
    )
    .expect("Failed to create alerts_active metric")
});

pub fn record_event_ingested(platform: &str, event_type: &str) {
    EVENTS_INGESTED
        .with_label_values(&[platform, event_type])
        .inc();
}

pub fn record_duplicate(platform: &str) {
    DUPLICATES.with_label_values(&[platform]).inc();
}

pub fn record_ingest_error(platform: &str) {
    INGEST_ERRORS.with_label_values(&[platform]).inc();
}

pub fn record_normalization_failure(platform: &str) {
    NORMALIZATION_FAILURES.with_label_values(&[platform]).inc();
}

pub fn record_dead_letter(platform: &str) {
    DEAD_LETTERS.with_label_values(&[platform]).inc();
}

pub fn record_stage_latency(stage: &str, platform: &str, latency_secs: f64) {
    STAGE_LATENCY
        .with_label_values(&[stage, platform])
        .observe(latency_secs);
}

pub fn set_active_alerts(severity: &str, count: i64) {
    ALERTS_ACTIVE.with_label_values(&[severity]).set(count);
}

/// Measures a stage and records on `observe`
pub struct StageTimer {
    stage: &'static str,
    platform: String,
    start: std::time::Instant,
}

impl StageTimer {
    pub fn start(stage: &'static str, platform: &str) -> Self {
        Self {
            stage,
            platform: platform.to_string(),
            start: std::time::Instant::now(),
        }
    }

    pub fn observe(self) {
        record_stage_latency(self.stage, &self.platform, self.start.elapsed().as_secs_f64());
    }
}

/// Renders every registered metric in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use super::health::{HealthChecker, HealthStatus};

async fn handle_request(
    req: Request<Incoming>,
    health: Arc<HealthChecker>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/metrics" => Ok(Response::new(Full::new(Bytes::from(gather_metrics())))),
        "/health" => {
            let report = health.report();
            let body = serde_json::to_string_pretty(&report).unwrap_or_default();
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if report.status == HealthStatus::Unhealthy {
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            }
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            Ok(response)
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

/// Serves /metrics and /health until the process exits
pub async fn start_metrics_server(addr: SocketAddr, health: Arc<HealthChecker>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(IngestionError::IoError)?;
    info!(address = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await.map_err(IngestionError::IoError)?;
        let io = TokioIo::new(stream);
        let health = health.clone();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn(move |req| handle_request(req, health.clone())),
                )
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        record_event_ingested("tiktok", "POST");
        record_duplicate("reddit");
        record_stage_latency("fetch", "tiktok", 0.12);
        record_dead_letter("meta");

        let rendered = gather_metrics();
        assert!(rendered.contains("pulse_events_ingested_total"));
        assert!(rendered.contains("pulse_duplicates_total"));
        assert!(rendered.contains("pulse_stage_latency_seconds"));
        assert!(rendered.contains("pulse_dead_letters_total"));
    }

    #[test]
    fn test_stage_timer_records() {
        let timer = StageTimer::start("normalize", "youtube");
        std::thread::sleep(std::time::Duration::from_millis(5));
        timer.observe();

        let rendered = gather_metrics();
        assert!(rendered.contains("pulse_stage_latency_seconds"));
    }
}
