//! Metric collection
//!
//! Application-level time series used by health checks and alert rules.
//! Each registered metric keeps a bounded in-memory series; recorders are
//! grouped by subsystem (api, processing, ai_model, decision) plus a
//! periodic system sampler reading process memory from /proc.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Points retained per metric
const SERIES_CAPACITY: usize = 10_000;

/// How a window of points collapses to one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Average,
    Sum,
    Min,
    Max,
    /// 95th percentile
    P95,
    Count,
    Latest,
}

impl AggregationMethod {
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        Some(match self {
            AggregationMethod::Average => values.iter().sum::<f64>() / values.len() as f64,
            AggregationMethod::Sum => values.iter().sum(),
            AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationMethod::P95 => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
                sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
            }
            AggregationMethod::Count => values.len() as f64,
            AggregationMethod::Latest => values[values.len() - 1],
        })
    }
}

/// Registration record for one collected metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub aggregation: AggregationMethod,
    pub retention_days: u32,
}

/// One sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDataPoint {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub tags: HashMap<String, String>,
}

#[derive(Default)]
struct Store {
    definitions: HashMap<String, MetricDefinition>,
    series: HashMap<String, VecDeque<MetricDataPoint>>,
}

/// In-memory metric collector shared across the monitor
#[derive(Default)]
pub struct MetricCollector {
    store: RwLock<Store>,
}

impl MetricCollector {
    pub fn new() -> Self {
        let collector = Self::default();
        collector.register_defaults();
        collector
    }

    fn register_defaults(&self) {
        for (name, description, unit, aggregation, retention_days) in [
            (
                "api_response_time",
                "Platform API round-trip time",
                "ms",
                AggregationMethod::Average,
                7,
            ),
            (
                "api_availability",
                "Share of successful platform API calls",
                "ratio",
                AggregationMethod::Average,
                30,
            ),
            (
                "processing_latency",
                "End-to-end record processing time",
                "ms",
                AggregationMethod::Average,
                7,
            ),
            (
                "processing_throughput",
                "Events processed per cycle",
                "events",
                AggregationMethod::Sum,
                30,
            ),
            (
                "model_accuracy",
                "Scoring model accuracy",
                "ratio",
                AggregationMethod::Average,
                30,
            ),
            (
                "model_inference_time",
                "Scoring model inference time",
                "ms",
                AggregationMethod::P95,
                7,
            ),
            (
                "decision_confidence",
                "Automated decision confidence",
                "ratio",
                AggregationMethod::Average,
                30,
            ),
            (
                "system_memory_mb",
                "Resident process memory",
                "MB",
                AggregationMethod::Latest,
                7,
            ),
            (
                "system_cpu_seconds",
                "Cumulative process CPU time",
                "s",
                AggregationMethod::Latest,
                7,
            ),
        ] {
            self.register(MetricDefinition {
                name: name.to_string(),
                description: description.to_string(),
                unit: unit.to_string(),
                aggregation,
                retention_days,
            });
        }
    }

    pub fn register(&self, definition: MetricDefinition) {
        let mut store = self.store.write();
        store
            .series
            .entry(definition.name.clone())
            .or_insert_with(VecDeque::new);
        store.definitions.insert(definition.name.clone(), definition);
    }

    pub fn definition(&self, name: &str) -> Option<MetricDefinition> {
        self.store.read().definitions.get(name).cloned()
    }

    /// Records a sample. Unregistered names are dropped with a warning so
    /// a typo in a recorder cannot grow unbounded series.
    pub fn record(&self, name: &str, value: f64, tags: HashMap<String, String>) {
        let mut store = self.store.write();
        if !store.definitions.contains_key(name) {
            warn!(metric = name, "Dropping sample for unregistered metric");
            return;
        }

        let series = store.series.entry(name.to_string()).or_default();
        series.push_back(MetricDataPoint {
            name: name.to_string(),
            value,
            timestamp: Utc::now(),
            tags,
        });
        while series.len() > SERIES_CAPACITY {
            series.pop_front();
        }
    }

    pub fn record_api(&self, endpoint: &str, response_time_ms: f64, success: bool) {
        let tags = HashMap::from([("endpoint".to_string(), endpoint.to_string())]);
        self.record("api_response_time", response_time_ms, tags.clone());
        self.record("api_availability", if success { 1.0 } else { 0.0 }, tags);
    }

    pub fn record_processing(&self, stage: &str, latency_ms: f64, throughput: f64) {
        let tags = HashMap::from([("stage".to_string(), stage.to_string())]);
        self.record("processing_latency", latency_ms, tags.clone());
        self.record("processing_throughput", throughput, tags);
    }

    pub fn record_ai_model(&self, model: &str, accuracy: f64, inference_time_ms: f64) {
        let tags = HashMap::from([("model".to_string(), model.to_string())]);
        self.record("model_accuracy", accuracy, tags.clone());
        self.record("model_inference_time", inference_time_ms, tags);
    }

    pub fn record_decision(&self, decision_type: &str, confidence: f64) {
        let tags = HashMap::from([("type".to_string(), decision_type.to_string())]);
        self.record("decision_confidence", confidence, tags);
    }

    /// Values recorded within the trailing window, oldest first
    pub fn window(&self, name: &str, window_secs: u64) -> Vec<f64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(window_secs as i64);
        let store = self.store.read();
        store
            .series
            .get(name)
            .map(|series| {
                series
                    .iter()
                    .filter(|point| point.timestamp >= cutoff)
                    .map(|point| point.value)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Aggregates the trailing window with the metric's own method
    pub fn aggregate_window(&self, name: &str, window_secs: u64) -> Option<f64> {
        let method = self.definition(name)?.aggregation;
        let values = self.window(name, window_secs);
        method.apply(&values)
    }

    /// All points recorded after the cutoff, across every metric.
    /// Feeds periodic persistence.
    pub fn points_since(&self, cutoff: DateTime<Utc>) -> Vec<MetricDataPoint> {
        let store = self.store.read();
        store
            .series
            .values()
            .flat_map(|series| series.iter().filter(|p| p.timestamp > cutoff).cloned())
            .collect()
    }

    pub fn latest(&self, name: &str) -> Option<f64> {
        let store = self.store.read();
        store
            .series
            .get(name)
            .and_then(|series| series.back())
            .map(|point| point.value)
    }

    /// Drops samples older than each metric's configured retention
    pub fn prune_expired(&self) {
        let now = Utc::now();
        let mut store = self.store.write();
        let Store {
            definitions,
            series,
        } = &mut *store;
        for (name, series) in series.iter_mut() {
            let Some(definition) = definitions.get(name) else {
                continue;
            };
            let cutoff = now - ChronoDuration::days(definition.retention_days as i64);
            while series.front().map_or(false, |p| p.timestamp < cutoff) {
                series.pop_front();
            }
        }
    }

    /// Samples process memory and CPU time into the system series
    pub fn sample_system(&self) {
        if let Some(rss_mb) = read_rss_mb() {
            self.record("system_memory_mb", rss_mb, HashMap::new());
            debug!(rss_mb = rss_mb, "Sampled system metrics");
        }
        if let Some(cpu_secs) = read_cpu_seconds() {
            self.record("system_cpu_seconds", cpu_secs, HashMap::new());
        }
    }
}

/// Resident set size in MB from /proc, None off Linux
fn read_rss_mb() -> Option<f64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096.0 / (1024.0 * 1024.0))
}

/// Cumulative user+system CPU seconds from /proc, None off Linux.
/// Fields 14 and 15 of stat are utime/stime in clock ticks; the field
/// split starts after the parenthesized comm to survive spaces in it.
fn read_cpu_seconds() -> Option<f64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) / 100.0)
}

/// Spawns the periodic system sampler
pub fn spawn_system_sampler(
    collector: std::sync::Arc<MetricCollector>,
    interval_secs: u64,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    collector.sample_system();
                    collector.prune_expired();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregations() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(AggregationMethod::Average.apply(&values), Some(2.5));
        assert_eq!(AggregationMethod::Sum.apply(&values), Some(10.0));
        assert_eq!(AggregationMethod::Min.apply(&values), Some(1.0));
        assert_eq!(AggregationMethod::Max.apply(&values), Some(4.0));
        assert_eq!(AggregationMethod::Count.apply(&values), Some(4.0));
        assert_eq!(AggregationMethod::Latest.apply(&values), Some(4.0));
        assert_eq!(AggregationMethod::Average.apply(&[]), None);
    }

    #[test]
    fn test_p95() {
        let values: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(AggregationMethod::P95.apply(&values), Some(95.0));
        assert_eq!(AggregationMethod::P95.apply(&[7.0]), Some(7.0));
    }

    #[test]
    fn test_record_and_window() {
        let collector = MetricCollector::new();
        collector.record_api("tiktok", 120.0, true);
        collector.record_api("tiktok", 80.0, true);

        let window = collector.window("api_response_time", 60);
        assert_eq!(window, vec![120.0, 80.0]);
        assert_eq!(collector.aggregate_window("api_response_time", 60), Some(100.0));
    }

    #[test]
    fn test_availability_tracks_failures() {
        let collector = MetricCollector::new();
        collector.record_api("meta", 50.0, true);
        collector.record_api("meta", 50.0, false);
        collector.record_api("meta", 50.0, true);

        let availability = collector.aggregate_window("api_availability", 60).unwrap();
        assert!((availability - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unregistered_metric_dropped() {
        let collector = MetricCollector::new();
        collector.record("no_such_metric", 1.0, HashMap::new());
        assert!(collector.window("no_such_metric", 60).is_empty());
    }

    #[test]
    fn test_series_bounded() {
        let collector = MetricCollector::new();
        for i in 0..(SERIES_CAPACITY + 100) {
            collector.record("processing_latency", i as f64, HashMap::new());
        }
        assert_eq!(collector.window("processing_latency", 3600).len(), SERIES_CAPACITY);
    }
}
