//! Component health evaluation
//!
//! Derives per-component health from recent collector data and rolls the
//! worst component status up into an overall verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::collector::MetricCollector;

/// Window of samples each component check looks at
const CHECK_WINDOW_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unknown,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub generated_at: DateTime<Utc>,
}

/// Evaluates component health from collector windows
pub struct HealthChecker {
    collector: Arc<MetricCollector>,
}

impl HealthChecker {
    pub fn new(collector: Arc<MetricCollector>) -> Self {
        Self { collector }
    }

    pub fn report(&self) -> HealthReport {
        let components = vec![
            self.check_api(),
            self.check_processing(),
            self.check_models(),
            self.check_system(),
        ];

        // Overall is the worst component; Unknown only dominates Healthy
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Unknown);

        HealthReport {
            status,
            components,
            generated_at: Utc::now(),
        }
    }

    /// Availability below 95% degrades, below 80% is unhealthy
    fn check_api(&self) -> ComponentHealth {
        match self
            .collector
            .aggregate_window("api_availability", CHECK_WINDOW_SECS)
        {
            None => component("api", HealthStatus::Unknown, "No recent API calls".to_string()),
            Some(availability) => {
                let pct = availability * 100.0;
                let (status, message) = if availability < 0.80 {
                    (
                        HealthStatus::Unhealthy,
                        format!("API availability at {pct:.1}%"),
                    )
                } else if availability < 0.95 {
                    (
                        HealthStatus::Degraded,
                        format!("API availability at {pct:.1}%"),
                    )
                } else {
                    (
                        HealthStatus::Healthy,
                        format!("API availability at {pct:.1}%"),
                    )
                };
                component("api", status, message)
            }
        }
    }

    /// Latency over 5s degrades, over 30s is unhealthy
    fn check_processing(&self) -> ComponentHealth {
        match self
            .collector
            .aggregate_window("processing_latency", CHECK_WINDOW_SECS)
        {
            None => component(
                "processing",
                HealthStatus::Unknown,
                "No recent processing activity".to_string(),
            ),
            Some(latency_ms) => {
                let (status, message) = if latency_ms > 30_000.0 {
                    (
                        HealthStatus::Unhealthy,
                        format!("Processing latency at {latency_ms:.0}ms"),
                    )
                } else if latency_ms > 5_000.0 {
                    (
                        HealthStatus::Degraded,
                        format!("Processing latency at {latency_ms:.0}ms"),
                    )
                } else {
                    (
                        HealthStatus::Healthy,
                        format!("Processing latency at {latency_ms:.0}ms"),
                    )
                };
                component("processing", status, message)
            }
        }
    }

    /// Accuracy below 85% degrades, below 70% is unhealthy
    fn check_models(&self) -> ComponentHealth {
        match self
            .collector
            .aggregate_window("model_accuracy", CHECK_WINDOW_SECS)
        {
            None => component(
                "ai_models",
                HealthStatus::Unknown,
                "No recent model activity".to_string(),
            ),
            Some(accuracy) => {
                let pct = accuracy * 100.0;
                let (status, message) = if accuracy < 0.70 {
                    (
                        HealthStatus::Unhealthy,
                        format!("Model accuracy at {pct:.1}%"),
                    )
                } else if accuracy < 0.85 {
                    (
                        HealthStatus::Degraded,
                        format!("Model accuracy at {pct:.1}%"),
                    )
                } else {
                    (HealthStatus::Healthy, format!("Model accuracy at {pct:.1}%"))
                };
                component("ai_models", status, message)
            }
        }
    }

    /// Resident memory over 1GB degrades, over 2GB is unhealthy
    fn check_system(&self) -> ComponentHealth {
        match self.collector.latest("system_memory_mb") {
            None => component(
                "system",
                HealthStatus::Unknown,
                "No system samples yet".to_string(),
            ),
            Some(rss_mb) => {
                let (status, message) = if rss_mb > 2_048.0 {
                    (
                        HealthStatus::Unhealthy,
                        format!("Resident memory at {rss_mb:.0}MB"),
                    )
                } else if rss_mb > 1_024.0 {
                    (
                        HealthStatus::Degraded,
                        format!("Resident memory at {rss_mb:.0}MB"),
                    )
                } else {
                    (
                        HealthStatus::Healthy,
                        format!("Resident memory at {rss_mb:.0}MB"),
                    )
                };
                component("system", status, message)
            }
        }
    }
}

fn component(name: &str, status: HealthStatus, message: String) -> ComponentHealth {
    ComponentHealth {
        component: name.to_string(),
        status,
        message,
        checked_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn checker_with(samples: &[(&str, f64)]) -> HealthChecker {
        let collector = Arc::new(MetricCollector::new());
        for (name, value) in samples {
            collector.record(name, *value, HashMap::new());
        }
        HealthChecker::new(collector)
    }

    #[test]
    fn test_all_unknown_without_data() {
        let report = checker_with(&[]).report();
        assert_eq!(report.status, HealthStatus::Unknown);
        assert!(report
            .components
            .iter()
            .all(|c| c.status == HealthStatus::Unknown));
    }

    #[test]
    fn test_healthy_report() {
        let report = checker_with(&[
            ("api_availability", 1.0),
            ("processing_latency", 200.0),
            ("model_accuracy", 0.95),
            ("system_memory_mb", 256.0),
        ])
        .report();
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_worst_component_wins() {
        let report = checker_with(&[
            ("api_availability", 1.0),
            ("processing_latency", 200.0),
            ("model_accuracy", 0.5),
            ("system_memory_mb", 256.0),
        ])
        .report();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        let models = report
            .components
            .iter()
            .find(|c| c.component == "ai_models")
            .unwrap();
        assert_eq!(models.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_degraded_api() {
        // 9 successes, 1 failure in window -> 90% availability
        let collector = Arc::new(MetricCollector::new());
        for i in 0..10 {
            collector.record_api("tiktok", 50.0, i != 0);
        }
        collector.record("processing_latency", 100.0, HashMap::new());
        collector.record("model_accuracy", 0.95, HashMap::new());
        collector.record("system_memory_mb", 100.0, HashMap::new());

        let report = HealthChecker::new(collector).report();
        assert_eq!(report.status, HealthStatus::Degraded);
    }
}
