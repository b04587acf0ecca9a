//! Threshold alerting
//!
//! Rules are evaluated against collector windows on a fixed cadence. Each
//! rule holds at most one active alert; firing again while active updates the
//! observed value instead of opening a second alert. Resolved alerts suppress
//! re-firing of the same rule for a configurable cooldown. Alerts that stay
//! active past the escalation deadline are bumped one severity level during
//! evaluation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::collector::{AggregationMethod, MetricCollector};
use super::metrics;

/// Active alerts kept in the history ring
const HISTORY_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
            AlertSeverity::Emergency => "EMERGENCY",
        }
    }

    fn escalated(&self) -> AlertSeverity {
        match self {
            AlertSeverity::Warning => AlertSeverity::Critical,
            AlertSeverity::Critical | AlertSeverity::Emergency => AlertSeverity::Emergency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "ACTIVE",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
            AlertStatus::Resolved => "RESOLVED",
            AlertStatus::Suppressed => "SUPPRESSED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric_name: String,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub emergency_threshold: Option<f64>,
    /// When true the metric is good when high, so values BELOW a threshold
    /// trigger (availability, accuracy)
    #[serde(default)]
    pub high_is_good: bool,
    pub window_secs: u64,
    pub aggregation: AggregationMethod,
    pub min_data_points: usize,
    pub suppression_minutes: i64,
    pub escalation_minutes: i64,
    pub enabled: bool,
}

impl AlertRule {
    /// Highest severity whose threshold the value crosses
    fn triggered_severity(&self, value: f64) -> Option<(AlertSeverity, f64)> {
        let candidates = [
            (AlertSeverity::Emergency, self.emergency_threshold),
            (AlertSeverity::Critical, self.critical_threshold),
            (AlertSeverity::Warning, self.warning_threshold),
        ];
        for (severity, threshold) in candidates {
            let Some(threshold) = threshold else { continue };
            let crossed = if self.high_is_good {
                value < threshold
            } else {
                value >= threshold
            };
            if crossed {
                return Some((severity, threshold));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInstance {
    pub id: Uuid,
    pub rule_name: String,
    pub metric_name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Delivery target for alert state changes
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, alert: &AlertInstance);
}

/// Default channel writing alerts into the service log
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &AlertInstance) {
        match alert.status {
            AlertStatus::Active => match alert.severity {
                AlertSeverity::Warning => warn!(
                    rule = %alert.rule_name,
                    value = alert.value,
                    threshold = alert.threshold,
                    "ALERT: {}",
                    alert.message
                ),
                AlertSeverity::Critical | AlertSeverity::Emergency => error!(
                    rule = %alert.rule_name,
                    severity = alert.severity.as_str(),
                    value = alert.value,
                    threshold = alert.threshold,
                    "ALERT: {}",
                    alert.message
                ),
            },
            AlertStatus::Acknowledged => info!(
                rule = %alert.rule_name,
                by = alert.acknowledged_by.as_deref().unwrap_or("unknown"),
                "Alert acknowledged: {}",
                alert.message
            ),
            AlertStatus::Suppressed => debug!(
                rule = %alert.rule_name,
                value = alert.value,
                "Alert suppressed within cooldown: {}",
                alert.message
            ),
            AlertStatus::Resolved => info!(
                rule = %alert.rule_name,
                value = alert.value,
                "Alert resolved: {}",
                alert.message
            ),
        }
    }
}

#[derive(Default)]
struct AlertState {
    active: HashMap<String, AlertInstance>,
    last_resolved: HashMap<String, DateTime<Utc>>,
    history: Vec<AlertInstance>,
}

pub struct AlertManager {
    rules: RwLock<Vec<AlertRule>>,
    state: RwLock<AlertState>,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl AlertManager {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self {
            rules: RwLock::new(default_rules()),
            state: RwLock::new(AlertState::default()),
            channels,
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.write();
        rules.retain(|r| r.name != rule.name);
        rules.push(rule);
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().clone()
    }

    pub fn active_alerts(&self) -> Vec<AlertInstance> {
        self.state.read().active.values().cloned().collect()
    }

    pub fn history(&self) -> Vec<AlertInstance> {
        self.state.read().history.clone()
    }

    /// Marks an active alert as acknowledged, which stops escalation.
    /// Returns false when the rule has no active alert.
    pub fn acknowledge(&self, rule_name: &str, by: &str) -> bool {
        let mut state = self.state.write();
        match state.active.get_mut(rule_name) {
            Some(alert) if alert.status == AlertStatus::Active => {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_by = Some(by.to_string());
                alert.acknowledged_at = Some(Utc::now());
                info!(rule = rule_name, by, "Alert acknowledged");
                true
            }
            _ => false,
        }
    }

    /// Runs one evaluation pass over all enabled rules
    pub async fn evaluate(&self, collector: &MetricCollector) {
        let rules = self.rules.read().clone();
        let now = Utc::now();
        let mut notifications = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            let values = collector.window(&rule.metric_name, rule.window_secs);
            if values.len() < rule.min_data_points {
                continue;
            }
            let Some(value) = rule.aggregation.apply(&values) else {
                continue;
            };

            let mut state = self.state.write();
            match rule.triggered_severity(value) {
                Some((severity, threshold)) => {
                    if let Some(active) = state.active.get_mut(&rule.name) {
                        active.value = value;
                        // Escalate stale alerts one level per deadline
                        let deadline =
                            active.triggered_at + ChronoDuration::minutes(rule.escalation_minutes);
                        if rule.escalation_minutes > 0
                            && now >= deadline
                            && active.status == AlertStatus::Active
                            && active.escalated_at.is_none()
                            && active.severity < AlertSeverity::Emergency
                        {
                            active.severity = active.severity.escalated();
                            active.escalated_at = Some(now);
                            active.message = format!(
                                "{} unresolved for {}m, escalated to {}",
                                rule.metric_name,
                                rule.escalation_minutes,
                                active.severity.as_str()
                            );
                            notifications.push(active.clone());
                        } else if severity > active.severity {
                            active.severity = severity;
                            active.threshold = threshold;
                            notifications.push(active.clone());
                        }
                    } else {
                        let suppressed = state.last_resolved.get(&rule.name).map_or(false, |t| {
                            now < *t + ChronoDuration::minutes(rule.suppression_minutes)
                        });
                        let direction = if rule.high_is_good { "below" } else { "at or above" };
                        let alert = AlertInstance {
                            id: Uuid::new_v4(),
                            rule_name: rule.name.clone(),
                            metric_name: rule.metric_name.clone(),
                            severity,
                            status: if suppressed {
                                AlertStatus::Suppressed
                            } else {
                                AlertStatus::Active
                            },
                            value,
                            threshold,
                            message: format!(
                                "{} is {:.2}, {} {} threshold {:.2}",
                                rule.metric_name,
                                value,
                                direction,
                                severity.as_str(),
                                threshold
                            ),
                            triggered_at: now,
                            escalated_at: None,
                            acknowledged_by: None,
                            acknowledged_at: None,
                            resolved_at: None,
                        };
                        if suppressed {
                            // Recorded but not delivered while the cooldown holds
                            if state.history.len() >= HISTORY_CAPACITY {
                                state.history.remove(0);
                            }
                            state.history.push(alert);
                        } else {
                            state.active.insert(rule.name.clone(), alert.clone());
                            notifications.push(alert);
                        }
                    }
                }
                None => {
                    if let Some(mut resolved) = state.active.remove(&rule.name) {
                        resolved.status = AlertStatus::Resolved;
                        resolved.value = value;
                        resolved.resolved_at = Some(now);
                        state.last_resolved.insert(rule.name.clone(), now);
                        if state.history.len() >= HISTORY_CAPACITY {
                            state.history.remove(0);
                        }
                        state.history.push(resolved.clone());
                        notifications.push(resolved);
                    }
                }
            }
        }

        self.export_gauges();
        for alert in notifications {
            for channel in &self.channels {
                channel.notify(&alert).await;
            }
        }
    }

    fn export_gauges(&self) {
        let state = self.state.read();
        for severity in [
            AlertSeverity::Warning,
            AlertSeverity::Critical,
            AlertSeverity::Emergency,
        ] {
            let count = state
                .active
                .values()
                .filter(|a| a.severity == severity)
                .count();
            metrics::set_active_alerts(severity.as_str(), count as i64);
        }
    }
}

fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            name: "api-response-time".to_string(),
            metric_name: "api_response_time".to_string(),
            warning_threshold: Some(1_000.0),
            critical_threshold: Some(5_000.0),
            emergency_threshold: Some(15_000.0),
            high_is_good: false,
            window_secs: 300,
            aggregation: AggregationMethod::Average,
            min_data_points: 3,
            suppression_minutes: 10,
            escalation_minutes: 30,
            enabled: true,
        },
        AlertRule {
            name: "api-availability".to_string(),
            metric_name: "api_availability".to_string(),
            warning_threshold: Some(0.95),
            critical_threshold: Some(0.80),
            emergency_threshold: Some(0.50),
            high_is_good: true,
            window_secs: 300,
            aggregation: AggregationMethod::Average,
            min_data_points: 5,
            suppression_minutes: 10,
            escalation_minutes: 30,
            enabled: true,
        },
        AlertRule {
            name: "processing-latency".to_string(),
            metric_name: "processing_latency".to_string(),
            warning_threshold: Some(5_000.0),
            critical_threshold: Some(30_000.0),
            emergency_threshold: Some(120_000.0),
            high_is_good: false,
            window_secs: 300,
            aggregation: AggregationMethod::Average,
            min_data_points: 3,
            suppression_minutes: 10,
            escalation_minutes: 30,
            enabled: true,
        },
        AlertRule {
            name: "model-accuracy".to_string(),
            metric_name: "model_accuracy".to_string(),
            warning_threshold: Some(0.85),
            critical_threshold: Some(0.70),
            emergency_threshold: Some(0.50),
            high_is_good: true,
            window_secs: 600,
            aggregation: AggregationMethod::Average,
            min_data_points: 5,
            suppression_minutes: 15,
            escalation_minutes: 60,
            enabled: true,
        },
    ]
}

/// Spawns the periodic evaluation loop
pub fn spawn_evaluation_loop(
    manager: Arc<AlertManager>,
    collector: Arc<MetricCollector>,
    interval_secs: u64,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => manager.evaluate(&collector).await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel {
        fired: AtomicUsize,
    }

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        fn name(&self) -> &str {
            "counting"
        }
        async fn notify(&self, _alert: &AlertInstance) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_rule(high_is_good: bool) -> AlertRule {
        AlertRule {
            name: "test-rule".to_string(),
            metric_name: "processing_latency".to_string(),
            warning_threshold: Some(500.0),
            critical_threshold: Some(800.0),
            emergency_threshold: Some(950.0),
            high_is_good,
            window_secs: 300,
            aggregation: AggregationMethod::Average,
            min_data_points: 1,
            suppression_minutes: 10,
            escalation_minutes: 30,
            enabled: true,
        }
    }

    fn manager_with_rule(rule: AlertRule) -> AlertManager {
        let manager = AlertManager::new(vec![]);
        manager.rules.write().clear();
        manager.add_rule(rule);
        manager
    }

    fn record_latency(collector: &MetricCollector, value: f64) {
        collector.record("processing_latency", value, StdHashMap::new());
    }

    #[tokio::test]
    async fn test_selects_highest_crossed_severity() {
        let collector = MetricCollector::new();
        record_latency(&collector, 900.0);

        let manager = manager_with_rule(test_rule(false));
        manager.evaluate(&collector).await;

        let active = manager.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, AlertSeverity::Critical);
        assert_eq!(active[0].threshold, 800.0);
    }

    #[tokio::test]
    async fn test_high_is_good_triggers_below_threshold() {
        let collector = MetricCollector::new();
        record_latency(&collector, 400.0);

        let manager = manager_with_rule(test_rule(true));
        manager.evaluate(&collector).await;

        // 400 is below all three thresholds, emergency wins
        let active = manager.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, AlertSeverity::Emergency);
    }

    #[tokio::test]
    async fn test_one_active_alert_per_rule() {
        let collector = MetricCollector::new();
        record_latency(&collector, 900.0);

        let channel = Arc::new(CountingChannel {
            fired: AtomicUsize::new(0),
        });
        let manager = AlertManager::new(vec![channel.clone()]);
        manager.rules.write().clear();
        manager.add_rule(test_rule(false));

        manager.evaluate(&collector).await;
        manager.evaluate(&collector).await;
        manager.evaluate(&collector).await;

        assert_eq!(manager.active_alerts().len(), 1);
        assert_eq!(channel.fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auto_resolve_and_suppression() {
        let collector = MetricCollector::new();
        record_latency(&collector, 900.0);

        let manager = manager_with_rule(test_rule(false));
        manager.evaluate(&collector).await;
        assert_eq!(manager.active_alerts().len(), 1);

        // Healthy values resolve the alert
        for _ in 0..20 {
            record_latency(&collector, 10.0);
        }
        manager.evaluate(&collector).await;
        assert!(manager.active_alerts().is_empty());
        assert_eq!(manager.history().len(), 1);
        assert_eq!(manager.history()[0].status, AlertStatus::Resolved);

        // Firing again inside the suppression window opens no active
        // alert; the occurrence lands in history as SUPPRESSED
        for _ in 0..40 {
            record_latency(&collector, 2_000.0);
        }
        manager.evaluate(&collector).await;
        assert!(manager.active_alerts().is_empty());
        assert_eq!(manager.history().len(), 2);
        assert_eq!(manager.history()[1].status, AlertStatus::Suppressed);
    }

    #[tokio::test]
    async fn test_acknowledged_alert_skips_escalation() {
        let collector = MetricCollector::new();
        record_latency(&collector, 600.0);

        let manager = manager_with_rule(test_rule(false));
        manager.evaluate(&collector).await;
        assert!(manager.acknowledge("test-rule", "oncall"));

        {
            let mut state = manager.state.write();
            let alert = state.active.get_mut("test-rule").unwrap();
            alert.triggered_at = Utc::now() - ChronoDuration::minutes(31);
        }
        manager.evaluate(&collector).await;

        let active = manager.active_alerts();
        assert_eq!(active[0].severity, AlertSeverity::Warning);
        assert_eq!(active[0].status, AlertStatus::Acknowledged);
        assert!(active[0].escalated_at.is_none());
    }

    #[tokio::test]
    async fn test_escalation_after_deadline() {
        let collector = MetricCollector::new();
        record_latency(&collector, 600.0);

        let mut rule = test_rule(false);
        rule.escalation_minutes = 30;
        let manager = manager_with_rule(rule);
        manager.evaluate(&collector).await;
        assert_eq!(manager.active_alerts()[0].severity, AlertSeverity::Warning);

        // Backdate the trigger past the escalation deadline
        {
            let mut state = manager.state.write();
            let alert = state.active.get_mut("test-rule").unwrap();
            alert.triggered_at = Utc::now() - ChronoDuration::minutes(31);
        }
        manager.evaluate(&collector).await;

        let active = manager.active_alerts();
        assert_eq!(active[0].severity, AlertSeverity::Critical);
        assert!(active[0].escalated_at.is_some());
    }

    #[tokio::test]
    async fn test_log_channel_handles_every_status() {
        let channel = LogChannel;
        let mut alert = AlertInstance {
            id: Uuid::new_v4(),
            rule_name: "test-rule".to_string(),
            metric_name: "processing_latency".to_string(),
            severity: AlertSeverity::Warning,
            status: AlertStatus::Active,
            value: 600.0,
            threshold: 500.0,
            message: "latency above threshold".to_string(),
            triggered_at: Utc::now(),
            escalated_at: None,
            acknowledged_by: Some("oncall".to_string()),
            acknowledged_at: None,
            resolved_at: None,
        };

        for status in [
            AlertStatus::Active,
            AlertStatus::Acknowledged,
            AlertStatus::Suppressed,
            AlertStatus::Resolved,
        ] {
            alert.status = status;
            channel.notify(&alert).await;
        }
    }

    #[tokio::test]
    async fn test_min_data_points_gate() {
        let collector = MetricCollector::new();
        record_latency(&collector, 10_000.0);

        let mut rule = test_rule(false);
        rule.min_data_points = 3;
        let manager = manager_with_rule(rule);
        manager.evaluate(&collector).await;
        assert!(manager.active_alerts().is_empty());
    }
}
