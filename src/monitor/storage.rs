//! Monitoring persistence
//!
//! Optional Postgres layer for metric samples and alert history. The service
//! runs fine without it; callers only construct one when a database URL is
//! configured.

use anyhow::Result;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::alerts::{AlertInstance, AlertRule};
use super::collector::MetricDataPoint;

/// Persists monitoring data to Postgres
#[derive(Clone)]
pub struct MonitorStorage {
    db: PgPool,
}

impl MonitorStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to monitoring database...");
        let db = PgPool::connect(database_url).await?;
        let storage = Self { db };
        storage.ensure_schema().await?;
        info!("Monitoring storage initialized");
        Ok(storage)
    }

    /// Creates the monitoring tables when missing
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performance_metrics (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                tags JSONB NOT NULL DEFAULT '{}'::jsonb,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_performance_metrics_name_time
            ON performance_metrics (name, recorded_at)
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_rules (
                name TEXT PRIMARY KEY,
                definition JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_instances (
                id UUID PRIMARY KEY,
                rule_name TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                threshold DOUBLE PRECISION NOT NULL,
                message TEXT NOT NULL,
                triggered_at TIMESTAMPTZ NOT NULL,
                escalated_at TIMESTAMPTZ,
                resolved_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Stores a batch of metric samples
    pub async fn store_metrics(&self, points: &[MetricDataPoint]) -> Result<()> {
        debug!(count = points.len(), "Storing metric samples");
        for point in points {
            sqlx::query(
                r#"
                INSERT INTO performance_metrics (name, value, tags, recorded_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&point.name)
            .bind(point.value)
            .bind(serde_json::to_value(&point.tags)?)
            .bind(point.timestamp)
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    /// Upserts the current rule set so restarts pick up operator edits
    pub async fn store_rules(&self, rules: &[AlertRule]) -> Result<()> {
        for rule in rules {
            sqlx::query(
                r#"
                INSERT INTO alert_rules (name, definition, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (name) DO UPDATE SET
                    definition = EXCLUDED.definition,
                    updated_at = NOW()
                "#,
            )
            .bind(&rule.name)
            .bind(serde_json::to_value(rule)?)
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    /// Loads the persisted rule set
    pub async fn load_rules(&self) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query("SELECT definition FROM alert_rules")
            .fetch_all(&self.db)
            .await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let definition: serde_json::Value = row.try_get("definition")?;
            rules.push(serde_json::from_value(definition)?);
        }
        Ok(rules)
    }

    /// Upserts an alert so escalations and resolution update in place
    pub async fn store_alert(&self, alert: &AlertInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_instances
                (id, rule_name, metric_name, severity, status, value, threshold,
                 message, triggered_at, escalated_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                severity = EXCLUDED.severity,
                status = EXCLUDED.status,
                value = EXCLUDED.value,
                message = EXCLUDED.message,
                escalated_at = EXCLUDED.escalated_at,
                resolved_at = EXCLUDED.resolved_at
            "#,
        )
        .bind(alert.id)
        .bind(&alert.rule_name)
        .bind(&alert.metric_name)
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(alert.value)
        .bind(alert.threshold)
        .bind(&alert.message)
        .bind(alert.triggered_at)
        .bind(alert.escalated_at)
        .bind(alert.resolved_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Trims metric rows older than the retention horizon
    pub async fn prune_metrics(&self, retention_secs: u64) -> Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(retention_secs as i64);
        let result = sqlx::query("DELETE FROM performance_metrics WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Count of unresolved alerts, for status reporting
    pub async fn active_alert_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM alert_instances WHERE status = 'ACTIVE'")
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}
