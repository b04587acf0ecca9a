//! Pipeline observability
//!
//! Four layers: Prometheus counters exported over HTTP ([`metrics`]),
//! an in-memory time-series collector feeding health and alerting
//! ([`collector`]), component health rollups ([`health`]), and threshold
//! alert rules with escalation ([`alerts`]). Optional Postgres persistence
//! lives in [`storage`].

pub mod alerts;
pub mod collector;
pub mod health;
pub mod metrics;
pub mod storage;

pub use alerts::{AlertManager, LogChannel};
pub use collector::MetricCollector;
pub use health::HealthChecker;
