//! Pulse Ingestion Service
//! Multi-platform social media event ingestion and processing pipeline
//!
//! Features:
//! - Platform adapters (TikTok, Meta, YouTube, Reddit, RSS) with OAuth and
//!   rate-limit/backoff handling
//! - Canonical event schema with per-platform normalization rules
//! - Content-fingerprint deduplication with a sliding time window
//! - Partitioned, replayable event bus (Redis Streams / in-memory) with
//!   dead-letter routing
//! - Prometheus metrics, component health checks, threshold alerting with
//!   escalation
//! - Graceful shutdown with SIGTERM handling

mod adapters;
mod bus;
mod circuit_breaker;
mod config;
mod dedup;
mod error;
mod http_client;
mod ingestion;
mod monitor;
mod normalize;
mod schemas;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bus::{create_bus, BusConfig, ReplayFilter, StreamingBus, Topic};
use crate::config::Config;
use crate::dedup::{DedupConfig, DedupEngine};
use crate::ingestion::IngestionService;
use crate::monitor::{AlertManager, HealthChecker, LogChannel, MetricCollector};
use crate::schemas::Platform;

/// Pulse Ingestion Service - social media event pipeline
#[derive(Parser, Debug)]
#[command(name = "pulse-ingestion")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-platform social media event ingestion and processing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the ingestion service (continuous cycles)
    Run,

    /// Run a single ingestion cycle and print the summary
    Ingest {
        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        output: String,
    },

    /// Show configured platforms and bus health
    Status,

    /// Replay historical messages from a topic
    Replay {
        /// Topic to replay (raw-events, normalized-events, processed-events, dead-letter)
        #[arg(short, long, default_value = "normalized-events")]
        topic: String,

        /// Restrict to one partition
        #[arg(short, long)]
        partition: Option<u32>,

        /// Replay messages newer than this RFC3339 timestamp
        #[arg(long)]
        from: Option<String>,

        /// Replay messages from this duration ago (e.g. "1h", "30m", "2d");
        /// ignored when --from is given
        #[arg(long)]
        since: Option<String>,

        /// Replay messages older than this RFC3339 timestamp
        #[arg(long)]
        to: Option<String>,

        /// Restrict to one platform (tiktok, meta, youtube, reddit, rss)
        #[arg(long)]
        platform: Option<String>,

        /// Maximum messages to replay
        #[arg(short = 'n', long, default_value = "100")]
        limit: usize,

        /// Publish matches onto the replay topic instead of printing them
        #[arg(long, default_value = "false")]
        publish: bool,
    },
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Handles graceful shutdown on SIGTERM/SIGINT
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    let _ = shutdown_tx.send(());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Pulse Ingestion Service"
    );

    let config = Config::load()?;
    info!(
        bus_type = %config.bus_type,
        partitions = config.topic_partitions,
        interval_ms = config.ingest_interval_ms,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Run => run_service(config).await?,
        Commands::Ingest { output } => ingest_once(config, &output).await?,
        Commands::Status => show_status(config).await?,
        Commands::Replay {
            topic,
            partition,
            from,
            since,
            to,
            platform,
            limit,
            publish,
        } => {
            replay(
                config, &topic, partition, from, since, to, platform, limit, publish,
            )
            .await?
        }
    }

    Ok(())
}

/// Builds the bus from configuration
async fn connect_bus(config: &Config) -> Result<Arc<dyn StreamingBus>> {
    let bus_config = BusConfig {
        prefix: config.topic_prefix.clone(),
        partitions: config.topic_partitions,
        producer_id: config.producer_id.clone(),
        ..BusConfig::default()
    }
    .with_uniform_retention(Some(config.topic_retention_max_len));
    let redis_url = config.redis_url.as_deref().unwrap_or("");
    let bus = create_bus(&config.bus_type, redis_url, bus_config).await?;
    Ok(bus)
}

/// Builds the dedup engine, mirroring fingerprints to Redis when available
async fn build_dedup(config: &Config) -> Result<DedupEngine> {
    let dedup_config = DedupConfig {
        cache_size: config.dedup_cache_size,
        default_window_secs: config.dedup_window_secs.max(0) as u64,
        redis_ttl_secs: config.dedup_retention_secs,
        ..Default::default()
    };

    if let Some(url) = config.redis_url.as_deref() {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(DedupEngine::with_redis(dedup_config, conn))
    } else {
        Ok(DedupEngine::new(dedup_config))
    }
}

/// Runs the full service: ingestion cycles, metrics server, alert loop
async fn run_service(config: Config) -> Result<()> {
    let bus = connect_bus(&config).await?;
    bus.create_topics().await?;
    info!(bus_type = bus.bus_type(), "Event bus ready");

    let dedup = Arc::new(build_dedup(&config).await?);
    let service = Arc::new(IngestionService::new(config.clone(), bus, dedup.clone())?);

    if service.platforms().is_empty() {
        warn!("No platforms configured, service will idle");
    } else {
        info!(platforms = ?service.platforms(), "Platform adapters ready");
    }

    let shutdown_tx = service.shutdown_sender();

    // Observability stack
    let collector = Arc::new(MetricCollector::new());
    let health = Arc::new(HealthChecker::new(collector.clone()));
    let alert_manager = Arc::new(AlertManager::new(vec![Arc::new(LogChannel)]));

    monitor::collector::spawn_system_sampler(
        collector.clone(),
        config.system_collection_interval_secs,
        shutdown_tx.subscribe(),
    );
    monitor::alerts::spawn_evaluation_loop(
        alert_manager.clone(),
        collector.clone(),
        config.alert_evaluation_interval_secs,
        shutdown_tx.subscribe(),
    );

    // Monitoring persistence, when a database is configured. Failures are
    // non-fatal; the in-memory stack keeps running either way.
    if let Some(db_url) = config.database_url.as_deref() {
        match monitor::storage::MonitorStorage::connect(db_url).await {
            Ok(storage) => {
                match storage.load_rules().await {
                    Ok(rules) => {
                        for rule in rules {
                            alert_manager.add_rule(rule);
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to load persisted alert rules"),
                }
                if let Err(e) = storage.store_rules(&alert_manager.rules()).await {
                    warn!(error = %e, "Failed to persist alert rules");
                }

                let collector = collector.clone();
                let alert_manager = alert_manager.clone();
                let interval_secs = config.alert_evaluation_interval_secs;
                let retention_secs: u64 = 30 * 86_400;
                let mut shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let mut interval =
                        tokio::time::interval(std::time::Duration::from_secs(interval_secs));
                    let mut last_flush = chrono::Utc::now();
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            _ = interval.tick() => {
                                let now = chrono::Utc::now();
                                let points = collector.points_since(last_flush);
                                last_flush = now;
                                if let Err(e) = storage.store_metrics(&points).await {
                                    warn!(error = %e, "Metric persistence failed");
                                }
                                for alert in alert_manager.active_alerts() {
                                    if let Err(e) = storage.store_alert(&alert).await {
                                        warn!(error = %e, "Alert persistence failed");
                                    }
                                }
                                for alert in alert_manager.history() {
                                    if let Err(e) = storage.store_alert(&alert).await {
                                        warn!(error = %e, "Alert persistence failed");
                                    }
                                }
                                if let Err(e) = storage.prune_metrics(retention_secs).await {
                                    warn!(error = %e, "Metric pruning failed");
                                }
                            }
                        }
                    }
                });
                info!("Monitoring persistence enabled");
            }
            Err(e) => warn!(error = %e, "Monitoring persistence disabled"),
        }
    }

    if config.metrics_enabled {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
        let metrics_health = health.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor::metrics::start_metrics_server(metrics_addr, metrics_health).await
            {
                error!(error = %e, "Metrics server failed");
            }
        });
        info!(port = config.metrics_port, "Metrics server started at /metrics and /health");
    }

    // Periodic dedup cache pruning
    {
        let dedup = dedup.clone();
        let retention = config.dedup_retention_secs;
        let interval_secs = config.dedup_flush_interval_secs;
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        let removed = dedup.prune(retention);
                        if removed > 0 {
                            info!(removed, "Pruned stale dedup fingerprints");
                        }
                    }
                }
            }
        });
    }

    // Shutdown handler
    let shutdown_service = service.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal(shutdown_tx).await;
        shutdown_service.shutdown();
    });

    if let Err(e) = service.run().await {
        error!(error = %e, "Ingestion service failed");
        return Err(e.into());
    }

    let _ = shutdown_handle.await;
    info!("Pulse Ingestion Service stopped");
    Ok(())
}

/// Runs one cycle and prints the summary
async fn ingest_once(config: Config, output: &str) -> Result<()> {
    let bus = connect_bus(&config).await?;
    bus.create_topics().await?;
    let dedup = Arc::new(build_dedup(&config).await?);
    let service = IngestionService::new(config, bus, dedup)?;

    let summary = service.ingest_cycle().await?;

    match output {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => {
            println!("\nIngestion Summary");
            println!("=================");
            println!("Events:     {}", summary.total_events);
            println!("Errors:     {}", summary.total_errors);
            println!("Duration:   {}ms", summary.processing_time_ms);
            if !summary.events_by_platform.is_empty() {
                println!("\nBy Platform:");
                for (platform, count) in &summary.events_by_platform {
                    let dupes = summary.duplicates_by_platform.get(platform).unwrap_or(&0);
                    println!("  - {}: {} events, {} duplicates", platform, count, dupes);
                }
            }
            if !summary.failed_platforms.is_empty() {
                println!("\nFailed Platforms:");
                for platform in &summary.failed_platforms {
                    let errors = summary.errors_by_platform.get(platform).unwrap_or(&0);
                    println!("  - {}: {} errors", platform, errors);
                }
            }
        }
    }

    Ok(())
}

/// Shows configured platforms and transport health
async fn show_status(config: Config) -> Result<()> {
    println!("\nPulse Ingestion Service Status");
    println!("==============================\n");

    println!("Configured Platforms:");
    println!(
        "  - TikTok:  {}",
        if config.has_tiktok() { "yes" } else { "no (missing credentials)" }
    );
    println!(
        "  - Meta:    {}",
        if config.has_meta() { "yes" } else { "no (missing access token)" }
    );
    println!(
        "  - YouTube: {}",
        if config.has_youtube() { "yes" } else { "no (missing API key)" }
    );
    println!(
        "  - Reddit:  {}",
        if config.has_reddit() { "yes" } else { "no (missing credentials)" }
    );
    println!(
        "  - RSS:     {}",
        if config.has_rss() {
            format!("yes ({} feeds)", config.rss_feeds().len())
        } else {
            "no (no feed URLs)".to_string()
        }
    );

    println!("\nEvent Bus:");
    println!("  Type:       {}", config.bus_type);
    println!("  Prefix:     {}", config.topic_prefix);
    println!("  Partitions: {}", config.topic_partitions);

    match connect_bus(&config).await {
        Ok(bus) => {
            let healthy = bus.is_healthy().await;
            println!("  Healthy:    {}", if healthy { "yes" } else { "NO" });
        }
        Err(e) => println!("  Healthy:    NO ({})", e),
    }

    Ok(())
}

/// Replays historical messages from a topic, to stdout or onto the
/// replay topic
#[allow(clippy::too_many_arguments)]
async fn replay(
    config: Config,
    topic: &str,
    partition: Option<u32>,
    from: Option<String>,
    since: Option<String>,
    to: Option<String>,
    platform: Option<String>,
    limit: usize,
    publish: bool,
) -> Result<()> {
    let topic: Topic = topic.parse()?;
    let platform = platform
        .as_deref()
        .map(|p| p.parse::<Platform>())
        .transpose()?;
    let from = match (&from, &since) {
        (Some(from), _) => Some(
            chrono::DateTime::parse_from_rfc3339(from)?.with_timezone(&chrono::Utc),
        ),
        (None, Some(since)) => {
            let duration = humantime::parse_duration(since)?;
            Some(chrono::Utc::now() - chrono::Duration::from_std(duration)?)
        }
        (None, None) => None,
    };
    let to = to
        .as_deref()
        .map(chrono::DateTime::parse_from_rfc3339)
        .transpose()?
        .map(|t| t.with_timezone(&chrono::Utc));

    let bus = connect_bus(&config).await?;
    let filter = ReplayFilter {
        partition,
        from,
        to,
        platform,
        limit: Some(limit),
    };

    if publish {
        let count =
            bus::replay_into_topic(bus.as_ref(), &config.producer_id, topic, filter).await?;
        println!("Replayed {} messages onto {}", count, Topic::Replay);
    } else {
        let messages = bus.replay(topic, filter).await?;
        info!(topic = %topic, count = messages.len(), "Replay complete");
        for message in &messages {
            println!("{}", serde_json::to_string(message)?);
        }
    }

    Ok(())
}
