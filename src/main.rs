//! Presence engine - live "who is where" picture for one attendance day
//!
//! Polls the attendance provider for changes, rebuilds the day's markers and
//! zone overlays on change, and fans snapshots out to file and MQTT.
//!
//! Module structure:
//! - `domain/` - Core types (locations, cycles, zones, snapshots, errors)
//! - `io/` - External interfaces (provider, update channel, egress, MQTT, Prometheus)
//! - `services/` - Business logic (parsing, cycles, dedup, overlay, poller)
//! - `infra/` - Infrastructure (Config, Metrics)

use chrono::{Local, NaiveDate};
use clap::Parser;
use presence_engine::domain::types::SubscriptionKey;
use presence_engine::infra::{load_zones_file, Config, Metrics};
use presence_engine::io::{
    create_update_channel, Egress, HttpProvider, MqttPublisher, PresenceUpdate,
};
use presence_engine::services::{
    create_poller, DedupParams, Deduplicator, PollSettings, SnapshotBuilder,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Presence engine - follows one (date, tenant) attendance subscription
#[derive(Parser, Debug)]
#[command(name = "presence-engine", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Day to follow (YYYY-MM-DD); defaults to the config value, then today
    #[arg(short, long)]
    date: Option<NaiveDate>,

    /// Tenant to follow; overrides the config value
    #[arg(short, long)]
    tenant: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(git_hash = env!("GIT_HASH"), "presence-engine starting");

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path).with_subscription(args.date, args.tenant);

    let date = config.date().unwrap_or_else(|| Local::now().date_naive());
    let key = SubscriptionKey::new(date, config.tenant());

    info!(
        config_file = %config.config_file(),
        provider = %config.provider_base_url(),
        key = %key,
        poll_interval_ms = %config.poll_interval_ms(),
        failure_ceiling = %config.failure_ceiling(),
        mqtt_enabled = %config.mqtt_enabled(),
        egress_enabled = %config.egress_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Poller: provider -> snapshot builder -> update channel
    let provider = Arc::new(HttpProvider::from_config(&config)?);
    let builder = SnapshotBuilder::new(Deduplicator::new(DedupParams::from(&config)));
    let (update_tx, mut update_rx) = create_update_channel(config.update_buffer(), metrics.clone());
    let (handle, poller) = create_poller(
        provider,
        PollSettings::from(&config),
        builder,
        update_tx,
        metrics.clone(),
    );
    let poller_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        poller.run(poller_shutdown).await;
    });

    // Zones from file are applied before the first tick
    if let Some(path) = config.zones_file() {
        match load_zones_file(path) {
            Ok(zones) => {
                info!(file = %path, zones = zones.len(), "zones_file_loaded");
                handle.reload_zones(zones).await;
            }
            Err(e) => warn!(error = %format!("{e:#}"), "zones_file_load_failed"),
        }
    }

    handle.start(key).await;

    // MQTT publisher (if enabled)
    let mqtt_tx = if config.mqtt_enabled() {
        let (tx, rx) = mpsc::channel(config.update_buffer().max(1));
        let publisher = MqttPublisher::new(&config, rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        Some(tx)
    } else {
        None
    };

    let egress = config.egress_enabled().then(|| Egress::new(config.egress_file()));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_tenant = config.tenant().to_string();
        let prom_status = handle.subscribe();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = presence_engine::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_tenant,
                prom_status,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads, windowed summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Fan updates out to sinks until the poller exits and the channel closes
    while let Some(update) = update_rx.recv().await {
        match &update {
            PresenceUpdate::Snapshot(snapshot) => {
                if let Some(egress) = &egress {
                    egress.write_snapshot(snapshot);
                }
            }
            PresenceUpdate::Loading { key, loading } => {
                debug!(key = %key, loading = loading, "loading_changed")
            }
            PresenceUpdate::Degraded { key, staleness } => warn!(
                key = %key,
                consecutive_failures = %staleness.consecutive_failures,
                last_success_at = ?staleness.last_success_at,
                "subscription_degraded"
            ),
        }
        if let Some(tx) = &mqtt_tx {
            // Status signals wait for the publisher; a later snapshot supersedes a dropped one
            if update.is_control() {
                let _ = tx.send(update).await;
            } else if tx.try_send(update).is_err() {
                metrics.record_update_dropped();
            }
        }
    }

    info!(status = ?handle.status().phase, "presence-engine shutdown complete");
    Ok(())
}
