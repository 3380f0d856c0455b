//! petgate - pet door admission and collar trust service
//!
//! Module structure:
//! - `domain/` - Core types (policies, devices, geofences, notifications)
//! - `io/` - External interfaces (device API, journal, frames, MQTT, Prometheus)
//! - `services/` - Business logic (admission, trust, telemetry, geofences)
//! - `infra/` - Infrastructure (Config, Metrics, Clock, Storage)

use clap::Parser;
use petgate::infra::{Clock, Config, MemoryStore, Metrics, SystemClock};
use petgate::io::{
    start_device_api, ApiState, EventJournal, FirmwareFiles, ImageStore, MqttTransport,
};
use petgate::services::notifier::DisabledNotifier;
use petgate::services::{
    create_notification_channel, AdmissionEngine, AnimalRegistry, DeviceTrustVerifier,
    FirmwareCatalog, GeofencePolicySync, NotificationWorker, Notifier, TelemetryIngest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Pet door admission and collar trust service
#[derive(Parser, Debug)]
#[command(name = "petgate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "petgate starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        image_dir = %config.image_dir(),
        journal_file = %config.journal_file(),
        default_threshold = config.default_threshold(),
        replay_window_secs = config.replay_window_secs(),
        notify_enabled = config.notify_enabled(),
        api_port = config.api_port(),
        owner_api = config.admin_token().is_some(),
        prometheus_port = config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let journal = Arc::new(EventJournal::open(config.journal_file())?);
    // Journaled crossings outlive their devices and fences; never reissue those ids
    let store = Arc::new(
        MemoryStore::new()
            .with_policy_defaults(config.default_threshold(), config.default_auto_close_secs())
            .with_id_floor(journal.id_floor()),
    );
    let images = Arc::new(ImageStore::new(config.image_dir()));

    // Notification queue and delivery worker
    let mut worker_handle = None;
    let notifier: Arc<dyn Notifier> = if config.notify_enabled() {
        let (sender, rx) = create_notification_channel(config.notify_queue_size(), metrics.clone());
        let worker = NotificationWorker::new(
            rx,
            store.clone(),
            Arc::new(MqttTransport::new(&config)),
            clock.clone(),
            metrics.clone(),
            Duration::from_millis(config.notify_send_timeout_ms()),
        );
        let worker_shutdown = shutdown_rx.clone();
        worker_handle = Some(tokio::spawn(async move {
            worker.run(worker_shutdown).await;
        }));
        Arc::new(sender)
    } else {
        Arc::new(DisabledNotifier)
    };

    let admission = Arc::new(AdmissionEngine::new(
        store.clone(),
        journal.clone(),
        store.clone(),
        images,
        notifier.clone(),
        clock.clone(),
        metrics.clone(),
    ));
    let trust = Arc::new(DeviceTrustVerifier::new(
        store.clone(),
        store.clone(),
        clock.clone(),
        metrics.clone(),
        config.replay_window_secs(),
    ));
    let telemetry =
        Arc::new(TelemetryIngest::new(store.clone(), store.clone(), clock.clone(), metrics.clone()));
    let geofences = Arc::new(GeofencePolicySync::new(
        store.clone(),
        store.clone(),
        store.clone(),
        journal,
        notifier,
        clock.clone(),
        metrics.clone(),
    ));
    let registry = Arc::new(AnimalRegistry::new(store.clone(), store.clone()));
    let firmware = Arc::new(FirmwareCatalog::new(
        store.clone(),
        store.clone(),
        Arc::new(FirmwareFiles::new(config.image_dir())),
        clock.clone(),
    ));

    // Device-facing HTTP API (if port > 0)
    let api_port = config.api_port();
    if api_port > 0 {
        let state = Arc::new(ApiState {
            admission,
            trust,
            telemetry,
            geofences,
            registry,
            firmware,
            devices: store.clone(),
            preferences: store.clone(),
            clock,
            admin_token: config.admin_token().map(str::to_string),
        });
        let api_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_device_api(api_port, state, api_shutdown).await {
                tracing::error!(error = %e, "Device API server error");
            }
        });
    }

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        let site_id = config.site_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = petgate::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                site_id,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Let the worker drain what was already queued
    if let Some(handle) = worker_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    info!(admissions = metrics.admissions_total(), "petgate shutdown complete");
    Ok(())
}
