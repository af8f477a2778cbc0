use anyhow::{Context, Result};
use labmon_relay::{
    api::{start_api_server, AppState},
    open_camera, ActivityTracker, Config, ExpiryScheduler, FieldConfig, FieldMapper,
    HandlerSettings, HttpNotifier, IdleWatchdog, ImagePipeline, PacketHandler, PgStore,
    RecordKind, RelayServer, RelayStats,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        listen = %config.listen_addr(),
        "Starting lab monitor relay"
    );

    let field_config = FieldConfig::load(&config.fields.path, &config.fields.fallback_path)
        .context("Failed to load field configuration")?;
    info!(
        sensor_keys = field_config.valid_keys(RecordKind::Sensor).len(),
        model_keys = field_config.valid_keys(RecordKind::Model).len(),
        "Field configuration loaded"
    );

    // Initialize metrics
    if config.service.metrics_port > 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let cancel = CancellationToken::new();

    // The database must be reachable before the relay starts serving
    let connect = PgStore::connect_with_retry(config.database.clone(), &cancel);
    let store = tokio::select! {
        store = connect => Arc::new(store.context("Failed to connect to database")?),
        _ = shutdown_signal() => {
            info!("Shutdown requested before database became available");
            return Ok(());
        }
    };

    // Initialize components
    let camera = open_camera(&config.camera);
    let images = Arc::new(
        ImagePipeline::new(&config.images, camera, config.camera.timeout())
            .context("Failed to prepare image directory")?,
    );
    let notifier = Arc::new(HttpNotifier::new(&config.notify).context("Failed to build HTTP client")?);
    let activity = Arc::new(ActivityTracker::new());
    let stats = Arc::new(RelayStats::default());
    let (expiry, expiry_handle) = ExpiryScheduler::spawn(cancel.clone());

    let handler = PacketHandler::new(
        FieldMapper::new(field_config),
        images.clone(),
        store.clone(),
        expiry.clone(),
        notifier.clone(),
        activity.clone(),
        stats.clone(),
        HandlerSettings {
            image_ttl: config.image_ttl(),
            capture_on_reading: config.images.capture_on_reading,
        },
    );
    let server = RelayServer::bind(&config.listener, handler, config.supervisor_pause())
        .await
        .with_context(|| format!("Failed to bind UDP listener on {}", config.listen_addr()))?;

    // Spawn idle watchdog task
    let watchdog_handle = config.idle_threshold().map(|threshold| {
        let watchdog = IdleWatchdog::new(
            images.clone(),
            store.clone(),
            expiry.clone(),
            notifier.clone(),
            activity.clone(),
            threshold,
            config.watchdog_poll_interval(),
            config.image_ttl(),
        );
        tokio::spawn(watchdog.run(cancel.clone()))
    });

    // Spawn API server task
    let api_handle = config.api.enabled.then(|| {
        let state = AppState {
            service_name: config.service.name.clone(),
            sink: store.clone(),
            stats: stats.clone(),
            activity: activity.clone(),
        };
        let api_config = config.api.clone();
        let api_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(state, &api_config, api_cancel).await {
                error!(error = %e, "API server error");
            }
        })
    });

    // Spawn receive loop
    let server_handle = tokio::spawn(server.run(cancel.clone()));

    info!("Relay started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down relay");
    cancel.cancel();

    let _ = server_handle.await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }
    drop(expiry);
    let _ = expiry_handle.await;

    info!("Relay stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
