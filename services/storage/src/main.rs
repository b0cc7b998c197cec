use anyhow::{Context, Result};
use pixora_pipeline::{memory_topic, EventConsumer, EventProducer};
use pixora_storage::config::{BrokerKind, EngagementStoreKind};
use pixora_storage::engagement::PgEngagementLog;
use pixora_storage::storage::database;
use pixora_storage::{
    start_api_server, AppState, Config, EngagementAggregator, EngagementLog, EventDispatcher,
    LifecycleHandlers, Storage,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Pixora Storage Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Resolve backends before building anything
    let backends = config.backends().context("Invalid backend configuration")?;
    info!(
        broker = ?backends.broker,
        blob = ?backends.blob,
        metadata = ?backends.metadata,
        engagement_store = ?backends.engagement_store,
        locking_strategy = %backends.locking_strategy,
        "Resolved backends"
    );

    let pool = if backends.needs_database() {
        let pool = database::connect(&config.database).await?;
        if config.database.run_migrations {
            database::run_migrations(&pool).await?;
        }
        Some(pool)
    } else {
        None
    };

    let storage = Storage::from_config(&config, backends.blob, backends.metadata, pool.as_ref())
        .await
        .context("Failed to build storage")?;
    storage
        .initialize()
        .await
        .context("Failed to initialize storage")?;

    let log = match (backends.engagement_store, pool) {
        (EngagementStoreKind::Postgres, Some(pool)) => EngagementLog::Postgres(PgEngagementLog::new(pool)),
        (EngagementStoreKind::Postgres, None) => {
            anyhow::bail!("Postgres engagement store needs a database pool")
        }
        (EngagementStoreKind::Memory, _) => EngagementLog::in_memory(),
    };

    let aggregator = Arc::new(EngagementAggregator::new(
        log,
        backends.locking_strategy,
        config.lock_timeout(),
        config.operation_timeout(),
    ));

    let (producer, consumer) = match backends.broker {
        BrokerKind::Kafka => (
            EventProducer::new(&config.kafka).context("Failed to create Kafka producer")?,
            EventConsumer::new(&config.kafka).context("Failed to create Kafka consumer")?,
        ),
        BrokerKind::Memory => {
            warn!("Using the in-memory broker; events do not survive a restart");
            let (writer, reader) = memory_topic(config.kafka.topic.clone());
            (EventProducer::in_memory(writer), EventConsumer::in_memory(reader))
        }
    };

    let dispatcher = Arc::new(EventDispatcher::new(
        LifecycleHandlers::new(storage.clone()),
        aggregator.clone(),
    ));

    let consumer = Arc::new(consumer);
    let consumer_handle = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            match consumer.run(dispatcher).await {
                Ok(summary) => info!(
                    consumed = summary.consumed,
                    dispatched = summary.dispatched,
                    malformed = summary.malformed,
                    failed = summary.failed,
                    "Consumer stopped"
                ),
                Err(e) => error!(error = %e, "Consumer error"),
            }
        })
    };

    let api_state = AppState {
        producer: Arc::new(producer),
        storage,
        aggregator,
    };

    let (stop_api, api_stopped) = oneshot::channel::<()>();
    let api_config = config.api.clone();
    let body_limit = config.upload_body_limit();
    let api_handle = tokio::spawn(async move {
        let shutdown = async {
            let _ = api_stopped.await;
        };
        if let Err(e) = start_api_server(api_state, &api_config, body_limit, shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Storage service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down storage service");

    // Stop fetching; the handler in flight finishes first
    consumer.shutdown();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Consumer task failed");
    }

    // Drain in-flight requests, then the producer drops with the router
    let _ = stop_api.send(());
    if let Err(e) = api_handle.await {
        error!(error = %e, "API task failed");
    }

    info!("Storage service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
