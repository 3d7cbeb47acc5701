//! Tenantbus Worker
//!
//! Runs the outbox dispatcher and the queue processor side by side:
//! - dispatcher: claims pending outbox rows of every active tenant and
//!   publishes them as queue envelopes
//! - processor: consumes the configured queues and routes each envelope
//!   to its handler, poisoning what cannot be processed
//!
//! Configuration comes from `TB_CONFIG` (TOML) and `TB_*` overrides; see
//! `tb-config`. Metrics and health are served on `TB_METRICS_PORT`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use tb_common::QueueEnvelope;
use tb_config::{AppConfig, QueueBackend, QueueSettings};
use tb_outbox::{DispatcherConfig, OutboxDispatcher, PgOutboxStore};
use tb_processor::{HandlerRegistry, ProcessorConfig, QueueMessageHandler, QueueProcessor, SampleHandler};
use tb_queue::{EnvelopePublisher, MemoryQueue, QueueClient, QueueNaming, SqliteQueue, SqsQueue};
use tb_tenancy::{PgTenantCatalog, TenantCatalog, TenantConnectionProvider};

/// Tenantbus outbox dispatcher and queue processor
#[derive(Parser, Debug)]
#[command(name = "tb-worker")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "TB_CONFIG")]
    config: Option<PathBuf>,

    /// Create the catalog and outbox schemas before starting
    #[arg(long, env = "TB_INIT_SCHEMA", default_value = "false")]
    init_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tb_common::logging::init_logging();

    let args = Args::parse();
    let config = AppConfig::load_from(args.config.as_deref(), |key| std::env::var(key).ok())
        .context("Failed to load configuration")?;

    info!("Starting Tenantbus Worker");

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Tenancy
    let connections = Arc::new(TenantConnectionProvider::new(config.postgres.clone()));
    let catalog_pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections.max(1))
        .connect_lazy_with(connections.factory().catalog());
    let catalog = Arc::new(PgTenantCatalog::new(catalog_pool));

    if args.init_schema {
        init_schemas(&catalog, &connections).await?;
    }

    // Queues
    let queue_client = create_queue_client(&config.queues).await?;
    let naming = QueueNaming::new(&config.queues.prefix);
    info!(backend = queue_client.identifier(), prefix = %config.queues.prefix, "Queue client initialized");

    let publisher = EnvelopePublisher::new(queue_client.clone(), naming.clone())
        .with_poison_ttl(config.queue_processor.poison_message_ttl());

    let dispatcher = OutboxDispatcher::new(
        catalog.clone(),
        Arc::new(PgOutboxStore::new(connections.clone(), config.outbox_dispatcher.lease())),
        Arc::new(publisher),
        DispatcherConfig::from(&config.outbox_dispatcher),
    );

    let registry = HandlerRegistry::from_handlers([
        Arc::new(SampleHandler::new()) as Arc<dyn QueueMessageHandler>,
        Arc::new(NoteCreatedHandler),
    ]);
    let processor = QueueProcessor::new(
        queue_client,
        &naming,
        Arc::new(registry),
        ProcessorConfig::from(&config.queue_processor),
    )
    .context("Invalid queue processor configuration")?;

    let dispatcher_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { dispatcher.run(shutdown_rx).await })
    };

    let processor_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { processor.run(shutdown_rx).await })
    };

    // Metrics server
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.server.metrics_port));
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .with_state(metrics);

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                error!(error = %e, "Metrics server failed");
            }
        })
    };

    info!("Tenantbus Worker started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = dispatcher_handle.await;
        let _ = processor_handle.await;
        let _ = metrics_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!("Timed out waiting for workers to stop");
    }

    info!("Tenantbus Worker shutdown complete");
    Ok(())
}

async fn init_schemas(catalog: &PgTenantCatalog, connections: &TenantConnectionProvider) -> Result<()> {
    catalog.init_schema().await?;
    let tenants = catalog.active_tenants().await?;
    for tenant in &tenants {
        let pool = connections.pool_for(tenant)?;
        PgOutboxStore::init_schema(&pool).await?;
    }
    info!(tenants = tenants.len(), "Catalog and outbox schemas initialized");
    Ok(())
}

async fn create_queue_client(settings: &QueueSettings) -> Result<Arc<dyn QueueClient>> {
    match settings.backend {
        QueueBackend::Memory => {
            warn!("Using in-memory queue, messages do not survive a restart");
            Ok(Arc::new(MemoryQueue::new("memory")))
        }
        QueueBackend::Sqlite => {
            let url = if settings.url.trim().is_empty() {
                "sqlite://tenantbus-queue.db"
            } else {
                settings.url.as_str()
            };
            let queue = SqliteQueue::connect(url)
                .await
                .with_context(|| format!("Failed to open SQLite queue at {}", url))?;
            Ok(Arc::new(queue))
        }
        QueueBackend::Sqs => {
            let endpoint = Some(settings.url.as_str()).filter(|u| !u.trim().is_empty());
            Ok(Arc::new(SqsQueue::from_env(endpoint).await))
        }
    }
}

/// Logs `note.created` events written by the API.
struct NoteCreatedHandler;

#[async_trait]
impl QueueMessageHandler for NoteCreatedHandler {
    fn message_type(&self) -> &str {
        "note.created"
    }

    async fn handle(&self, envelope: &QueueEnvelope) -> anyhow::Result<()> {
        let payload: serde_json::Value =
            serde_json::from_str(&envelope.payload).context("note.created payload is not JSON")?;
        let note_id = payload
            .get("noteId")
            .and_then(|v| v.as_str())
            .context("note.created payload has no noteId")?;
        info!(
            tenant_id = %envelope.tenant_id,
            outbox_id = %envelope.outbox_id,
            note_id,
            "Note created"
        );
        Ok(())
    }
}

async fn metrics_handler(axum::extract::State(handle): axum::extract::State<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
