//! Tenantbus API Server
//!
//! Serves the tenant-routed HTTP API. Each request is resolved to a tenant
//! from its host, mutating requests are guarded by `Idempotency-Key`, and
//! writes land together with their outbox event in the tenant's database.
//!
//! Configuration comes from `TB_CONFIG` (TOML) and `TB_*` overrides; see
//! `tb-config`. The tenant cache uses Redis when `TB_REDIS_URL` is set.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use tb_api::{create_router, routes::init_note_schema, AppState};
use tb_config::{AppConfig, RedisSettings};
use tb_idempotency::{GuardPolicy, PgIdempotencyStore};
use tb_outbox::PgOutboxStore;
use tb_tenancy::{
    NullTenantCache, PgTenantCatalog, RedisTenantCache, TenantCache, TenantCatalog, TenantConnectionProvider,
    TenantResolver,
};

/// Tenantbus HTTP API
#[derive(Parser, Debug)]
#[command(name = "tb-api-server")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "TB_CONFIG")]
    config: Option<PathBuf>,

    /// Create catalog and tenant schemas before serving
    #[arg(long, env = "TB_INIT_SCHEMA", default_value = "false")]
    init_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tb_common::logging::init_logging();

    let args = Args::parse();
    let config = AppConfig::load_from(args.config.as_deref(), |key| std::env::var(key).ok())
        .context("Failed to load configuration")?;

    info!("Starting Tenantbus API Server");

    let connections = Arc::new(TenantConnectionProvider::new(config.postgres.clone()));
    let catalog_pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections.max(1))
        .connect_lazy_with(connections.factory().catalog());
    let catalog = Arc::new(PgTenantCatalog::new(catalog_pool));

    if args.init_schema {
        init_schemas(&catalog, &connections).await?;
    }

    let cache = create_tenant_cache(&config.redis).await;
    let resolver = Arc::new(TenantResolver::new(catalog, cache, config.tenancy.cache_ttl()));
    let idempotency = Arc::new(PgIdempotencyStore::new(connections.clone()));

    let state = AppState::new(
        resolver,
        idempotency,
        connections,
        config.tenancy.clone(),
        GuardPolicy::from(&config.idempotency),
    );

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.api_port));
    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    info!("Tenantbus API Server shutdown complete");
    Ok(())
}

/// Redis when configured and reachable, otherwise no caching.
async fn create_tenant_cache(settings: &RedisSettings) -> Arc<dyn TenantCache> {
    if settings.url.trim().is_empty() {
        info!("Tenant cache disabled");
        return Arc::new(NullTenantCache);
    }

    match RedisTenantCache::connect(&settings.url).await {
        Ok(cache) => {
            info!("Tenant cache connected to Redis");
            Arc::new(cache)
        }
        Err(e) => {
            warn!(error = %e, "Redis unavailable, tenant cache disabled");
            Arc::new(NullTenantCache)
        }
    }
}

async fn init_schemas(catalog: &PgTenantCatalog, connections: &TenantConnectionProvider) -> Result<()> {
    catalog.init_schema().await?;
    let tenants = catalog.active_tenants().await?;
    for tenant in &tenants {
        let pool = connections.pool_for(tenant)?;
        PgIdempotencyStore::init_schema(&pool).await?;
        PgOutboxStore::init_schema(&pool).await?;
        init_note_schema(&pool).await?;
    }
    info!(tenants = tenants.len(), "Catalog and tenant schemas initialized");
    Ok(())
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

    info!("Shutdown signal received...");
}
