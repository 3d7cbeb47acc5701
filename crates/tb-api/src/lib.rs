//! Tenantbus HTTP surface.
//!
//! Middleware, outermost first:
//! - correlation: `X-Correlation-ID` read or generated, request span
//! - tenant: host to `TenantContext`, bypass rules, 400/404/500
//! - idempotency: `Idempotency-Key` guard for mutating requests
//!
//! Routes: `/health`, `/alive`, `GET /api/tenant/tenancy/ping`,
//! `POST /api/tenant/notes`.

pub mod correlation;
pub mod error;
pub mod idempotency;
pub mod routes;
pub mod tenant;

pub use correlation::{correlation_middleware, CorrelationId, CORRELATION_HEADER};
pub use error::ApiError;
pub use idempotency::{idempotency_middleware, IdempotencyKey};
pub use tenant::{tenant_middleware, CurrentTenant};

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tb_config::TenancySettings;
use tb_idempotency::{GuardPolicy, IdempotencyStore};
use tb_outbox::OutboxWriter;
use tb_tenancy::{TenantConnectionProvider, TenantResolver};

/// Shared state for middleware and handlers
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<TenantResolver>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub connections: Arc<TenantConnectionProvider>,
    pub outbox: OutboxWriter,
    pub tenancy: Arc<TenancySettings>,
    pub guard: Arc<GuardPolicy>,
}

impl AppState {
    pub fn new(
        resolver: Arc<TenantResolver>,
        idempotency: Arc<dyn IdempotencyStore>,
        connections: Arc<TenantConnectionProvider>,
        tenancy: TenancySettings,
        guard: GuardPolicy,
    ) -> Self {
        Self {
            resolver,
            idempotency,
            connections,
            outbox: OutboxWriter::new(),
            tenancy: Arc::new(tenancy),
            guard: Arc::new(guard),
        }
    }
}

/// Wraps `router` in the correlation, tenant and idempotency layers.
pub fn with_middleware(router: Router<AppState>, state: AppState) -> Router {
    router
        .layer(from_fn_with_state(state.clone(), idempotency_middleware))
        .layer(from_fn_with_state(state.clone(), tenant_middleware))
        .layer(from_fn(correlation_middleware))
        .with_state(state)
}

pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(routes::health))
        .route("/alive", get(routes::health))
        .route("/api/tenant/tenancy/ping", get(routes::tenancy_ping))
        .route("/api/tenant/notes", post(routes::create_note));

    with_middleware(router, state)
}
