//! HTTP middleware behaviour: tenant resolution, correlation ids and the
//! idempotency guard, driven through the axum router.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    routing::{get, post},
    Extension, Router,
};
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tb_api::{routes, with_middleware, AppState, CorrelationId, CurrentTenant};
use tb_common::{DataError, TenantCatalogEntry, TenantId, TenantInfo, TenantResolution, TenantTier};
use tb_config::{PostgresSettings, TenancySettings};
use tb_idempotency::{
    GuardPolicy, IdempotencyCompletion, IdempotencyError, IdempotencyStart, IdempotencyStore, InMemoryIdempotencyStore,
};
use tb_tenancy::{
    NullTenantCache, StaticTenantCatalog, TenantCatalog, TenantConnectionProvider, TenantContext, TenantResolver,
};
use tower::ServiceExt;

/// Catalog whose database is down.
struct UnreachableCatalog;

#[async_trait]
impl TenantCatalog for UnreachableCatalog {
    async fn resolve_host(&self, _host: &str) -> tb_tenancy::Result<Option<TenantResolution>> {
        Err(DataError::translate("resolve tenant by host", sqlx::Error::PoolTimedOut).into())
    }

    async fn active_tenants(&self) -> tb_tenancy::Result<Vec<TenantCatalogEntry>> {
        Ok(Vec::new())
    }
}

/// Idempotency table that can refuse claims or completions.
struct FaultyStore {
    inner: InMemoryIdempotencyStore,
    fail_start: bool,
    fail_complete: bool,
}

impl FaultyStore {
    fn outage() -> IdempotencyError {
        DataError::translate("idempotency", sqlx::Error::PoolTimedOut).into()
    }
}

#[async_trait]
impl IdempotencyStore for FaultyStore {
    async fn try_start(
        &self,
        tenant: &TenantResolution,
        key: &str,
        request_hash: &str,
    ) -> tb_idempotency::Result<IdempotencyStart> {
        if self.fail_start {
            return Err(Self::outage());
        }
        self.inner.try_start(tenant, key, request_hash).await
    }

    async fn complete(&self, tenant: &TenantResolution, completion: &IdempotencyCompletion) -> tb_idempotency::Result<()> {
        if self.fail_complete {
            return Err(Self::outage());
        }
        self.inner.complete(tenant, completion).await
    }

    async fn remove(&self, tenant: &TenantResolution, key: &str) -> tb_idempotency::Result<()> {
        self.inner.remove(tenant, key).await
    }
}

struct TestApp {
    router: Router,
    catalog: Arc<StaticTenantCatalog>,
    store: Arc<InMemoryIdempotencyStore>,
    calls: Arc<AtomicUsize>,
    acme: TenantId,
}

fn state_with(catalog: Arc<dyn TenantCatalog>, store: Arc<dyn IdempotencyStore>, guard: GuardPolicy) -> AppState {
    let resolver = TenantResolver::new(catalog, Arc::new(NullTenantCache), Duration::from_secs(300));
    AppState::new(
        Arc::new(resolver),
        store,
        Arc::new(TenantConnectionProvider::new(PostgresSettings::default())),
        TenancySettings::default(),
        guard,
    )
}

fn test_routes(calls: Arc<AtomicUsize>) -> Router<AppState> {
    let echo_calls = calls.clone();
    let slow_calls = calls.clone();
    let fail_calls = calls.clone();
    let big_calls = calls;

    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/api/tenant/key",
            get(|CurrentTenant(tenant): CurrentTenant| async move { tenant.tenant.key }),
        )
        .route(
            "/api/context",
            get(|Extension(context): Extension<TenantContext>| async move { context.is_resolved().to_string() }),
        )
        .route("/api/correlation", get(|id: CorrelationId| async move { id.0 }))
        .route(
            "/api/echo",
            post(move |body: String| async move {
                echo_calls.fetch_add(1, Ordering::SeqCst);
                (StatusCode::CREATED, body)
            })
            .get(|| async { "read" }),
        )
        .route(
            "/api/slow",
            post(move |body: String| async move {
                slow_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                (StatusCode::CREATED, body)
            }),
        )
        .route(
            "/api/fail",
            post(move || async move {
                fail_calls.fetch_add(1, Ordering::SeqCst);
                StatusCode::SERVICE_UNAVAILABLE
            }),
        )
        .route(
            "/api/big",
            post(move || async move {
                big_calls.fetch_add(1, Ordering::SeqCst);
                "x".repeat(64)
            }),
        )
}

fn acme_catalog() -> (Arc<StaticTenantCatalog>, TenantId) {
    let catalog = Arc::new(StaticTenantCatalog::new());
    let acme = TenantId::new();
    catalog
        .add_tenant(
            TenantInfo {
                id: acme,
                key: "acme".to_string(),
                tier: TenantTier::Shared,
            },
            &["acme.example.com"],
            None,
        )
        .add_tenant(
            TenantInfo {
                id: TenantId::new(),
                key: "globex".to_string(),
                tier: TenantTier::Shared,
            },
            &["globex.example.com"],
            None,
        );
    (catalog, acme)
}

fn app_with(guard: GuardPolicy) -> TestApp {
    let (catalog, acme) = acme_catalog();
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let state = state_with(catalog.clone(), store.clone(), guard);

    TestApp {
        router: with_middleware(test_routes(calls.clone()), state),
        catalog,
        store,
        calls,
        acme,
    }
}

fn app() -> TestApp {
    app_with(GuardPolicy::default())
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn post_with_key(host: &str, path: &str, key: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("host", host)
        .header("idempotency-key", key)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_on(host: &str, path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("host", host)
        .body(Body::empty())
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn error_message(response: Response) -> String {
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    body["message"].as_str().unwrap_or_default().to_string()
}

// ============================================================================
// Tenant resolution
// ============================================================================

#[tokio::test]
async fn test_health_skips_tenant_resolution() {
    let app = app();
    let response = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.catalog.lookups(), 0);
}

#[tokio::test]
async fn test_missing_host_is_bad_request() {
    let app = app();
    let response = app
        .send(Request::builder().uri("/api/tenant/key").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_host_is_not_found() {
    let app = app();
    let response = app.send(get_on("nobody.example.com", "/api/tenant/key")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_message(response).await, "Tenant not found.");
}

#[tokio::test]
async fn test_host_is_normalized_before_lookup() {
    let app = app();
    let response = app.send(get_on(" ACME.Example.com:8443 ", "/api/tenant/key")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "acme");
}

#[tokio::test]
async fn test_bypass_and_admin_hosts_skip_resolution() {
    let app = app();
    for host in ["localhost:8080", "127.0.0.1", "admin.example.com"] {
        let response = app.send(get_on(host, "/api/context")).await;
        assert_eq!(response.status(), StatusCode::OK, "{}", host);
        assert_eq!(body_text(response).await, "false");
    }
    assert_eq!(app.catalog.lookups(), 0);

    // handlers that need a tenant still refuse
    let response = app.send(get_on("localhost", "/api/tenant/key")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_catalog_outage_is_generic_server_error() {
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let state = state_with(Arc::new(UnreachableCatalog), store, GuardPolicy::default());
    let router = with_middleware(test_routes(Arc::new(AtomicUsize::new(0))), state);

    let response = router
        .oneshot(get_on("acme.example.com", "/api/tenant/key"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_message(response).await, "Tenant resolution failed.");
}

// ============================================================================
// Correlation
// ============================================================================

#[tokio::test]
async fn test_correlation_id_is_echoed() {
    let app = app();
    let request = Request::builder()
        .uri("/api/correlation")
        .header("host", "acme.example.com")
        .header("x-correlation-id", "req-42")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.headers()["x-correlation-id"], "req-42");
    assert_eq!(body_text(response).await, "req-42");
}

#[tokio::test]
async fn test_correlation_id_is_generated_even_for_errors() {
    let app = app();
    let response = app.send(get_on("nobody.example.com", "/api/correlation")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let generated = response.headers()["x-correlation-id"].to_str().unwrap();
    assert_eq!(generated.len(), 32);
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_completed_request_is_replayed() {
    let app = app();

    let first = app.send(post_with_key("acme.example.com", "/api/echo", "k-1", "hello")).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(first.headers()["idempotency-key"], "k-1");
    let content_type = first.headers()["content-type"].clone();
    assert_eq!(body_text(first).await, "hello");

    let second = app.send(post_with_key("acme.example.com", "/api/echo", "k-1", "hello")).await;
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(second.headers()["idempotency-key"], "k-1");
    assert_eq!(second.headers()["content-type"], content_type);
    assert_eq!(body_text(second).await, "hello");

    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_request_conflicts() {
    let app = app();
    app.send(post_with_key("acme.example.com", "/api/echo", "k-1", "hello")).await;

    let response = app.send(post_with_key("acme.example.com", "/api/echo", "k-1", "goodbye")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        error_message(response).await,
        "Idempotency key was used with a different request."
    );

    let response = app
        .send(post_with_key("acme.example.com", "/api/echo?v=2", "k-1", "hello"))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn test_blank_key_is_rejected_and_missing_key_passes() {
    let app = app();

    let response = app.send(post_with_key("acme.example.com", "/api/echo", "  ", "x")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.calls(), 0);

    for _ in 0..2 {
        let request = Request::builder()
            .method("POST")
            .uri("/api/echo")
            .header("host", "acme.example.com")
            .body(Body::from("x"))
            .unwrap();
        assert_eq!(app.send(request).await.status(), StatusCode::CREATED);
    }
    assert_eq!(app.calls(), 2);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_safe_methods_are_not_guarded() {
    let app = app();
    let request = Request::builder()
        .uri("/api/echo")
        .header("host", "acme.example.com")
        .header("idempotency-key", "k-1")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("idempotency-key").is_none());
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_oversized_request_is_rejected() {
    let app = app_with(GuardPolicy {
        max_body_bytes: 16,
        ..GuardPolicy::default()
    });

    let response = app
        .send(post_with_key("acme.example.com", "/api/echo", "k-1", &"x".repeat(100)))
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(response.headers()["idempotency-key"], "k-1");

    let request = Request::builder()
        .method("POST")
        .uri("/api/echo")
        .header("host", "acme.example.com")
        .header("idempotency-key", "k-2")
        .header("content-length", "100")
        .body(Body::from("x".repeat(100)))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(response.headers()["idempotency-key"], "k-2");

    assert_eq!(app.calls(), 0);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_failed_response_releases_key() {
    let app = app();

    for _ in 0..2 {
        let response = app.send(post_with_key("acme.example.com", "/api/fail", "k-1", "")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["idempotency-key"], "k-1");
    }
    assert_eq!(app.calls(), 2);
    assert!(!app.store.contains(app.acme, "k-1"));
}

#[tokio::test]
async fn test_oversized_response_is_not_recorded() {
    let app = app_with(GuardPolicy {
        max_response_bytes: 16,
        ..GuardPolicy::default()
    });

    for _ in 0..2 {
        let response = app.send(post_with_key("acme.example.com", "/api/big", "k-1", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await.len(), 64);
    }
    assert_eq!(app.calls(), 2);
    assert!(!app.store.contains(app.acme, "k-1"));
}

#[tokio::test]
async fn test_keys_are_scoped_per_tenant() {
    let app = app();
    for host in ["acme.example.com", "globex.example.com"] {
        let response = app.send(post_with_key(host, "/api/echo", "shared-key", "hello")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(app.calls(), 2);
    assert_eq!(app.store.len(), 2);
}

#[tokio::test]
async fn test_concurrent_duplicates_execute_once() {
    let app = app();

    let requests: Vec<_> = (0..4)
        .map(|_| {
            let router = app.router.clone();
            tokio::spawn(async move {
                router
                    .oneshot(post_with_key("acme.example.com", "/api/slow", "k-1", "hello"))
                    .await
                    .unwrap()
                    .status()
            })
        })
        .collect();

    let mut statuses = Vec::new();
    for request in requests {
        statuses.push(request.await.unwrap());
    }

    assert_eq!(app.calls(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::CREATED).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count(), 3);

    let replay = app.send(post_with_key("acme.example.com", "/api/slow", "k-1", "hello")).await;
    assert_eq!(replay.status(), StatusCode::CREATED);
    assert_eq!(app.calls(), 1);
}

#[tokio::test]
async fn test_claim_failure_is_generic_error_with_key() {
    let (catalog, _) = acme_catalog();
    let store = Arc::new(FaultyStore {
        inner: InMemoryIdempotencyStore::new(),
        fail_start: true,
        fail_complete: false,
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let router = with_middleware(
        test_routes(calls.clone()),
        state_with(catalog, store, GuardPolicy::default()),
    );

    let response = router
        .oneshot(post_with_key("acme.example.com", "/api/echo", "k-1", "hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["idempotency-key"], "k-1");
    assert_eq!(error_message(response).await, "Idempotency handling failed.");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unrecorded_response_releases_key() {
    let (catalog, acme) = acme_catalog();
    let store = Arc::new(FaultyStore {
        inner: InMemoryIdempotencyStore::new(),
        fail_start: false,
        fail_complete: true,
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let router = with_middleware(
        test_routes(calls.clone()),
        state_with(catalog, store.clone(), GuardPolicy::default()),
    );

    // the retry runs again instead of waiting on a key that never completes
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_with_key("acme.example.com", "/api/echo", "k-1", "hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["idempotency-key"], "k-1");
        assert_eq!(body_text(response).await, "hello");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!store.inner.contains(acme, "k-1"));
}
