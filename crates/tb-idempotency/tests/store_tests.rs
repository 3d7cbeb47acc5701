use std::sync::Arc;
use tb_common::{ResolutionSource, TenantId, TenantInfo, TenantResolution, TenantTier};
use tb_idempotency::{
    request_hash, IdempotencyCompletion, IdempotencyStart, IdempotencyStore, InMemoryIdempotencyStore,
};

fn tenant() -> TenantResolution {
    TenantResolution {
        tenant: TenantInfo {
            id: TenantId::new(),
            key: "acme".to_string(),
            tier: TenantTier::Shared,
        },
        database: None,
        source: ResolutionSource::Catalog,
    }
}

fn completion(key: &str, body: &str) -> IdempotencyCompletion {
    IdempotencyCompletion {
        key: key.to_string(),
        status: 201,
        body: body.to_string(),
        content_type: Some("application/json".to_string()),
    }
}

#[tokio::test]
async fn test_key_lifecycle() {
    let store = InMemoryIdempotencyStore::new();
    let tenant = tenant();
    let hash = request_hash("POST", "/api/notes", None, b"{}");

    assert_eq!(store.try_start(&tenant, "k1", &hash).await.unwrap(), IdempotencyStart::Started);
    assert_eq!(store.try_start(&tenant, "k1", &hash).await.unwrap(), IdempotencyStart::InProgress);

    let body = r#"{"id":"7f1c","title":"héllo"}"#;
    store.complete(&tenant, &completion("k1", body)).await.unwrap();

    for _ in 0..3 {
        match store.try_start(&tenant, "k1", &hash).await.unwrap() {
            IdempotencyStart::Completed(record) => {
                assert_eq!(record.status, 201);
                assert_eq!(record.body.as_deref().map(str::as_bytes), Some(body.as_bytes()));
                assert_eq!(record.content_type.as_deref(), Some("application/json"));
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_different_hash_conflicts_in_any_state() {
    let store = InMemoryIdempotencyStore::new();
    let tenant = tenant();
    let hash = request_hash("POST", "/api/notes", None, b"{\"a\":1}");
    let other = request_hash("POST", "/api/notes", None, b"{\"a\":2}");

    store.try_start(&tenant, "k", &hash).await.unwrap();
    assert_eq!(store.try_start(&tenant, "k", &other).await.unwrap(), IdempotencyStart::Conflict);

    store.complete(&tenant, &completion("k", "{}")).await.unwrap();
    assert_eq!(store.try_start(&tenant, "k", &other).await.unwrap(), IdempotencyStart::Conflict);
}

#[tokio::test]
async fn test_remove_allows_clean_retry() {
    let store = InMemoryIdempotencyStore::new();
    let tenant = tenant();
    let hash = request_hash("PUT", "/api/notes/1", None, b"x");

    store.try_start(&tenant, "k", &hash).await.unwrap();
    store.remove(&tenant, "k").await.unwrap();
    assert!(!store.contains(tenant.tenant.id, "k"));

    assert_eq!(store.try_start(&tenant, "k", &hash).await.unwrap(), IdempotencyStart::Started);
}

#[tokio::test]
async fn test_keys_are_scoped_per_tenant() {
    let store = InMemoryIdempotencyStore::new();
    let (a, b) = (tenant(), tenant());

    assert_eq!(store.try_start(&a, "shared-key", "h1").await.unwrap(), IdempotencyStart::Started);
    assert_eq!(store.try_start(&b, "shared-key", "h2").await.unwrap(), IdempotencyStart::Started);
    assert_eq!(store.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_start_once() {
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let tenant = tenant();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move { store.try_start(&tenant, "race", "same-hash").await.unwrap() })
        })
        .collect();

    let mut started = 0;
    for handle in handles {
        match handle.await.unwrap() {
            IdempotencyStart::Started => started += 1,
            IdempotencyStart::InProgress => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(started, 1);
}
