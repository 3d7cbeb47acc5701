//! Idempotency guard for mutating requests.
//!
//! A request carrying `Idempotency-Key` is fingerprinted and the key is
//! claimed for the tenant before the handler runs:
//! - first claim runs the handler, then records or forgets the response
//! - same key and fingerprint, finished: the recorded response is replayed
//! - same key and fingerprint, still running: 409
//! - same key, different fingerprint: 409

use crate::error::ApiError;
use crate::AppState;
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, header::CONTENT_TYPE, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use tb_common::TenantResolution;
use tb_idempotency::guard::{
    HEADER_NAME, MSG_BLANK_KEY, MSG_CONFLICT, MSG_FAILED, MSG_IN_PROGRESS, MSG_TOO_LARGE,
};
use tb_idempotency::{
    request_hash, IdempotencyCompletion, IdempotencyRecord, IdempotencyStart, KeyHeader, ResponseDisposition,
};
use tb_tenancy::TenantContext;
use tracing::{debug, error, warn};

/// Idempotency key of the current request, for handlers that record it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub String);

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}

fn with_key_header(mut response: Response, key: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(key) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("idempotency-key"), value);
    }
    response
}

fn replay(record: IdempotencyRecord) -> Response {
    let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(record.body.unwrap_or_default()));
    *response.status_mut() = status;
    if let Some(content_type) = record.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

pub async fn idempotency_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let policy = &state.guard;
    if !policy.applies_to(request.method().as_str()) {
        return next.run(request).await;
    }

    let Some(tenant) = request
        .extensions()
        .get::<TenantContext>()
        .and_then(TenantContext::resolution)
        .cloned()
    else {
        return next.run(request).await;
    };

    let header = request.headers().get(HEADER_NAME).map(|v| v.to_str().unwrap_or(""));
    let key = match KeyHeader::parse(header) {
        KeyHeader::Missing => None,
        KeyHeader::Blank => return ApiError::BadRequest(MSG_BLANK_KEY.to_string()).into_response(),
        KeyHeader::Present(key) => Some(key.to_string()),
    };
    let Some(key) = key else {
        return next.run(request).await;
    };

    let declared_length = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if policy.declared_length_too_large(declared_length) {
        return with_key_header(ApiError::PayloadTooLarge(MSG_TOO_LARGE.to_string()).into_response(), &key);
    }

    let (mut parts, body) = request.into_parts();
    let body = match to_bytes(body, policy.body_limit()).await {
        Ok(body) => body,
        Err(e) if exceeds_limit(&e) => {
            return with_key_header(ApiError::PayloadTooLarge(MSG_TOO_LARGE.to_string()).into_response(), &key);
        }
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return ApiError::BadRequest("Request body could not be read.".to_string()).into_response();
        }
    };

    let hash = request_hash(
        parts.method.as_str(),
        parts.uri.path(),
        parts.uri.query(),
        &body,
    );

    match state.idempotency.try_start(&tenant, &key, &hash).await {
        Ok(IdempotencyStart::Started) => {}
        Ok(IdempotencyStart::Completed(record)) => {
            debug!(idempotency_key = %key, status = record.status, "Replaying completed request");
            return with_key_header(replay(record), &key);
        }
        Ok(IdempotencyStart::InProgress) => {
            return with_key_header(ApiError::Conflict(MSG_IN_PROGRESS.to_string()).into_response(), &key);
        }
        Ok(IdempotencyStart::Conflict) => {
            return with_key_header(ApiError::Conflict(MSG_CONFLICT.to_string()).into_response(), &key);
        }
        Err(e) => {
            error!(idempotency_key = %key, error = %e, "Failed to claim idempotency key");
            return with_key_header(ApiError::Internal(MSG_FAILED).into_response(), &key);
        }
    }

    parts.extensions.insert(IdempotencyKey(key.clone()));
    let response = next.run(Request::from_parts(parts, Body::from(body))).await;

    let (parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            error!(idempotency_key = %key, error = %e, "Failed to read handler response");
            forget(&state, &tenant, &key, "response body unreadable").await;
            return with_key_header(ApiError::Internal(MSG_FAILED).into_response(), &key);
        }
    };

    settle(&state, &tenant, &key, parts.status, &parts.headers, &body).await;
    with_key_header(Response::from_parts(parts, Body::from(body)), &key)
}

/// Records or forgets the key. A key whose response cannot be recorded is
/// forgotten so a retry starts clean. Failures are logged; the handler's
/// response is returned either way.
async fn settle(
    state: &AppState,
    tenant: &TenantResolution,
    key: &str,
    status: StatusCode,
    headers: &axum::http::HeaderMap,
    body: &Bytes,
) {
    match state.guard.disposition(status.as_u16(), body) {
        ResponseDisposition::Complete(text) => {
            let completion = IdempotencyCompletion {
                key: key.to_string(),
                status: status.as_u16(),
                body: text,
                content_type: headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            };
            if let Err(e) = state.idempotency.complete(tenant, &completion).await {
                error!(idempotency_key = %key, error = %e, "Failed to record idempotent response");
                forget(state, tenant, key, "response could not be recorded").await;
            }
        }
        ResponseDisposition::Remove(reason) => forget(state, tenant, key, reason).await,
    }
}

async fn forget(state: &AppState, tenant: &TenantResolution, key: &str, reason: &str) {
    debug!(idempotency_key = %key, reason, "Releasing idempotency key");
    if let Err(e) = state.idempotency.remove(tenant, key).await {
        error!(idempotency_key = %key, error = %e, "Failed to release idempotency key");
    }
}
