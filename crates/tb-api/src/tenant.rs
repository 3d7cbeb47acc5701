use crate::error::{ApiError, MSG_MISSING_HOST, MSG_TENANT_NOT_FOUND, MSG_TENANT_RESOLUTION_FAILED};
use crate::AppState;
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header::HOST, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tb_common::TenantResolution;
use tb_config::TenancySettings;
use tb_tenancy::{normalize_host, TenantContext};
use tracing::{debug, field, Span};

const PROBE_PATHS: [&str; 2] = ["/health", "/alive"];

fn is_probe_path(path: &str) -> bool {
    PROBE_PATHS.iter().any(|probe| path.starts_with(probe))
}

/// Hosts that never carry a tenant: configured bypass hosts and the admin
/// subdomain.
pub fn is_bypass_host(settings: &TenancySettings, host: &str) -> bool {
    if settings
        .bypass_hosts
        .iter()
        .any(|bypass| normalize_host(bypass) == host)
    {
        return true;
    }

    let prefix = settings.admin_host_prefix.trim().to_lowercase();
    !prefix.is_empty() && host.starts_with(&format!("{}.", prefix))
}

fn request_host(request: &Request) -> Option<String> {
    let raw = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.as_str().to_string()))?;
    let host = normalize_host(&raw);
    (!host.is_empty()).then_some(host)
}

/// Resolves the tenant for the request host and stores a `TenantContext`
/// in the request extensions.
pub async fn tenant_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if is_probe_path(request.uri().path()) {
        request.extensions_mut().insert(TenantContext::unresolved());
        return next.run(request).await;
    }

    let Some(host) = request_host(&request) else {
        return ApiError::BadRequest(MSG_MISSING_HOST.to_string()).into_response();
    };

    if is_bypass_host(&state.tenancy, &host) {
        debug!(host = %host, "Tenant resolution bypassed");
        request.extensions_mut().insert(TenantContext::unresolved());
        return next.run(request).await;
    }

    match state.resolver.resolve(&host).await {
        Ok(Some(resolution)) => {
            Span::current().record("tenant_id", field::display(resolution.tenant.id));
            request.extensions_mut().insert(TenantContext::resolved(resolution));
            next.run(request).await
        }
        Ok(None) => {
            debug!(host = %host, "No tenant for host");
            ApiError::NotFound(MSG_TENANT_NOT_FOUND.to_string()).into_response()
        }
        // already logged by the resolver
        Err(_) => ApiError::Internal(MSG_TENANT_RESOLUTION_FAILED).into_response(),
    }
}

/// The resolved tenant of the current request. Rejects with 404 when the
/// request bypassed resolution.
#[derive(Debug, Clone)]
pub struct CurrentTenant(pub TenantResolution);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentTenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .and_then(TenantContext::resolution)
            .map(|resolution| CurrentTenant(resolution.clone()))
            .ok_or_else(|| ApiError::NotFound(MSG_TENANT_NOT_FOUND.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_hosts() {
        let settings = TenancySettings::default();
        assert!(is_bypass_host(&settings, "localhost"));
        assert!(is_bypass_host(&settings, "127.0.0.1"));
        assert!(is_bypass_host(&settings, "admin.example.com"));
        assert!(!is_bypass_host(&settings, "administrator.example.com"));
        assert!(!is_bypass_host(&settings, "acme.example.com"));
    }

    #[test]
    fn test_empty_admin_prefix_bypasses_nothing() {
        let settings = TenancySettings {
            admin_host_prefix: " ".to_string(),
            bypass_hosts: Vec::new(),
            ..TenancySettings::default()
        };
        assert!(!is_bypass_host(&settings, ".example.com"));
        assert!(!is_bypass_host(&settings, "localhost"));
    }

    #[test]
    fn test_probe_paths() {
        assert!(is_probe_path("/health"));
        assert!(is_probe_path("/alive"));
        assert!(is_probe_path("/health/ready"));
        assert!(!is_probe_path("/api/tenant/tenancy/ping"));
    }
}
