use crate::{Result, TenantCache, TenantCatalog};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tb_common::{ResolutionSource, TenantResolution};
use tracing::{debug, error, warn};

/// Trims, lowercases and strips any port from a host header value.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
                name
            }
            _ => host,
        }
    };

    without_port.to_lowercase()
}

/// Maps a request host to its tenant, cache first.
pub struct TenantResolver {
    catalog: Arc<dyn TenantCatalog>,
    cache: Arc<dyn TenantCache>,
    cache_ttl: Duration,
}

impl TenantResolver {
    pub fn new(catalog: Arc<dyn TenantCatalog>, cache: Arc<dyn TenantCache>, cache_ttl: Duration) -> Self {
        Self {
            catalog,
            cache,
            cache_ttl: cache_ttl.max(Duration::from_secs(60)),
        }
    }

    /// Resolves `host` to a tenant.
    ///
    /// Cache failures degrade to a catalog lookup. Catalog failures are
    /// returned to the caller.
    pub async fn resolve(&self, host: &str) -> Result<Option<TenantResolution>> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Ok(None);
        }

        match self.cache.get(&host).await {
            Ok(Some(mut cached)) => {
                cached.source = ResolutionSource::Cache;
                counter!("tb_tenant_resolutions_total", "source" => "cache").increment(1);
                debug!(host = %host, tenant_id = %cached.tenant.id, "Tenant resolved from cache");
                return Ok(Some(cached));
            }
            Ok(None) => {}
            Err(e) => warn!(host = %host, error = %e, "Tenant cache read failed, falling back to catalog"),
        }

        let resolution = match self.catalog.resolve_host(&host).await {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(host = %host, error = %e, "Tenant catalog lookup failed");
                return Err(e);
            }
        };

        let Some(resolution) = resolution else {
            counter!("tb_tenant_resolutions_total", "source" => "none").increment(1);
            return Ok(None);
        };

        counter!("tb_tenant_resolutions_total", "source" => "catalog").increment(1);
        if let Err(e) = self.cache.set(&host, &resolution, self.cache_ttl).await {
            warn!(host = %host, error = %e, "Tenant cache write failed");
        }

        Ok(Some(resolution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("  Acme.Example.COM "), "acme.example.com");
        assert_eq!(normalize_host("acme.example.com:8443"), "acme.example.com");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host("::1"), "::1");
        assert_eq!(normalize_host(""), "");
    }
}
