use crate::{Result, TenancyError};
use std::sync::Arc;
use tb_common::TenantResolution;

/// Tenant resolution scoped to one request or job.
///
/// Carried explicitly (request extensions, function arguments); there is no
/// ambient tenant state.
#[derive(Debug, Clone, Default)]
pub struct TenantContext {
    resolution: Option<Arc<TenantResolution>>,
}

impl TenantContext {
    pub fn resolved(resolution: TenantResolution) -> Self {
        Self {
            resolution: Some(Arc::new(resolution)),
        }
    }

    /// Context for requests that bypassed tenant resolution.
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn resolution(&self) -> Option<&TenantResolution> {
        self.resolution.as_deref()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn require(&self) -> Result<&TenantResolution> {
        self.resolution().ok_or(TenancyError::Unresolved)
    }
}
