//! Seams to the collaborators this crate does not own: the configuration
//! store that maps a tenant to its target, and the outbound API client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::LookupError;
use crate::rate_limit::RateLimitUpdate;
use crate::types::{Payload, ResourceId, TenantId};

/// Status of one outbound call, as reported by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Success,
    /// 429. `global` is set when the limit applies to every resource.
    RateLimited { global: bool },
    /// 5xx.
    ServerError(u16),
    /// The request never produced a response.
    Network(String),
    Unauthorized,
    Forbidden,
    NotFound,
    /// Any other 4xx, or a status outside 2xx/4xx/5xx.
    ClientError(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: RemoteStatus,
    pub retry_after: Option<Duration>,
    pub rate_limit: Option<RateLimitUpdate>,
}

impl RemoteResponse {
    pub fn new(status: RemoteStatus) -> Self {
        Self {
            status,
            retry_after: None,
            rate_limit: None,
        }
    }

    pub fn success() -> Self {
        Self::new(RemoteStatus::Success)
    }

    pub fn rate_limited(retry_after: Duration, global: bool) -> Self {
        Self {
            status: RemoteStatus::RateLimited { global },
            retry_after: Some(retry_after),
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, update: RateLimitUpdate) -> Self {
        self.rate_limit = Some(update);
        self
    }
}

/// Outbound API client.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn call(&self, resource: &ResourceId, payload: &Payload) -> RemoteResponse;
}

/// Configuration store lookup: which resource receives a tenant's messages.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve_target(&self, tenant_id: &TenantId) -> Result<Option<ResourceId>, LookupError>;
}

/// In-memory tenant → target map.
#[derive(Debug, Default)]
pub struct StaticTargets {
    targets: RwLock<HashMap<TenantId, ResourceId>>,
}

impl StaticTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, tenant_id: impl Into<String>, resource: impl Into<String>) -> Self {
        self.targets
            .get_mut()
            .insert(TenantId(tenant_id.into()), ResourceId(resource.into()));
        self
    }

    pub async fn set_target(&self, tenant_id: TenantId, resource: ResourceId) {
        self.targets.write().await.insert(tenant_id, resource);
    }

    pub async fn remove_target(&self, tenant_id: &TenantId) -> Option<ResourceId> {
        self.targets.write().await.remove(tenant_id)
    }
}

#[async_trait]
impl TargetResolver for StaticTargets {
    async fn resolve_target(&self, tenant_id: &TenantId) -> Result<Option<ResourceId>, LookupError> {
        Ok(self.targets.read().await.get(tenant_id).cloned())
    }
}
