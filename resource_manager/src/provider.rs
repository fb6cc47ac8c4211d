use crate::resource_pool::{Resource, ResourcePool};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Source of leases for one attempt of an outbound call.
///
/// The retry layer acquires a lease per attempt and reports the outcome back,
/// so a retry usually lands on a different proxy or key.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    type Lease: Clone + fmt::Debug + Send + Sync;

    async fn acquire(&self) -> Self::Lease;

    fn report_success(&self, lease: &Self::Lease);

    fn report_failure(&self, lease: &Self::Lease, retry_after: Option<Duration>);
}

#[async_trait]
impl ResourceProvider for ResourcePool {
    type Lease = Resource;

    async fn acquire(&self) -> Resource {
        ResourcePool::acquire(self).await
    }

    fn report_success(&self, lease: &Resource) {
        ResourcePool::report_success(self, lease);
    }

    fn report_failure(&self, lease: &Resource, retry_after: Option<Duration>) {
        ResourcePool::report_failure(self, lease, retry_after);
    }
}

/// An API key plus the proxy the request is sent through
#[derive(Debug, Clone)]
pub struct KeyedLease {
    pub api_key: Resource,
    pub proxy: Resource,
}

/// Pairs an API key pool with a proxy pool; outcomes are reported to both
#[derive(Clone)]
pub struct KeyedEgress {
    api_keys: Arc<ResourcePool>,
    proxies: Arc<ResourcePool>,
}

impl KeyedEgress {
    pub fn new(api_keys: Arc<ResourcePool>, proxies: Arc<ResourcePool>) -> Self {
        Self { api_keys, proxies }
    }

    pub fn api_keys(&self) -> &Arc<ResourcePool> {
        &self.api_keys
    }

    pub fn proxies(&self) -> &Arc<ResourcePool> {
        &self.proxies
    }
}

#[async_trait]
impl ResourceProvider for KeyedEgress {
    type Lease = KeyedLease;

    async fn acquire(&self) -> KeyedLease {
        let api_key = self.api_keys.acquire().await;
        let proxy = self.proxies.acquire().await;
        KeyedLease { api_key, proxy }
    }

    fn report_success(&self, lease: &KeyedLease) {
        self.api_keys.report_success(&lease.api_key);
        self.proxies.report_success(&lease.proxy);
    }

    fn report_failure(&self, lease: &KeyedLease, retry_after: Option<Duration>) {
        self.api_keys.report_failure(&lease.api_key, retry_after);
        self.proxies.report_failure(&lease.proxy, retry_after);
    }
}
