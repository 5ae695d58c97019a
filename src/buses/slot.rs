use super::services::ServiceResult;
use crate::error::ServiceError;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Holds the single active provider for one capability.
///
/// Callers clone the `Arc` under the read lock and release it before the
/// call, so a swap never waits on in-flight requests and never cancels them.
pub struct CapabilitySlot<S: ?Sized> {
    capability: &'static str,
    provider: RwLock<Option<Arc<S>>>,
}

impl<S: ?Sized + Send + Sync> CapabilitySlot<S> {
    pub fn new(capability: &'static str) -> Self {
        Self {
            capability,
            provider: RwLock::new(None),
        }
    }

    pub fn capability(&self) -> &'static str {
        self.capability
    }

    /// Install `provider`, returning the one it replaced.
    pub async fn register(&self, provider: Arc<S>) -> Option<Arc<S>> {
        self.provider.write().await.replace(provider)
    }

    pub async fn get(&self) -> ServiceResult<Arc<S>> {
        self.provider
            .read()
            .await
            .clone()
            .ok_or_else(|| ServiceError::NoProvider(self.capability.to_string()))
    }

    pub async fn take(&self) -> Option<Arc<S>> {
        self.provider.write().await.take()
    }

    pub async fn is_registered(&self) -> bool {
        self.provider.read().await.is_some()
    }
}
