use super::services::{
    CommunicationService, DeferralRequest, GuidanceRequest, MemoryEntry, MemoryService, Message,
    OutboundMessage, Service, ServiceResult, ToolResult, ToolService, WiseAuthorityService,
};
use super::slot::CapabilitySlot;
use crate::audit::AuditService;
use crate::config::BusConfig;
use crate::error::ServiceError;
use crate::schemas::MemoryScope;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Bounded retry with doubling backoff applied to every bus call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            call_timeout: Duration::from_secs(config.call_timeout_seconds.max(1)),
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let spread = u64::try_from(base.as_millis() / 4).unwrap_or(0);
        if spread == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=spread);
        base + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BusConfig::default())
    }
}

/// Capability registry and router.
///
/// Holds exactly one provider per capability. Handlers reach external
/// services only through the typed call methods here, which apply the
/// shared [`RetryPolicy`].
pub struct BusManager {
    communication: CapabilitySlot<dyn CommunicationService>,
    memory: CapabilitySlot<dyn MemoryService>,
    tools: CapabilitySlot<dyn ToolService>,
    wise_authority: CapabilitySlot<dyn WiseAuthorityService>,
    audit: CapabilitySlot<AuditService>,
    policy: RetryPolicy,
}

impl BusManager {
    pub fn new(config: &BusConfig) -> Self {
        Self::with_policy(RetryPolicy::from_config(config))
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            communication: CapabilitySlot::new("communication"),
            memory: CapabilitySlot::new("memory"),
            tools: CapabilitySlot::new("tool"),
            wise_authority: CapabilitySlot::new("wise_authority"),
            audit: CapabilitySlot::new("audit"),
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    // ── Registration ────────────────────────────────────────────────────

    pub async fn register_communication(&self, provider: Arc<dyn CommunicationService>) {
        let name = provider.name().to_string();
        if let Some(previous) = self.communication.register(provider).await {
            swapped("communication", previous.as_ref(), &name).await;
        } else {
            tracing::info!(capability = "communication", provider = %name, "provider registered");
        }
    }

    pub async fn register_memory(&self, provider: Arc<dyn MemoryService>) {
        let name = provider.name().to_string();
        if let Some(previous) = self.memory.register(provider).await {
            swapped("memory", previous.as_ref(), &name).await;
        } else {
            tracing::info!(capability = "memory", provider = %name, "provider registered");
        }
    }

    pub async fn register_tools(&self, provider: Arc<dyn ToolService>) {
        let name = provider.name().to_string();
        if let Some(previous) = self.tools.register(provider).await {
            swapped("tool", previous.as_ref(), &name).await;
        } else {
            tracing::info!(capability = "tool", provider = %name, "provider registered");
        }
    }

    pub async fn register_wise_authority(&self, provider: Arc<dyn WiseAuthorityService>) {
        let name = provider.name().to_string();
        if let Some(previous) = self.wise_authority.register(provider).await {
            swapped("wise_authority", previous.as_ref(), &name).await;
        } else {
            tracing::info!(capability = "wise_authority", provider = %name, "provider registered");
        }
    }

    pub async fn register_audit(&self, audit: Arc<AuditService>) {
        self.audit.register(audit).await;
        tracing::info!(capability = "audit", "audit service registered");
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Names of capabilities that have no provider.
    pub async fn missing_capabilities(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.communication.is_registered().await {
            missing.push(self.communication.capability());
        }
        if !self.memory.is_registered().await {
            missing.push(self.memory.capability());
        }
        if !self.tools.is_registered().await {
            missing.push(self.tools.capability());
        }
        if !self.wise_authority.is_registered().await {
            missing.push(self.wise_authority.capability());
        }
        if !self.audit.is_registered().await {
            missing.push(self.audit.capability());
        }
        missing
    }

    /// Fail unless every capability has a provider.
    pub async fn init(&self) -> ServiceResult<()> {
        let missing = self.missing_capabilities().await;
        if let Some(first) = missing.first() {
            return Err(ServiceError::NoProvider((*first).to_string()));
        }
        tracing::info!("bus manager initialised");
        Ok(())
    }

    /// Detach every provider and let each release its resources.
    pub async fn shutdown(&self) {
        if let Some(provider) = self.communication.take().await {
            provider.shutdown().await;
        }
        if let Some(provider) = self.memory.take().await {
            provider.shutdown().await;
        }
        if let Some(provider) = self.tools.take().await {
            provider.shutdown().await;
        }
        if let Some(provider) = self.wise_authority.take().await {
            provider.shutdown().await;
        }
        self.audit.take().await;
        tracing::info!("bus manager shut down");
    }

    // ── Audit ───────────────────────────────────────────────────────────

    pub async fn audit(&self) -> ServiceResult<Arc<AuditService>> {
        self.audit.get().await
    }

    // ── Communication ───────────────────────────────────────────────────

    pub async fn send_message(&self, message: &OutboundMessage) -> ServiceResult<bool> {
        let provider = self.communication.get().await?;
        self.call("communication", || provider.send_message(message))
            .await
    }

    pub async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> ServiceResult<Vec<Message>> {
        let provider = self.communication.get().await?;
        self.call("communication", || {
            provider.fetch_messages(channel_id, limit, before)
        })
        .await
    }

    // ── Memory ──────────────────────────────────────────────────────────

    pub async fn memorize(&self, scope: MemoryScope, entry: MemoryEntry) -> ServiceResult<()> {
        let provider = self.memory.get().await?;
        self.call("memory", || provider.store(scope, entry.clone()))
            .await
    }

    pub async fn recall_key(
        &self,
        scope: MemoryScope,
        key: &str,
    ) -> ServiceResult<Option<MemoryEntry>> {
        let provider = self.memory.get().await?;
        self.call("memory", || provider.fetch(scope, key)).await
    }

    pub async fn recall(
        &self,
        scope: MemoryScope,
        prefix: &str,
        limit: usize,
    ) -> ServiceResult<Vec<MemoryEntry>> {
        let provider = self.memory.get().await?;
        self.call("memory", || provider.query(scope, prefix, limit))
            .await
    }

    pub async fn forget(&self, scope: MemoryScope, key: &str) -> ServiceResult<bool> {
        let provider = self.memory.get().await?;
        self.call("memory", || provider.forget(scope, key)).await
    }

    // ── Tools ───────────────────────────────────────────────────────────

    pub async fn list_tools(&self) -> ServiceResult<Vec<String>> {
        let provider = self.tools.get().await?;
        self.call("tool", || provider.list_tools()).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> ServiceResult<ToolResult> {
        let provider = self.tools.get().await?;
        self.call("tool", || provider.call_tool(name, arguments, timeout))
            .await
    }

    // ── Wise Authority ──────────────────────────────────────────────────

    pub async fn fetch_guidance(&self, request: &GuidanceRequest) -> ServiceResult<Option<String>> {
        let provider = self.wise_authority.get().await?;
        self.call("wise_authority", || provider.fetch_guidance(request))
            .await
    }

    pub async fn send_deferral(&self, request: &DeferralRequest) -> ServiceResult<bool> {
        let provider = self.wise_authority.get().await?;
        self.call("wise_authority", || provider.send_deferral(request))
            .await
    }

    // ── Retry core ──────────────────────────────────────────────────────

    async fn call<T, F, Fut>(&self, capability: &'static str, mut op: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let attempts = self.policy.attempts.max(1);
        let timeout_ms = u64::try_from(self.policy.call_timeout.as_millis()).unwrap_or(u64::MAX);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let outcome = match tokio::time::timeout(self.policy.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout {
                    capability: capability.to_string(),
                    timeout_ms,
                }),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(capability, attempt, "bus call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        capability,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "bus call failed"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.jittered(attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ServiceError::Exhausted {
            capability: capability.to_string(),
            attempts,
            message: last_error,
        })
    }
}

async fn swapped<S: Service + ?Sized>(capability: &'static str, previous: &S, next: &str) {
    tracing::info!(
        capability,
        previous = %previous.name(),
        provider = %next,
        "provider hot-swapped"
    );
    previous.shutdown().await;
}
