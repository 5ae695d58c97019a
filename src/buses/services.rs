use crate::error::ServiceError;
use crate::schemas::MemoryScope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Common surface of every capability provider.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Release provider resources. Called once when the bus shuts down or
    /// the provider is swapped out.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

// ─── Communication ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// An outgoing message. `(correlation_id, thought_id)` identifies a send so
/// that a retried delivery is not shown twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub content: String,
    pub correlation_id: String,
    pub thought_id: String,
}

pub trait CommunicationService: Service {
    fn send_message<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<bool>> + Send + 'a>>;

    /// Most recent messages first.
    fn fetch_messages<'a>(
        &'a self,
        channel_id: &'a str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<Vec<Message>>> + Send + 'a>>;
}

// ─── Memory ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            updated_at: Utc::now(),
        }
    }
}

pub trait MemoryService: Service {
    fn store<'a>(
        &'a self,
        scope: MemoryScope,
        entry: MemoryEntry,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<()>> + Send + 'a>>;

    fn fetch<'a>(
        &'a self,
        scope: MemoryScope,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<Option<MemoryEntry>>> + Send + 'a>>;

    /// Entries whose key starts with `prefix`, ordered by key.
    fn query<'a>(
        &'a self,
        scope: MemoryScope,
        prefix: &'a str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<Vec<MemoryEntry>>> + Send + 'a>>;

    fn forget<'a>(
        &'a self,
        scope: MemoryScope,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<bool>> + Send + 'a>>;
}

// ─── Tools ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

pub trait ToolService: Service {
    fn list_tools(&self) -> Pin<Box<dyn Future<Output = ServiceResult<Vec<String>>> + Send + '_>>;

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a Value,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<ToolResult>> + Send + 'a>>;
}

// ─── Wise Authority ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceRequest {
    pub thought_id: String,
    pub question: String,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferralRequest {
    pub thought_id: String,
    pub task_id: String,
    pub reason: String,
    #[serde(default)]
    pub defer_until: Option<DateTime<Utc>>,
}

pub trait WiseAuthorityService: Service {
    fn fetch_guidance<'a>(
        &'a self,
        request: &'a GuidanceRequest,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<Option<String>>> + Send + 'a>>;

    fn send_deferral<'a>(
        &'a self,
        request: &'a DeferralRequest,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<bool>> + Send + 'a>>;
}
