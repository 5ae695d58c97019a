//! In-process providers so the runtime works without external services.

use super::services::{
    CommunicationService, DeferralRequest, GuidanceRequest, MemoryEntry, MemoryService, Message,
    OutboundMessage, Service, ServiceResult, ToolResult, ToolService, WiseAuthorityService,
};
use crate::error::ServiceError;
use crate::schemas::MemoryScope;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

// ─── Communication ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Mailbox {
    messages: Vec<Message>,
    delivered: HashSet<(String, String)>,
}

/// Writes outgoing messages to the log and keeps them in an outbox.
///
/// A repeated `(correlation_id, thought_id)` pair is acknowledged without a
/// second delivery.
pub struct LocalCommunication {
    agent_id: String,
    mailbox: Mutex<Mailbox>,
}

impl LocalCommunication {
    pub fn new() -> Self {
        Self::with_agent_id("ciris")
    }

    pub fn with_agent_id(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            mailbox: Mutex::new(Mailbox::default()),
        }
    }

    /// Record an inbound message, as a front-end would.
    pub async fn deliver_inbound(
        &self,
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Message {
        let message = Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            author_id: author_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
        };
        self.mailbox.lock().await.messages.push(message.clone());
        message
    }

    /// Messages this agent sent, oldest first.
    pub async fn outbox(&self) -> Vec<Message> {
        self.mailbox
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| m.author_id == self.agent_id)
            .cloned()
            .collect()
    }
}

impl Default for LocalCommunication {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for LocalCommunication {
    fn name(&self) -> &str {
        "local-communication"
    }
}

impl CommunicationService for LocalCommunication {
    fn send_message<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            let mut mailbox = self.mailbox.lock().await;
            let key = (message.correlation_id.clone(), message.thought_id.clone());
            if !mailbox.delivered.insert(key) {
                tracing::debug!(
                    thought_id = %message.thought_id,
                    "duplicate send suppressed"
                );
                return Ok(true);
            }
            tracing::info!(
                channel = %message.channel_id,
                correlation_id = %message.correlation_id,
                content = %message.content,
                "agent message"
            );
            mailbox.messages.push(Message {
                message_id: uuid::Uuid::new_v4().to_string(),
                channel_id: message.channel_id.clone(),
                author_id: self.agent_id.clone(),
                content: message.content.clone(),
                timestamp: Utc::now(),
            });
            Ok(true)
        })
    }

    fn fetch_messages<'a>(
        &'a self,
        channel_id: &'a str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<Vec<Message>>> + Send + 'a>> {
        Box::pin(async move {
            let mailbox = self.mailbox.lock().await;
            Ok(mailbox
                .messages
                .iter()
                .rev()
                .filter(|m| m.channel_id == channel_id)
                .filter(|m| before.is_none_or(|cutoff| m.timestamp < cutoff))
                .take(limit)
                .cloned()
                .collect())
        })
    }
}

// ─── Memory ─────────────────────────────────────────────────────────────────

/// Memory graph kept in a map per scope.
pub struct InMemoryMemory {
    nodes: RwLock<BTreeMap<(String, String), MemoryEntry>>,
}

fn node_key(scope: MemoryScope, key: &str) -> (String, String) {
    (scope.to_string(), key.to_string())
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

impl Default for InMemoryMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for InMemoryMemory {
    fn name(&self) -> &str {
        "in-memory-graph"
    }
}

impl MemoryService for InMemoryMemory {
    fn store<'a>(
        &'a self,
        scope: MemoryScope,
        entry: MemoryEntry,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.nodes
                .write()
                .await
                .insert(node_key(scope, &entry.key), entry);
            Ok(())
        })
    }

    fn fetch<'a>(
        &'a self,
        scope: MemoryScope,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<Option<MemoryEntry>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.nodes.read().await.get(&node_key(scope, key)).cloned()) })
    }

    fn query<'a>(
        &'a self,
        scope: MemoryScope,
        prefix: &'a str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<Vec<MemoryEntry>>> + Send + 'a>> {
        Box::pin(async move {
            let scope = scope.to_string();
            let nodes = self.nodes.read().await;
            Ok(nodes
                .range((scope.clone(), prefix.to_string())..)
                .take_while(|((s, k), _)| *s == scope && k.starts_with(prefix))
                .take(limit)
                .map(|(_, entry)| entry.clone())
                .collect())
        })
    }

    fn forget<'a>(
        &'a self,
        scope: MemoryScope,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .nodes
                .write()
                .await
                .remove(&node_key(scope, key))
                .is_some())
        })
    }
}

// ─── Tools ──────────────────────────────────────────────────────────────────

/// Built-in tools: `echo` returns its arguments, `clock` the current time.
pub struct LocalToolService;

impl LocalToolService {
    pub const TOOLS: [&'static str; 2] = ["echo", "clock"];

    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalToolService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for LocalToolService {
    fn name(&self) -> &str {
        "local-tools"
    }
}

impl ToolService for LocalToolService {
    fn list_tools(&self) -> Pin<Box<dyn Future<Output = ServiceResult<Vec<String>>> + Send + '_>> {
        Box::pin(async { Ok(Self::TOOLS.iter().map(ToString::to_string).collect()) })
    }

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a Value,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<ToolResult>> + Send + 'a>> {
        Box::pin(async move {
            match name {
                "echo" => Ok(ToolResult::ok(arguments.clone())),
                "clock" => Ok(ToolResult::ok(json!({ "now": Utc::now().to_rfc3339() }))),
                other => Err(ServiceError::Rejected {
                    capability: "tool".into(),
                    message: format!("unknown tool '{other}'"),
                }),
            }
        })
    }
}

// ─── Wise Authority ─────────────────────────────────────────────────────────

/// Queues deferrals for a human reviewer and answers guidance requests from
/// a fixed table.
pub struct LocalWiseAuthority {
    deferrals: Mutex<Vec<DeferralRequest>>,
    guidance: RwLock<BTreeMap<String, String>>,
}

impl LocalWiseAuthority {
    pub fn new() -> Self {
        Self {
            deferrals: Mutex::new(Vec::new()),
            guidance: RwLock::new(BTreeMap::new()),
        }
    }

    /// Answer guidance requests for `thought_id` with `text`.
    pub async fn provide_guidance(&self, thought_id: impl Into<String>, text: impl Into<String>) {
        self.guidance
            .write()
            .await
            .insert(thought_id.into(), text.into());
    }

    pub async fn deferrals(&self) -> Vec<DeferralRequest> {
        self.deferrals.lock().await.clone()
    }
}

impl Default for LocalWiseAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for LocalWiseAuthority {
    fn name(&self) -> &str {
        "local-wise-authority"
    }
}

impl WiseAuthorityService for LocalWiseAuthority {
    fn fetch_guidance<'a>(
        &'a self,
        request: &'a GuidanceRequest,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<Option<String>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.guidance.read().await.get(&request.thought_id).cloned()) })
    }

    fn send_deferral<'a>(
        &'a self,
        request: &'a DeferralRequest,
    ) -> Pin<Box<dyn Future<Output = ServiceResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            let mut deferrals = self.deferrals.lock().await;
            if deferrals.iter().any(|d| d.thought_id == request.thought_id) {
                return Ok(true);
            }
            tracing::info!(
                thought_id = %request.thought_id,
                task_id = %request.task_id,
                reason = %request.reason,
                "deferral queued for wise authority"
            );
            deferrals.push(request.clone());
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(thought_id: &str, content: &str) -> OutboundMessage {
        OutboundMessage {
            channel_id: "local".into(),
            content: content.into(),
            correlation_id: "corr".into(),
            thought_id: thought_id.into(),
        }
    }

    #[tokio::test]
    async fn repeated_send_is_delivered_once() {
        let comm = LocalCommunication::new();
        assert!(comm.send_message(&outbound("th-1", "hi")).await.unwrap());
        assert!(comm.send_message(&outbound("th-1", "hi")).await.unwrap());
        assert!(comm.send_message(&outbound("th-2", "again")).await.unwrap());
        assert_eq!(comm.outbox().await.len(), 2);
    }

    #[tokio::test]
    async fn fetch_returns_newest_first_per_channel() {
        let comm = LocalCommunication::new();
        comm.deliver_inbound("local", "alice", "one").await;
        comm.deliver_inbound("other", "bob", "elsewhere").await;
        comm.deliver_inbound("local", "alice", "two").await;

        let messages = comm.fetch_messages("local", 10, None).await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "one"]);
    }

    #[tokio::test]
    async fn memory_query_matches_prefix_within_scope() {
        let memory = InMemoryMemory::new();
        for key in ["user/alice", "user/bob", "weather"] {
            memory
                .store(MemoryScope::Local, MemoryEntry::new(key, json!(key)))
                .await
                .unwrap();
        }
        memory
            .store(MemoryScope::Identity, MemoryEntry::new("user/self", json!("ciris")))
            .await
            .unwrap();

        let users = memory.query(MemoryScope::Local, "user/", 10).await.unwrap();
        let keys: Vec<_> = users.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["user/alice", "user/bob"]);

        assert!(memory.forget(MemoryScope::Local, "weather").await.unwrap());
        assert!(!memory.forget(MemoryScope::Local, "weather").await.unwrap());
        assert_eq!(memory.len().await, 3);
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let tools = LocalToolService::new();
        let args = json!({"text": "ping"});
        let echoed = tools
            .call_tool("echo", &args, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(echoed.output, args);

        let err = tools
            .call_tool("rm", &args, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected { .. }));
    }

    #[tokio::test]
    async fn deferrals_queue_once_per_thought() {
        let wa = LocalWiseAuthority::new();
        let request = DeferralRequest {
            thought_id: "th-1".into(),
            task_id: "task-1".into(),
            reason: "needs review".into(),
            defer_until: None,
        };
        wa.send_deferral(&request).await.unwrap();
        wa.send_deferral(&request).await.unwrap();
        assert_eq!(wa.deferrals().await.len(), 1);

        wa.provide_guidance("th-1", "proceed carefully").await;
        let guidance = wa
            .fetch_guidance(&GuidanceRequest {
                thought_id: "th-1".into(),
                question: "ok?".into(),
                context: None,
            })
            .await
            .unwrap();
        assert_eq!(guidance.as_deref(), Some("proceed carefully"));
    }
}
