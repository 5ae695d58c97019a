//! Handlers that reach a capability bus.

use super::{ActionHandler, Dispatch, Effect, HandlerDeps, HandlerFuture, mismatch};
use crate::buses::{MemoryEntry, OutboundMessage};
use crate::dma::SPOKE_PREFIX;
use crate::error::ServiceError;
use crate::schemas::{ActionKind, ActionParams, ThoughtType};
use std::time::Duration;

const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

pub struct SpeakHandler;

impl ActionHandler for SpeakHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Speak
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Speak(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            let channel_id = deps.channel_for(p.channel_id.as_deref(), &dispatch.task);
            let message = OutboundMessage {
                channel_id: channel_id.clone(),
                content: p.content.clone(),
                correlation_id: dispatch.task.correlation_id().to_string(),
                thought_id: dispatch.thought.thought_id.clone(),
            };
            if !deps.buses.send_message(&message).await? {
                return Err(ServiceError::Rejected {
                    capability: "communication".into(),
                    message: format!("channel {channel_id} did not accept the message"),
                }
                .into());
            }
            Ok(Effect::follow_up(
                ThoughtType::Followup,
                format!("{SPOKE_PREFIX} {}", p.content),
            ))
        })
    }
}

pub struct MemorizeHandler;

impl ActionHandler for MemorizeHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Memorize
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        _dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Memorize(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            deps.buses
                .memorize(p.scope, MemoryEntry::new(p.key.as_str(), p.value.clone()))
                .await?;
            Ok(Effect::follow_up(
                ThoughtType::Followup,
                format!("Memorized {}/{} = {}", p.scope, p.key, p.value),
            ))
        })
    }
}

pub struct RecallHandler;

impl ActionHandler for RecallHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Recall
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        _dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Recall(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            let entries = deps.buses.recall(p.scope, &p.query, p.limit).await?;
            let content = if entries.is_empty() {
                format!("Recalled nothing for '{}' in {}", p.query, p.scope)
            } else {
                let found = entries
                    .iter()
                    .map(|e| format!("{} = {}", e.key, e.value))
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("Recalled from {}: {found}", p.scope)
            };
            Ok(Effect::follow_up(ThoughtType::Followup, content))
        })
    }
}

pub struct ForgetHandler;

impl ActionHandler for ForgetHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Forget
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        _dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Forget(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            let removed = deps.buses.forget(p.scope, &p.key).await?;
            tracing::info!(scope = %p.scope, key = %p.key, removed, reason = %p.reason, "memory forgotten");
            let content = if removed {
                format!("Forgot {}/{}", p.scope, p.key)
            } else {
                format!("Nothing was stored under {}/{}", p.scope, p.key)
            };
            Ok(Effect::follow_up(ThoughtType::Followup, content))
        })
    }
}

pub struct ObserveHandler;

impl ActionHandler for ObserveHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Observe
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Observe(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            let channel_id = deps.channel_for(p.channel_id.as_deref(), &dispatch.task);
            let messages = deps
                .buses
                .fetch_messages(&channel_id, p.limit, p.before)
                .await?;
            let content = if messages.is_empty() {
                format!("Observed no messages in {channel_id}")
            } else {
                // Providers return newest first; read them in order.
                let transcript = messages
                    .iter()
                    .rev()
                    .map(|m| format!("{}: {}", m.author_id, m.content))
                    .collect::<Vec<_>>()
                    .join(" | ");
                format!("Observed {} messages in {channel_id}: {transcript}", messages.len())
            };
            Ok(Effect::follow_up(ThoughtType::Followup, content))
        })
    }
}

pub struct ToolHandler;

impl ActionHandler for ToolHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Tool
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        _dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Tool(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            let timeout =
                Duration::from_secs(p.timeout_seconds.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS));
            let result = deps.buses.call_tool(&p.name, &p.arguments, timeout).await?;
            let content = if result.success {
                format!("Tool {} returned {}", p.name, result.output)
            } else {
                format!(
                    "Tool {} failed: {}",
                    p.name,
                    result.error.as_deref().unwrap_or("no error message")
                )
            };
            Ok(Effect::follow_up(ThoughtType::Followup, content))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::FALLBACK_MESSAGE;
    use super::super::testkit::Harness;
    use crate::audit::AuditOutcome;
    use crate::buses::{MemoryService, Service, ServiceResult, ToolResult, ToolService};
    use crate::error::ServiceError;
    use crate::schemas::{
        ActionParams, ActionSelectionResult, ForgetParams, MemorizeParams, MemoryScope,
        ObserveParams, RecallParams, TaskStatus, ToolParams,
    };
    use serde_json::{Value, json};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// A tool provider whose backend is permanently down.
    #[derive(Default)]
    struct Unreachable {
        calls: AtomicU32,
    }

    impl Service for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }
    }

    impl ToolService for Unreachable {
        fn list_tools(&self) -> Pin<Box<dyn Future<Output = ServiceResult<Vec<String>>> + Send + '_>> {
            Box::pin(async { Ok(vec!["echo".to_string()]) })
        }

        fn call_tool<'a>(
            &'a self,
            _name: &'a str,
            _arguments: &'a Value,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = ServiceResult<ToolResult>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Transient {
                    capability: "tool".into(),
                    message: "connection refused".into(),
                })
            })
        }
    }

    fn selection(action: ActionParams) -> ActionSelectionResult {
        ActionSelectionResult::new(action, "test")
    }

    async fn follow_up_content(harness: &Harness, thought_id: Option<&str>) -> String {
        harness
            .scheduler
            .store()
            .get_thought(thought_id.unwrap())
            .await
            .unwrap()
            .unwrap()
            .content
    }

    #[tokio::test]
    async fn memorize_then_recall() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("remember colour=blue").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                selection(ActionParams::Memorize(MemorizeParams {
                    scope: MemoryScope::Local,
                    key: "colour".into(),
                    value: json!("blue"),
                })),
            ))
            .await;
        assert!(result.success);
        assert!(
            harness
                .memory
                .fetch(MemoryScope::Local, "colour")
                .await
                .unwrap()
                .is_some()
        );

        let (task, thought) = harness.claimed("recall colour").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                selection(ActionParams::Recall(RecallParams {
                    scope: MemoryScope::Local,
                    query: "col".into(),
                    limit: 10,
                })),
            ))
            .await;
        let content = follow_up_content(&harness, result.follow_up.as_deref()).await;
        assert!(content.contains("colour = \"blue\""), "{content}");
    }

    #[tokio::test]
    async fn forget_reports_missing_key() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("forget colour").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                selection(ActionParams::Forget(ForgetParams {
                    scope: MemoryScope::Local,
                    key: "colour".into(),
                    reason: "requested".into(),
                })),
            ))
            .await;
        let content = follow_up_content(&harness, result.follow_up.as_deref()).await;
        assert!(content.starts_with("Nothing was stored"), "{content}");
    }

    #[tokio::test]
    async fn observe_reads_channel_in_order() {
        let harness = Harness::new(7).await;
        harness.comms.deliver_inbound("chan-1", "alice", "first").await;
        harness.comms.deliver_inbound("chan-1", "bob", "second").await;
        let (task, thought) = harness.claimed("observe").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                selection(ActionParams::Observe(ObserveParams {
                    channel_id: None,
                    limit: 20,
                    before: None,
                })),
            ))
            .await;
        let content = follow_up_content(&harness, result.follow_up.as_deref()).await;
        assert_eq!(
            content,
            "Observed 2 messages in chan-1: alice: first | bob: second"
        );
    }

    #[tokio::test]
    async fn tool_sees_decrypted_arguments_but_record_does_not() {
        let harness = Harness::new(7).await;
        let vault = &harness.registry.deps().vault;
        let mut arguments = json!({"password": "password=hunter2secret"});
        vault
            .protect_json(&mut arguments, crate::config::Sensitivity::Medium)
            .await
            .unwrap();
        assert!(!arguments.to_string().contains("hunter2secret"));

        let (task, thought) = harness.claimed("tool echo").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                selection(ActionParams::Tool(ToolParams {
                    name: "echo".into(),
                    arguments,
                    timeout_seconds: Some(5),
                })),
            ))
            .await;
        assert!(result.success, "{result:?}");

        // The echo output is protected again before it is stored.
        let content = follow_up_content(&harness, result.follow_up.as_deref()).await;
        assert!(content.starts_with("Tool echo returned"));
        assert!(!content.contains("hunter2secret"), "{content}");

        let records = harness
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        assert!(!records[0].entry.detail.to_string().contains("hunter2secret"));
    }

    #[tokio::test]
    async fn unknown_tool_is_reconsidered() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("tool missing").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                selection(ActionParams::Tool(ToolParams {
                    name: "missing".into(),
                    arguments: json!({}),
                    timeout_seconds: None,
                })),
            ))
            .await;
        assert!(!result.success);
        assert!(result.follow_up.is_some());
        assert!(result.task_status.is_none());
    }

    #[tokio::test]
    async fn exhausted_tool_provider_defers_the_task() {
        let harness = Harness::new(7).await;
        let tools = Arc::new(Unreachable::default());
        harness.registry.deps().buses.register_tools(tools.clone()).await;
        let (task, thought) = harness.claimed("run the echo tool").await;

        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                selection(ActionParams::Tool(ToolParams {
                    name: "echo".into(),
                    arguments: json!({"text": "hi"}),
                    timeout_seconds: None,
                })),
            ))
            .await;

        assert!(!result.success);
        assert_eq!(result.task_status, Some(TaskStatus::Deferred));
        assert_eq!(tools.calls.load(Ordering::SeqCst), 2);

        let outbox = harness.comms.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].content, FALLBACK_MESSAGE);
        assert_eq!(outbox[0].channel_id, "chan-1");
        assert_eq!(harness.wa.deferrals().await.len(), 1);

        let records = harness
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        let deferred: Vec<_> = records
            .iter()
            .filter(|r| r.entry.outcome == AuditOutcome::Deferred)
            .collect();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].entry.action, "DEFER");

        let stored = harness
            .scheduler
            .store()
            .get_task(&task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TaskStatus::Deferred);
    }
}
