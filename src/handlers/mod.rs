//! Action handlers: the only place where a selection has external effect.
//!
//! [`HandlerRegistry::dispatch`] runs the fixed sequence for every thought:
//! validate, audit, decrypt when allowed, call the handler, persist the
//! resulting thought/task state, release the task.

pub mod control;
pub mod external;

pub use control::{DeferHandler, PonderHandler, RejectHandler, TaskCompleteHandler};
pub use external::{
    ForgetHandler, MemorizeHandler, ObserveHandler, RecallHandler, SpeakHandler, ToolHandler,
};

use crate::audit::{AuditEntry, AuditOutcome, Direction};
use crate::buses::{BusManager, DeferralRequest, OutboundMessage};
use crate::config::Sensitivity;
use crate::dma::CsdmaResult;
use crate::error::{CirisError, ServiceError, ValidationError};
use crate::observability::{EventSender, RuntimeEvent, emit};
use crate::persistence::TaskStore;
use crate::scheduler::ThoughtScheduler;
use crate::schemas::{
    ActionKind, ActionParams, ActionSelectionResult, Task, TaskStatus, Thought, ThoughtStatus,
    ThoughtType,
};
use crate::secrets::SecretsVault;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Sent to the task's channel when a thought has to be escalated.
pub const FALLBACK_MESSAGE: &str =
    "I could not complete this request safely and have passed it to a human reviewer.";

/// Services shared by every handler.
pub struct HandlerDeps {
    pub buses: Arc<BusManager>,
    pub scheduler: Arc<ThoughtScheduler>,
    pub vault: Arc<SecretsVault>,
    pub events: EventSender,
    pub agent_id: String,
    pub default_channel: String,
    pub max_depth: u32,
    pub sensitivity: Sensitivity,
    /// Actions whose parameters get secret references resolved before the
    /// handler runs.
    pub auto_decrypt: Vec<ActionKind>,
}

impl HandlerDeps {
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.scheduler.store()
    }

    /// Explicit channel, else the task's origin, else the agent default.
    pub fn channel_for(&self, explicit: Option<&str>, task: &Task) -> String {
        explicit
            .or(task.context.channel_id.as_deref())
            .unwrap_or(&self.default_channel)
            .to_string()
    }
}

/// A thought ready for its handler.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub thought: Thought,
    pub task: Task,
    /// Final selection after the guardrail chain.
    pub selection: ActionSelectionResult,
    pub guardrail_hits: Vec<String>,
    pub csdma: Option<CsdmaResult>,
}

/// What a handler wants to happen next.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Complete the thought and continue the task with a child thought.
    FollowUp {
        thought_type: ThoughtType,
        content: String,
        notes: Vec<String>,
    },
    /// Complete the thought and move the task to a terminal status.
    Close { status: TaskStatus, summary: String },
}

impl Effect {
    pub fn follow_up(thought_type: ThoughtType, content: impl Into<String>) -> Self {
        Self::FollowUp {
            thought_type,
            content: content.into(),
            notes: Vec::new(),
        }
    }

    pub fn close(status: TaskStatus, summary: impl Into<String>) -> Self {
        Self::Close {
            status,
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResult {
    pub thought_id: String,
    pub task_id: String,
    /// The action that was requested, not any escalation.
    pub action: ActionKind,
    pub success: bool,
    pub follow_up: Option<String>,
    pub task_status: Option<TaskStatus>,
    pub error: Option<String>,
}

impl HandlerResult {
    fn new(dispatch: &Dispatch) -> Self {
        Self {
            thought_id: dispatch.thought.thought_id.clone(),
            task_id: dispatch.task.task_id.clone(),
            action: dispatch.selection.kind(),
            success: false,
            follow_up: None,
            task_status: None,
            error: None,
        }
    }

    fn failed(mut self, error: impl ToString) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Effect, CirisError>> + Send + 'a>>;

pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Perform the action. `params` may differ from the dispatched
    /// selection when secrets were decrypted for this call.
    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a>;
}

/// Error for a handler that received parameters of another action.
pub(crate) fn mismatch(expected: ActionKind, params: &ActionParams) -> CirisError {
    ValidationError::InvalidField {
        action: expected.to_string(),
        field: "type".into(),
        message: format!("received {} parameters", params.kind()),
    }
    .into()
}

fn direction(kind: ActionKind) -> Direction {
    match kind {
        ActionKind::Speak | ActionKind::Tool | ActionKind::Defer => Direction::Outbound,
        ActionKind::Observe => Direction::Inbound,
        _ => Direction::Internal,
    }
}

fn outcome(kind: ActionKind) -> AuditOutcome {
    match kind {
        ActionKind::Defer => AuditOutcome::Deferred,
        ActionKind::Reject => AuditOutcome::Blocked,
        _ => AuditOutcome::Ok,
    }
}

/// Failures after which the task is handed to a wise authority instead of
/// being reconsidered.
fn needs_escalation(error: &CirisError) -> bool {
    matches!(
        error,
        CirisError::Service(
            ServiceError::Exhausted { .. } | ServiceError::Timeout { .. } | ServiceError::NoProvider(_)
        ) | CirisError::Integrity(_)
    )
}

/// One handler per action kind plus the dispatch sequence around them.
pub struct HandlerRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
    deps: HandlerDeps,
}

impl HandlerRegistry {
    pub fn new(deps: HandlerDeps) -> Self {
        Self {
            handlers: HashMap::new(),
            deps,
        }
    }

    /// A registry with the built-in handler for every action.
    pub fn with_defaults(deps: HandlerDeps) -> Self {
        let mut registry = Self::new(deps);
        registry.register(Box::new(SpeakHandler));
        registry.register(Box::new(MemorizeHandler));
        registry.register(Box::new(RecallHandler));
        registry.register(Box::new(ForgetHandler));
        registry.register(Box::new(ObserveHandler));
        registry.register(Box::new(ToolHandler));
        registry.register(Box::new(PonderHandler));
        registry.register(Box::new(RejectHandler));
        registry.register(Box::new(DeferHandler));
        registry.register(Box::new(TaskCompleteHandler));
        registry
    }

    /// Register a handler. Replaces any existing handler for the same kind.
    pub fn register(&mut self, handler: Box<dyn ActionHandler>) {
        let handler: Arc<dyn ActionHandler> = Arc::from(handler);
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: ActionKind) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(&kind)
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<ActionKind> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn deps(&self) -> &HandlerDeps {
        &self.deps
    }

    /// Execute `dispatch` and release its task for the next round. A failure
    /// that left the thought PROCESSING, such as a withheld action, puts it
    /// back in the queue.
    pub async fn dispatch(&self, dispatch: Dispatch) -> HandlerResult {
        let result = self.run(&dispatch).await;
        let thought_id = dispatch.thought.thought_id.as_str();
        let task_id = dispatch.task.task_id.as_str();
        if result.success {
            self.deps.scheduler.release(task_id).await;
        } else if let Err(e) = self.deps.scheduler.requeue(thought_id, task_id).await {
            tracing::error!(thought_id, error = %e, "failed thought could not be requeued");
        }

        if let Some(status) = result.task_status {
            emit(
                &self.deps.events,
                RuntimeEvent::TaskClosed {
                    task_id: result.task_id.clone(),
                    status,
                },
            );
        }
        emit(
            &self.deps.events,
            RuntimeEvent::ThoughtDispatched {
                thought_id: result.thought_id.clone(),
                task_id: result.task_id.clone(),
                action: result.action,
                success: result.success,
            },
        );
        result
    }

    async fn run(&self, dispatch: &Dispatch) -> HandlerResult {
        let kind = dispatch.selection.kind();
        let Some(handler) = self.handlers.get(&kind).cloned() else {
            return self
                .reconsider(dispatch, format!("no handler is registered for {kind}"))
                .await;
        };

        if let Err(e) = dispatch.selection.action.validate() {
            tracing::warn!(thought_id = %dispatch.thought.thought_id, error = %e, "invalid action parameters");
            return self.reconsider(dispatch, e.to_string()).await;
        }

        // Audit before effect; no record, no action.
        if let Err(e) = self
            .audit(self.action_entry(dispatch, outcome(kind)))
            .await
        {
            tracing::error!(thought_id = %dispatch.thought.thought_id, error = %e, "audit failed; action withheld");
            return HandlerResult::new(dispatch).failed(e);
        }

        let params = match self.decrypt(dispatch).await {
            Ok(params) => params,
            Err(e) => return self.handler_failed(dispatch, e).await,
        };

        match handler.handle(&self.deps, dispatch, &params).await {
            Ok(effect) => self.apply(dispatch, effect).await,
            Err(e) => self.handler_failed(dispatch, e).await,
        }
    }

    async fn audit(&self, entry: AuditEntry) -> Result<(), CirisError> {
        let audit = self.deps.buses.audit().await?;
        if let Err(e) = audit.record(entry).await {
            emit(
                &self.deps.events,
                RuntimeEvent::IntegrityFault {
                    message: e.to_string(),
                },
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn action_entry(&self, dispatch: &Dispatch, outcome: AuditOutcome) -> AuditEntry {
        let kind = dispatch.selection.kind();
        let stakeholder = match &dispatch.selection.action {
            ActionParams::Speak(p) => self.deps.channel_for(p.channel_id.as_deref(), &dispatch.task),
            ActionParams::Observe(p) => {
                self.deps.channel_for(p.channel_id.as_deref(), &dispatch.task)
            }
            ActionParams::Defer(_) => "wise_authority".to_string(),
            _ => self.deps.agent_id.clone(),
        };
        let csdma = dispatch
            .csdma
            .as_ref()
            .map(|c| json!({"score": c.score, "flags": c.flag_names()}));
        let parameters = serde_json::to_value(&dispatch.selection.action).unwrap_or(Value::Null);

        AuditEntry::new(direction(kind), stakeholder, kind.to_string(), outcome)
            .for_thought(&dispatch.thought, dispatch.task.correlation_id())
            .with_hits(dispatch.guardrail_hits.clone())
            .with_detail(json!({
                "rationale": dispatch.selection.rationale,
                "action": parameters,
                "csdma": csdma,
            }))
    }

    /// The parameters handed to the handler, with secrets resolved only for
    /// allowlisted actions.
    async fn decrypt(&self, dispatch: &Dispatch) -> Result<ActionParams, CirisError> {
        let action = &dispatch.selection.action;
        if !self.deps.auto_decrypt.contains(&action.kind()) {
            return Ok(action.clone());
        }
        let mut value = serde_json::to_value(action).map_err(anyhow::Error::from)?;
        self.deps.vault.reveal_json(&mut value).await?;
        Ok(serde_json::from_value(value).map_err(anyhow::Error::from)?)
    }

    async fn apply(&self, dispatch: &Dispatch, effect: Effect) -> HandlerResult {
        let mut result = HandlerResult::new(dispatch);
        let store = self.deps.store();
        let thought_id = dispatch.thought.thought_id.as_str();

        match effect {
            Effect::FollowUp {
                thought_type,
                content,
                notes,
            } => {
                if dispatch.thought.at_depth_limit(self.deps.max_depth) {
                    return self
                        .escalate(dispatch, "maximum thought depth reached".to_string())
                        .await;
                }
                let content = match self.deps.vault.protect(&content, self.deps.sensitivity).await {
                    Ok(protected) => protected.text,
                    Err(e) => return self.escalate(dispatch, format!("secrets filter failed: {e}")).await,
                };
                let child = dispatch.thought.child(thought_type, content).with_notes(notes);
                if let Err(e) = store.add_thought(&child).await {
                    return result.failed(e);
                }
                if let Err(e) = store
                    .update_thought_status(thought_id, ThoughtStatus::Completed, Some(&dispatch.selection))
                    .await
                {
                    return result.failed(e);
                }
                tracing::debug!(
                    thought_id,
                    follow_up = %child.thought_id,
                    depth = child.depth,
                    "follow-up thought created"
                );
                result.follow_up = Some(child.thought_id);
            }
            Effect::Close { status, summary } => {
                if let Err(e) = store
                    .update_thought_status(thought_id, ThoughtStatus::Completed, Some(&dispatch.selection))
                    .await
                {
                    return result.failed(e);
                }
                match store.update_task_status(&dispatch.task.task_id, status).await {
                    Ok(_) => {
                        tracing::info!(task_id = %dispatch.task.task_id, status = %status, summary = %summary, "task closed");
                        result.task_status = Some(status);
                    }
                    Err(e) => return result.failed(e),
                }
            }
        }

        result.success = true;
        result
    }

    async fn handler_failed(&self, dispatch: &Dispatch, error: CirisError) -> HandlerResult {
        let kind = dispatch.selection.kind();
        tracing::warn!(
            thought_id = %dispatch.thought.thought_id,
            action = %kind,
            error = %error,
            "handler failed"
        );
        if needs_escalation(&error) {
            return self
                .escalate(dispatch, format!("{kind} could not be completed: {error}"))
                .await;
        }
        self.reconsider(dispatch, error.to_string()).await
    }

    /// Fail the thought and ask for another look in a PONDER follow-up, or
    /// escalate when no deeper thought is allowed.
    async fn reconsider(&self, dispatch: &Dispatch, problem: String) -> HandlerResult {
        let kind = dispatch.selection.kind();
        let entry = self
            .action_entry(dispatch, AuditOutcome::Error)
            .with_detail(json!({"error": problem, "rationale": dispatch.selection.rationale}));
        if let Err(e) = self.audit(entry).await {
            return HandlerResult::new(dispatch).failed(e);
        }

        if dispatch.thought.at_depth_limit(self.deps.max_depth) {
            return self.escalate(dispatch, problem).await;
        }

        let mut result = HandlerResult::new(dispatch);
        let store = self.deps.store();
        let mut notes = dispatch.thought.ponder_notes.clone();
        notes.push(format!("{kind} failed: {problem}"));
        let child = dispatch
            .thought
            .child(ThoughtType::Ponder, dispatch.thought.content.clone())
            .with_notes(notes);

        if let Err(e) = store.add_thought(&child).await {
            return result.failed(e);
        }
        if let Err(e) = store
            .update_thought_status(
                &dispatch.thought.thought_id,
                ThoughtStatus::Failed,
                Some(&dispatch.selection),
            )
            .await
        {
            return result.failed(e);
        }
        result.follow_up = Some(child.thought_id);
        result.failed(problem)
    }

    /// Hand the task to a wise authority: audit the deferral, notify the
    /// channel, fail the thought and defer the task.
    async fn escalate(&self, dispatch: &Dispatch, reason: String) -> HandlerResult {
        let mut result = HandlerResult::new(dispatch);
        let deferral = ActionSelectionResult::defer(reason.clone());
        let entry = AuditEntry::new(
            Direction::Outbound,
            "wise_authority",
            ActionKind::Defer.to_string(),
            AuditOutcome::Deferred,
        )
        .for_thought(&dispatch.thought, dispatch.task.correlation_id())
        .with_hits(dispatch.guardrail_hits.clone())
        .with_detail(json!({"reason": reason, "escalated_from": dispatch.selection.kind()}));
        if let Err(e) = self.audit(entry).await {
            return result.failed(e);
        }

        let request = DeferralRequest {
            thought_id: dispatch.thought.thought_id.clone(),
            task_id: dispatch.task.task_id.clone(),
            reason: reason.clone(),
            defer_until: None,
        };
        if let Err(e) = self.deps.buses.send_deferral(&request).await {
            tracing::warn!(task_id = %dispatch.task.task_id, error = %e, "deferral not delivered");
        }
        self.send_fallback(dispatch).await;

        let store = self.deps.store();
        if let Err(e) = store
            .update_thought_status(&dispatch.thought.thought_id, ThoughtStatus::Failed, Some(&deferral))
            .await
        {
            return result.failed(e);
        }
        match store
            .update_task_status(&dispatch.task.task_id, TaskStatus::Deferred)
            .await
        {
            Ok(_) => result.task_status = Some(TaskStatus::Deferred),
            Err(e) => return result.failed(e),
        }
        tracing::info!(task_id = %dispatch.task.task_id, reason = %reason, "task escalated to wise authority");
        result.failed(reason)
    }

    async fn send_fallback(&self, dispatch: &Dispatch) {
        let message = OutboundMessage {
            channel_id: self.deps.channel_for(None, &dispatch.task),
            content: FALLBACK_MESSAGE.to_string(),
            correlation_id: dispatch.task.correlation_id().to_string(),
            thought_id: dispatch.thought.thought_id.clone(),
        };
        if let Err(e) = self.deps.buses.send_message(&message).await {
            tracing::warn!(task_id = %dispatch.task.task_id, error = %e, "fallback message not delivered");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testkit::Harness;
    use super::*;
    use crate::schemas::{MemoryScope, RecallParams};

    #[tokio::test]
    async fn every_action_has_a_handler() {
        use strum::IntoEnumIterator;
        let harness = Harness::new(7).await;
        assert_eq!(harness.registry.kinds(), ActionKind::iter().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn speak_audits_delivers_and_follows_up() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("Hello CIRIS").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(&task, &thought, ActionSelectionResult::speak("Hi!", "greet")))
            .await;

        assert!(result.success, "{result:?}");
        let outbox = harness.comms.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].channel_id, "chan-1");

        let store = harness.scheduler.store();
        let follow_up = store
            .get_thought(result.follow_up.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(follow_up.thought_type, ThoughtType::Followup);
        assert!(follow_up.content.starts_with(crate::dma::SPOKE_PREFIX));
        assert_eq!(follow_up.depth, 1);

        let records = harness
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.action, "SPEAK");
        assert!(harness.scheduler.owned_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_parameters_have_no_effect_and_ponder() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("Hello").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(&task, &thought, ActionSelectionResult::speak("  ", "empty")))
            .await;

        assert!(!result.success);
        assert!(harness.comms.outbox().await.is_empty());
        let records = harness
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.outcome, AuditOutcome::Error);

        let store = harness.scheduler.store();
        let follow_up = store
            .get_thought(result.follow_up.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(follow_up.thought_type, ThoughtType::Ponder);
        let original = store.get_thought(&thought.thought_id).await.unwrap().unwrap();
        assert_eq!(original.status, ThoughtStatus::Failed);
    }

    #[tokio::test]
    async fn invalid_parameters_at_depth_limit_defer() {
        let harness = Harness::new(0).await;
        let (task, thought) = harness.claimed("Hello").await;
        let selection = ActionSelectionResult::new(
            ActionParams::Recall(RecallParams {
                scope: MemoryScope::Local,
                query: String::new(),
                limit: 10,
            }),
            "look it up",
        );
        let result = harness
            .registry
            .dispatch(harness.dispatch(&task, &thought, selection))
            .await;

        assert_eq!(result.task_status, Some(TaskStatus::Deferred));
        assert_eq!(harness.wa.deferrals().await.len(), 1);
        let outbox = harness.comms.outbox().await;
        assert_eq!(outbox[0].content, FALLBACK_MESSAGE);
    }

    #[tokio::test]
    async fn withheld_action_returns_thought_to_the_queue() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("Hello").await;
        harness
            .registry
            .dispatch(harness.dispatch(&task, &thought, ActionSelectionResult::speak("Hi!", "greet")))
            .await;
        sqlx::query("UPDATE audit_log SET action = 'FORGED'")
            .execute(harness.audit.pool())
            .await
            .unwrap();
        assert!(harness.audit.verify_chain().await.is_err());

        let (task, thought) = harness.claimed("Hello again").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(&task, &thought, ActionSelectionResult::speak("Hi!", "greet")))
            .await;

        assert!(!result.success);
        assert_eq!(harness.comms.outbox().await.len(), 1);
        let stored = harness
            .scheduler
            .store()
            .get_thought(&thought.thought_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ThoughtStatus::Pending);
        assert!(harness.scheduler.owned_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn task_complete_closes_task() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("Hello").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                ActionSelectionResult::task_complete(Some("done".into()), "finished"),
            ))
            .await;
        assert!(result.success);
        assert_eq!(result.task_status, Some(TaskStatus::Completed));
        let stored = harness
            .scheduler
            .store()
            .get_task(&task.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn halted_audit_withholds_the_action() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("Hello").await;
        harness
            .audit
            .record(AuditEntry::new(Direction::Internal, "ciris", "BOOT", AuditOutcome::Ok))
            .await
            .unwrap();
        sqlx::query("UPDATE audit_log SET stakeholder = 'someone-else'")
            .execute(harness.audit.pool())
            .await
            .unwrap();
        assert!(harness.audit.verify_chain().await.is_err());
        assert!(harness.audit.is_halted());

        let result = harness
            .registry
            .dispatch(harness.dispatch(&task, &thought, ActionSelectionResult::speak("Hi", "greet")))
            .await;
        assert!(!result.success);
        assert!(harness.comms.outbox().await.is_empty());
    }
}
