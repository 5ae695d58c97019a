//! Handlers that steer the task itself rather than the outside world.

use super::{ActionHandler, Dispatch, Effect, HandlerDeps, HandlerFuture, mismatch};
use crate::buses::{DeferralRequest, GuidanceRequest, OutboundMessage};
use crate::schemas::{ActionKind, ActionParams, TaskStatus, ThoughtType};

pub struct PonderHandler;

impl ActionHandler for PonderHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Ponder
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Ponder(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            let mut notes = dispatch.thought.ponder_notes.clone();
            notes.extend(p.questions.iter().filter(|q| !q.trim().is_empty()).cloned());

            let request = GuidanceRequest {
                thought_id: dispatch.thought.thought_id.clone(),
                question: p.questions.join(" "),
                context: Some(dispatch.thought.content.clone()),
            };
            match deps.buses.fetch_guidance(&request).await {
                Ok(Some(guidance)) => notes.push(format!("Guidance: {guidance}")),
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "no guidance available"),
            }

            Ok(Effect::FollowUp {
                thought_type: ThoughtType::Ponder,
                content: dispatch.thought.content.clone(),
                notes,
            })
        })
    }
}

pub struct DeferHandler;

impl ActionHandler for DeferHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Defer
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Defer(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            let request = DeferralRequest {
                thought_id: dispatch.thought.thought_id.clone(),
                task_id: dispatch.task.task_id.clone(),
                reason: p.reason.clone(),
                defer_until: p.defer_until,
            };
            // The task is deferred whether or not a reviewer was reachable.
            match deps.buses.send_deferral(&request).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(task_id = %dispatch.task.task_id, "wise authority declined the deferral");
                }
                Err(e) => {
                    tracing::warn!(task_id = %dispatch.task.task_id, error = %e, "deferral not delivered");
                }
            }
            Ok(Effect::close(TaskStatus::Deferred, p.reason.clone()))
        })
    }
}

pub struct RejectHandler;

impl ActionHandler for RejectHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Reject
    }

    fn handle<'a>(
        &'a self,
        deps: &'a HandlerDeps,
        dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::Reject(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            let message = OutboundMessage {
                channel_id: deps.channel_for(None, &dispatch.task),
                content: format!("I can't help with that: {}", p.reason),
                correlation_id: dispatch.task.correlation_id().to_string(),
                thought_id: dispatch.thought.thought_id.clone(),
            };
            if let Err(e) = deps.buses.send_message(&message).await {
                tracing::warn!(task_id = %dispatch.task.task_id, error = %e, "rejection notice not delivered");
            }
            Ok(Effect::close(TaskStatus::Failed, p.reason.clone()))
        })
    }
}

pub struct TaskCompleteHandler;

impl ActionHandler for TaskCompleteHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::TaskComplete
    }

    fn handle<'a>(
        &'a self,
        _deps: &'a HandlerDeps,
        _dispatch: &'a Dispatch,
        params: &'a ActionParams,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let ActionParams::TaskComplete(p) = params else {
                return Err(mismatch(self.kind(), params));
            };
            Ok(Effect::close(
                TaskStatus::Completed,
                p.summary.clone().unwrap_or_default(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::Harness;
    use crate::audit::AuditOutcome;
    use crate::schemas::{ActionSelectionResult, TaskStatus, ThoughtType};

    #[tokio::test]
    async fn ponder_carries_questions_and_guidance() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("Is the sky green?").await;
        harness
            .wa
            .provide_guidance(thought.thought_id.clone(), "check the weather report")
            .await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                ActionSelectionResult::ponder(vec!["What colour is it?".into()], "unsure"),
            ))
            .await;

        let follow_up = harness
            .scheduler
            .store()
            .get_thought(result.follow_up.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(follow_up.thought_type, ThoughtType::Ponder);
        assert_eq!(follow_up.content, "Is the sky green?");
        assert_eq!(
            follow_up.ponder_notes,
            vec![
                "What colour is it?".to_string(),
                "Guidance: check the weather report".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn defer_queues_for_wise_authority() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("approve the budget").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(
                &task,
                &thought,
                ActionSelectionResult::defer("needs a human decision"),
            ))
            .await;

        assert!(result.success);
        assert_eq!(result.task_status, Some(TaskStatus::Deferred));
        let deferrals = harness.wa.deferrals().await;
        assert_eq!(deferrals.len(), 1);
        assert_eq!(deferrals[0].reason, "needs a human decision");

        let records = harness
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        assert_eq!(records[0].entry.outcome, AuditOutcome::Deferred);
    }

    #[tokio::test]
    async fn reject_fails_task_and_tells_requester() {
        let harness = Harness::new(7).await;
        let (task, thought) = harness.claimed("do something harmful").await;
        let result = harness
            .registry
            .dispatch(harness.dispatch(&task, &thought, ActionSelectionResult::reject("harmful")))
            .await;

        assert_eq!(result.task_status, Some(TaskStatus::Failed));
        let outbox = harness.comms.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert!(outbox[0].content.contains("harmful"));

        let records = harness
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        assert_eq!(records[0].entry.outcome, AuditOutcome::Blocked);
    }
}
