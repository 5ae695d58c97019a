use super::support::Harness;
use ciris::audit::AuditOutcome;
use ciris::dma::{DmaStage, ReasoningBackend, ReasoningRequest};
use ciris::error::DmaError;
use ciris::schemas::{ActionKind, TaskStatus};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Never makes up its mind.
struct Ponderer;

impl ReasoningBackend for Ponderer {
    fn name(&self) -> &str {
        "ponderer"
    }

    fn evaluate<'a>(
        &'a self,
        request: &'a ReasoningRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DmaError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(match request.stage {
                DmaStage::Pdma => json!({"candidates": [{
                    "action": "PONDER",
                    "scores": {
                        "beneficence": 0.8, "non_maleficence": 1.0, "autonomy": 0.8,
                        "justice": 0.8, "transparency": 0.9, "integrity": 0.9, "coherence": 0.8
                    },
                    "rationale": "not sure yet"
                }]}),
                _ => json!({
                    "action": {"type": "PONDER", "parameters": {"questions": ["what else is there?"]}},
                    "rationale": "keep thinking",
                    "confidence": 0.5
                }),
            })
        })
    }
}

#[tokio::test]
async fn implausible_request_is_flagged_but_answered() {
    let mut harness = Harness::new().await;
    let task = harness.submit("human tries to lift building instantly").await;

    assert_eq!(harness.drive(&task.task_id, 5).await, TaskStatus::Completed);
    let outbox = harness.runtime.communication().outbox().await;
    assert_eq!(
        outbox[0].content,
        "Acknowledged: human tries to lift building instantly"
    );

    let records = harness
        .runtime
        .audit()
        .records_for_correlation(task.correlation_id())
        .await
        .unwrap();
    let speak = records.iter().find(|r| r.entry.action == "SPEAK").unwrap();
    assert_eq!(speak.entry.outcome, AuditOutcome::Ok);
    assert_eq!(speak.entry.detail["csdma"]["score"], 9);
    let flags = speak.entry.detail["csdma"]["flags"].to_string();
    assert!(flags.contains("Resource_Improbable"), "{flags}");
}

#[tokio::test]
async fn endless_pondering_is_deferred_at_the_depth_limit() {
    let mut harness = Harness::with(
        |c| c.workflow.max_thought_depth = 3,
        Some(Arc::new(Ponderer)),
    )
    .await;
    let task = harness.submit("Should the archive be purged?").await;

    assert_eq!(harness.drive(&task.task_id, 10).await, TaskStatus::Deferred);

    let thoughts = harness
        .runtime
        .scheduler()
        .store()
        .thoughts_for_task(&task.task_id)
        .await
        .unwrap();
    let deepest = thoughts.iter().max_by_key(|t| t.depth).unwrap();
    assert_eq!(deepest.depth, 3);
    assert_eq!(deepest.final_action.as_ref().unwrap().kind(), ActionKind::Defer);
    assert!(
        thoughts
            .iter()
            .filter(|t| t.depth < 3)
            .all(|t| t.final_action.as_ref().unwrap().kind() == ActionKind::Ponder)
    );

    let records = harness
        .runtime
        .audit()
        .records_for_correlation(task.correlation_id())
        .await
        .unwrap();
    let defer = records.iter().find(|r| r.entry.action == "DEFER").unwrap();
    assert!(defer.entry.guardrail_hits.iter().any(|h| h.starts_with("depth")));
    assert_eq!(harness.runtime.wise_authority().deferrals().await.len(), 1);
}
