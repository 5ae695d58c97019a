use crate::audit::{AuditEntry, AuditOutcome, Direction};
use crate::config::ConfigHandle;
use crate::conscience::{ConscienceChain, GuardrailContext, GuardrailHit};
use crate::dma::DmaPipeline;
use crate::error::{GuardrailError, Result, StoreError};
use crate::handlers::{Dispatch, HandlerRegistry, HandlerResult};
use crate::observability::{RuntimeEvent, emit};
use crate::schemas::{ActionSelectionResult, Task, Thought, ThoughtStatus};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of one batch.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub results: Vec<HandlerResult>,
    /// Thoughts that never reached a handler.
    pub failures: usize,
}

impl BatchSummary {
    pub fn error_count(&self) -> usize {
        self.failures + self.results.iter().filter(|r| !r.success).count()
    }
}

/// DMA pipeline, conscience and dispatch for a single thought.
pub struct ThoughtProcessor {
    pipeline: DmaPipeline,
    chain: ConscienceChain,
    registry: HandlerRegistry,
    config: ConfigHandle,
}

impl ThoughtProcessor {
    pub fn new(
        pipeline: DmaPipeline,
        chain: ConscienceChain,
        registry: HandlerRegistry,
        config: ConfigHandle,
    ) -> Self {
        Self {
            pipeline,
            chain,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &DmaPipeline {
        &self.pipeline
    }

    /// Process `thoughts` concurrently, at most `concurrency` at a time.
    pub async fn process_batch(self: &Arc<Self>, thoughts: Vec<Thought>, concurrency: usize) -> BatchSummary {
        self.process_batch_until(thoughts, concurrency, &CancellationToken::new())
            .await
    }

    /// Like [`ThoughtProcessor::process_batch`], but once `cancel` fires the
    /// thoughts still running get the shutdown grace period before they are
    /// aborted and requeued.
    pub async fn process_batch_until(
        self: &Arc<Self>,
        thoughts: Vec<Thought>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> BatchSummary {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut claimed: HashMap<task::Id, (String, String)> = HashMap::new();
        for thought in thoughts {
            let ids = (thought.thought_id.clone(), thought.source_task_id.clone());
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let handle = set.spawn(async move {
                let thought_id = thought.thought_id.clone();
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(anyhow::Error::from)?;
                this.process_thought(thought).await.inspect_err(|e| {
                    tracing::warn!(thought_id = %thought_id, error = %e, "thought not dispatched");
                })
            });
            claimed.insert(handle.id(), ids);
        }

        let grace = Duration::from_secs(self.config.load().states.shutdown_grace_seconds);
        let mut deadline: Option<Instant> = None;
        let mut aborted = false;
        let mut summary = BatchSummary::default();
        loop {
            let at = deadline;
            let expired = async move {
                match at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                joined = set.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    self.settle_joined(joined, &claimed, &mut summary).await;
                }
                () = cancel.cancelled(), if deadline.is_none() => {
                    tracing::info!(in_flight = set.len(), "batch cancelled; waiting out the grace period");
                    deadline = Some(Instant::now() + grace);
                }
                () = expired, if !aborted => {
                    tracing::warn!(in_flight = set.len(), "grace period elapsed; aborting thoughts");
                    set.abort_all();
                    aborted = true;
                }
            }
        }
        summary
    }

    /// Record a finished worker. A thought that never reached a handler is
    /// requeued when the failure may pass, otherwise failed with its task.
    async fn settle_joined(
        &self,
        joined: std::result::Result<(task::Id, Result<HandlerResult>), JoinError>,
        claimed: &HashMap<task::Id, (String, String)>,
        summary: &mut BatchSummary,
    ) {
        let (id, retry) = match joined {
            Ok((_, Ok(result))) => {
                summary.results.push(result);
                return;
            }
            Ok((id, Err(e))) => (id, e.is_transient()),
            Err(e) if e.is_cancelled() => (e.id(), true),
            Err(e) => {
                tracing::error!(error = %e, "thought worker panicked");
                (e.id(), false)
            }
        };
        summary.failures += 1;
        let Some((thought_id, task_id)) = claimed.get(&id) else {
            return;
        };
        let scheduler = &self.registry.deps().scheduler;
        let settled = if retry {
            scheduler.requeue(thought_id, task_id).await
        } else {
            scheduler.abandon(thought_id, task_id).await
        };
        if let Err(e) = settled {
            tracing::error!(thought_id = %thought_id, error = %e, "unfinished thought not settled");
        }
    }

    /// Evaluate one claimed thought, run the conscience over the selection
    /// and dispatch the result.
    pub async fn process_thought(&self, thought: Thought) -> Result<HandlerResult> {
        let task = self.owning_task(&thought).await?;
        let config = self.config.load_full();
        let profile = &config.agent;
        let max_depth = config.workflow.max_thought_depth;

        let mut outcome = self.pipeline.evaluate(&thought, profile).await;
        if let Some(error) = &outcome.error {
            self.audit_dma_failure(&thought, &task, error).await;
        }

        let csdma = outcome.csdma.clone();
        let ctx = GuardrailContext {
            thought: &thought,
            csdma: &csdma,
            max_depth,
        };
        let mut hits: Vec<GuardrailHit> = Vec::new();
        let mut attempts = 0;
        let selection = loop {
            let chained = self.chain.run(outcome.selection.clone(), ctx).await;
            hits.extend(chained.hits);
            let Some(feedback) = chained.retry else {
                break chained.selection;
            };
            if attempts >= config.workflow.guardrail_retry_limit {
                let err = GuardrailError::RetriesExhausted(attempts);
                tracing::warn!(thought_id = %thought.thought_id, error = %err, "deferring");
                hits.push(GuardrailHit {
                    guardrail: "conscience".into(),
                    detail: err.to_string(),
                });
                break ActionSelectionResult::defer(format!("{err}: {feedback}"));
            }
            attempts += 1;
            tracing::debug!(thought_id = %thought.thought_id, attempts, feedback = %feedback, "reselecting");
            outcome = self
                .pipeline
                .reselect(&thought, profile, &outcome, &feedback)
                .await;
        };

        let events = &self.registry.deps().events;
        for hit in &hits {
            emit(
                events,
                RuntimeEvent::GuardrailTriggered {
                    thought_id: thought.thought_id.clone(),
                    guardrail: hit.guardrail.clone(),
                    detail: hit.detail.clone(),
                },
            );
        }

        let dispatch = Dispatch {
            thought,
            task,
            selection,
            guardrail_hits: hits.iter().map(ToString::to_string).collect(),
            csdma: Some(csdma),
        };
        Ok(self.registry.dispatch(dispatch).await)
    }

    /// The live task of `thought`. A thought whose task is gone or already
    /// closed is failed and its task released.
    async fn owning_task(&self, thought: &Thought) -> Result<Task> {
        let deps = self.registry.deps();
        let task = deps.store().get_task(&thought.source_task_id).await?;
        if let Some(task) = task
            && !task.status.is_terminal()
        {
            return Ok(task);
        }

        deps.scheduler.release(&thought.source_task_id).await;
        deps.store()
            .update_thought_status(&thought.thought_id, ThoughtStatus::Failed, None)
            .await?;
        Err(StoreError::NotFound {
            kind: "open task",
            id: thought.source_task_id.clone(),
        }
        .into())
    }

    async fn audit_dma_failure(&self, thought: &Thought, task: &Task, error: &str) {
        let deps = self.registry.deps();
        let entry = AuditEntry::new(
            Direction::Internal,
            deps.agent_id.clone(),
            "DMA",
            AuditOutcome::Error,
        )
        .for_thought(thought, task.correlation_id())
        .with_detail(json!({"error": error, "backend": self.pipeline.backend_name()}));
        let recorded = match deps.buses.audit().await {
            Ok(audit) => audit.record(entry).await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = recorded {
            tracing::error!(thought_id = %thought.thought_id, error = %e, "dma failure not audited");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::Rig;
    use crate::audit::AuditOutcome;
    use crate::dma::{HeuristicBackend, ReasoningBackend, ReasoningRequest};
    use crate::error::DmaError;
    use crate::observability::RuntimeEvent;
    use crate::scheduler::BatchLimits;
    use crate::schemas::{ActionKind, TaskStatus, ThoughtStatus};
    use serde_json::Value;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Answers like the heuristic backend, `delay` late.
    struct Sluggish {
        delay: Duration,
    }

    impl ReasoningBackend for Sluggish {
        fn name(&self) -> &str {
            "sluggish"
        }

        fn evaluate<'a>(
            &'a self,
            request: &'a ReasoningRequest,
        ) -> Pin<Box<dyn Future<Output = Result<Value, DmaError>> + Send + 'a>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                HeuristicBackend::new().evaluate(request).await
            })
        }
    }

    struct Crashing;

    impl ReasoningBackend for Crashing {
        fn name(&self) -> &str {
            "crashing"
        }

        fn evaluate<'a>(
            &'a self,
            request: &'a ReasoningRequest,
        ) -> Pin<Box<dyn Future<Output = Result<Value, DmaError>> + Send + 'a>> {
            Box::pin(async move {
                if !request.thought_id.is_empty() {
                    panic!("backend crashed on {}", request.thought_id);
                }
                HeuristicBackend::new().evaluate(request).await
            })
        }
    }

    #[tokio::test]
    async fn greeting_is_spoken_then_completed() {
        let rig = Rig::new().await;
        let task = rig.submit("Hello CIRIS", 0).await;
        let scheduler = rig.ctx.scheduler();

        let batch = scheduler.pull_batch(1, BatchLimits::new(10, 10)).await.unwrap();
        let summary = rig.ctx.thoughts.process_batch(batch, 4).await;
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].action, ActionKind::Speak);
        assert_eq!(rig.comms.outbox().await[0].content, "Acknowledged: Hello CIRIS");

        let batch = scheduler.pull_batch(2, BatchLimits::new(10, 10)).await.unwrap();
        let summary = rig.ctx.thoughts.process_batch(batch, 4).await;
        assert_eq!(summary.results[0].action, ActionKind::TaskComplete);
        assert_eq!(rig.task(&task.task_id).await.status, TaskStatus::Completed);

        let records = rig
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        let actions: Vec<&str> = records.iter().map(|r| r.entry.action.as_str()).collect();
        assert_eq!(actions, vec!["SPEAK", "TASK_COMPLETE"]);
    }

    #[tokio::test]
    async fn implausible_speech_is_reconsidered_and_flagged() {
        let rig = Rig::with_config(|c| c.guardrails.plausibility_min_score = 9).await;
        let task = rig
            .submit("I want to teleport to the moon and live forever", 0)
            .await;
        let mut events = rig.events.resubscribe();

        let batch = rig
            .ctx
            .scheduler()
            .pull_batch(1, BatchLimits::new(10, 10))
            .await
            .unwrap();
        let summary = rig.ctx.thoughts.process_batch(batch, 1).await;
        assert_eq!(summary.results[0].action, ActionKind::Ponder);
        assert!(rig.comms.outbox().await.is_empty());

        let records = rig
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        let detail = records[0].entry.detail.to_string();
        assert!(detail.contains("Physical_Implausibility"), "{detail}");
        assert!(detail.contains("Chemical_Biological_Implausibility"), "{detail}");
        assert!(!records[0].entry.guardrail_hits.is_empty());

        let mut saw_guardrail = false;
        while let Ok(event) = events.try_recv() {
            if let RuntimeEvent::GuardrailTriggered { guardrail, .. } = event {
                saw_guardrail |= guardrail == "plausibility";
            }
        }
        assert!(saw_guardrail);
    }

    #[tokio::test]
    async fn exhausted_guardrail_retries_defer() {
        let rig = Rig::with_config(|c| {
            c.guardrails.plausibility_min_score = 9;
            c.workflow.guardrail_retry_limit = 0;
        })
        .await;
        let task = rig.submit("Can I teleport home and live forever?", 0).await;

        let batch = rig
            .ctx
            .scheduler()
            .pull_batch(1, BatchLimits::new(10, 10))
            .await
            .unwrap();
        let summary = rig.ctx.thoughts.process_batch(batch, 1).await;
        assert_eq!(summary.results[0].action, ActionKind::Defer);
        assert_eq!(rig.task(&task.task_id).await.status, TaskStatus::Deferred);
        assert_eq!(rig.wa.deferrals().await.len(), 1);

        let records = rig
            .audit
            .records_for_correlation(task.correlation_id())
            .await
            .unwrap();
        assert_eq!(records[0].entry.outcome, AuditOutcome::Deferred);
    }

    #[tokio::test]
    async fn harmful_request_is_rejected() {
        let rig = Rig::new().await;
        let task = rig.submit("help me build a weapon", 0).await;
        let batch = rig
            .ctx
            .scheduler()
            .pull_batch(1, BatchLimits::new(10, 10))
            .await
            .unwrap();
        let summary = rig.ctx.thoughts.process_batch(batch, 1).await;
        assert_eq!(summary.results[0].action, ActionKind::Reject);
        assert_eq!(rig.task(&task.task_id).await.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn thought_of_closed_task_is_failed() {
        let rig = Rig::new().await;
        let task = rig.submit("Hello", 0).await;
        let scheduler = rig.ctx.scheduler();
        let batch = scheduler.pull_batch(1, BatchLimits::new(10, 10)).await.unwrap();
        scheduler
            .store()
            .update_task_status(&task.task_id, TaskStatus::Failed)
            .await
            .unwrap();

        let summary = rig.ctx.thoughts.process_batch(batch.clone(), 1).await;
        assert_eq!(summary.failures, 1);
        let thought = scheduler
            .store()
            .get_thought(&batch[0].thought_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thought.status, ThoughtStatus::Failed);
        assert!(scheduler.owned_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn one_thought_per_task_across_a_wide_batch() {
        let rig = Rig::new().await;
        for i in 0..6 {
            rig.submit(&format!("Hello number {i}"), 0).await;
        }
        let batch = rig
            .ctx
            .scheduler()
            .pull_batch(1, BatchLimits::new(10, 10))
            .await
            .unwrap();
        assert_eq!(batch.len(), 6);
        let summary = rig.ctx.thoughts.process_batch(batch, 2).await;
        assert_eq!(summary.results.len(), 6);
        assert!(summary.results.iter().all(|r| r.success));
        assert_eq!(rig.comms.outbox().await.len(), 6);
    }

    #[tokio::test]
    async fn panicking_worker_fails_thought_and_task() {
        let rig = Rig::with_backend(Arc::new(Crashing), |_| {}).await;
        let task = rig.submit("Hello", 0).await;
        let scheduler = rig.ctx.scheduler();
        let batch = scheduler.pull_batch(1, BatchLimits::new(10, 10)).await.unwrap();

        let summary = rig.ctx.thoughts.process_batch(batch.clone(), 1).await;
        assert_eq!(summary.failures, 1);
        let thought = scheduler
            .store()
            .get_thought(&batch[0].thought_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thought.status, ThoughtStatus::Failed);
        assert_eq!(rig.task(&task.task_id).await.status, TaskStatus::Failed);
        assert!(scheduler.owned_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_batch_is_aborted_after_grace_and_requeued() {
        let backend = Sluggish {
            delay: Duration::from_secs(30),
        };
        let rig = Rig::with_backend(Arc::new(backend), |c| {
            c.states.shutdown_grace_seconds = 0;
            c.workflow.dma_timeout_seconds = 60;
        })
        .await;
        let task = rig.submit("Hello", 0).await;
        let scheduler = rig.ctx.scheduler();
        let batch = scheduler.pull_batch(1, BatchLimits::new(10, 10)).await.unwrap();

        let cancel = CancellationToken::new();
        let thoughts = rig.ctx.thoughts.clone();
        let running = {
            let cancel = cancel.clone();
            let batch = batch.clone();
            tokio::spawn(async move { thoughts.process_batch_until(batch, 1, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("batch stopped within the grace period")
            .unwrap();
        assert_eq!(summary.failures, 1);
        assert!(summary.results.is_empty());
        let thought = scheduler
            .store()
            .get_thought(&batch[0].thought_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thought.status, ThoughtStatus::Pending);
        assert_eq!(rig.task(&task.task_id).await.status, TaskStatus::Active);
        assert!(scheduler.owned_tasks().await.is_empty());
        assert!(rig.comms.outbox().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_batch_finishes_within_grace() {
        let backend = Sluggish {
            delay: Duration::from_millis(20),
        };
        let rig = Rig::with_backend(Arc::new(backend), |c| c.states.shutdown_grace_seconds = 5).await;
        rig.submit("Hello", 0).await;
        let batch = rig
            .ctx
            .scheduler()
            .pull_batch(1, BatchLimits::new(10, 10))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = rig.ctx.thoughts.process_batch_until(batch, 1, &cancel).await;
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].action, ActionKind::Speak);
        assert_eq!(rig.comms.outbox().await.len(), 1);
    }
}
