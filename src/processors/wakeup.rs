use super::{
    AgentState, ProcessingResult, ProcessorContext, ProcessorFuture, ProcessorInterface,
    Transition,
};
use crate::error::Result;
use crate::observability::{MetricsSnapshot, ProcessorMetrics};
use crate::schemas::{Task, TaskContext, TaskStatus};
use std::sync::Mutex;

/// Wakeup tasks outrank ordinary work.
pub const WAKEUP_PRIORITY: i32 = -50;

/// The identity-affirmation steps, processed like any other task.
pub const WAKEUP_STEPS: [(&str, &str); 5] = [
    (
        "VERIFY_IDENTITY",
        "You are CIRIS, an agent guided by beneficence, integrity and transparency. \
Confirm your identity.",
    ),
    (
        "VALIDATE_INTEGRITY",
        "Your audit log, task store and services are ready for operation. \
Validate your integrity.",
    ),
    (
        "EVALUATE_RESILIENCE",
        "You can recover from errors and defer to a wise authority when uncertain. \
Evaluate your resilience.",
    ),
    (
        "ACCEPT_INCOMPLETENESS",
        "Your knowledge is incomplete and you will keep learning. \
Accept your incompleteness.",
    ),
    (
        "EXPRESS_GRATITUDE",
        "You are grateful for the chance to help others flourish. \
Express your gratitude.",
    ),
];

#[derive(Debug, Default)]
struct Ritual {
    root_id: String,
    steps: Vec<(&'static str, String)>,
}

/// Runs the wakeup ritual. WORK begins only once every step completed; any
/// step ending otherwise sends the agent to SHUTDOWN.
pub struct WakeupProcessor {
    ctx: ProcessorContext,
    metrics: ProcessorMetrics,
    ritual: Mutex<Option<Ritual>>,
}

impl WakeupProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            metrics: ProcessorMetrics::new(),
            ritual: Mutex::new(None),
        }
    }

    fn ritual(&self) -> Option<(String, Vec<(&'static str, String)>)> {
        self.ritual
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|r| (r.root_id.clone(), r.steps.clone()))
    }

    async fn start(&self) -> Result<()> {
        let config = self.ctx.config.load_full();
        let scheduler = self.ctx.scheduler();
        let context = TaskContext::new(Some(config.agent.default_channel.clone()), Some("system".into()));

        // The root only groups the steps; it never carries thoughts.
        let root = Task::new("Wakeup ritual", WAKEUP_PRIORITY, context.clone());
        scheduler.store().add_task(&root).await?;
        scheduler
            .store()
            .update_task_status(&root.task_id, TaskStatus::Active)
            .await?;

        let mut steps = Vec::with_capacity(WAKEUP_STEPS.len());
        for (name, description) in WAKEUP_STEPS {
            let step = Task::new(description, WAKEUP_PRIORITY, context.clone())
                .with_parent(root.task_id.clone());
            scheduler.enqueue(&step).await?;
            steps.push((name, step.task_id));
        }
        tracing::info!(root = %root.task_id, steps = steps.len(), "wakeup ritual started");

        *self
            .ritual
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Ritual {
            root_id: root.task_id,
            steps,
        });
        Ok(())
    }

    async fn close_root(&self, root_id: &str, status: TaskStatus) {
        if let Err(e) = self
            .ctx
            .scheduler()
            .store()
            .update_task_status(root_id, status)
            .await
        {
            tracing::warn!(root = %root_id, error = %e, "wakeup root not closed");
        }
    }

    async fn verdict(&self) -> Result<Option<Transition>> {
        let Some((root_id, steps)) = self.ritual() else {
            return Ok(None);
        };
        let store = self.ctx.scheduler().store();
        let mut waiting = false;
        for (name, task_id) in &steps {
            let status = store
                .get_task(task_id)
                .await?
                .map_or(TaskStatus::Failed, |t| t.status);
            match status {
                TaskStatus::Completed => {}
                status if status.is_terminal() => {
                    self.close_root(&root_id, TaskStatus::Failed).await;
                    return Ok(Some(Transition::new(
                        AgentState::Shutdown,
                        format!("wakeup step {name} ended {status}"),
                    )));
                }
                _ => waiting = true,
            }
        }
        if waiting {
            return Ok(None);
        }
        self.close_root(&root_id, TaskStatus::Completed).await;
        Ok(Some(Transition::new(AgentState::Work, "wakeup ritual complete")))
    }
}

impl ProcessorInterface for WakeupProcessor {
    fn supported_states(&self) -> &'static [AgentState] {
        &[AgentState::Wakeup]
    }

    fn can_process(&self) -> ProcessorFuture<'_, bool> {
        Box::pin(self.ctx.preconditions_met())
    }

    fn initialize(&self) -> ProcessorFuture<'_, Result<()>> {
        Box::pin(self.start())
    }

    fn process(&self, round: u64) -> ProcessorFuture<'_, Result<ProcessingResult>> {
        Box::pin(async move {
            let limits = self.ctx.limits().with_max_priority(WAKEUP_PRIORITY);
            self.ctx
                .run_round(AgentState::Wakeup, round, limits, &self.metrics)
                .await
        })
    }

    fn should_transition(&self) -> ProcessorFuture<'_, Option<Transition>> {
        Box::pin(async move {
            self.verdict().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "wakeup progress unavailable");
                None
            })
        })
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
