use super::{AgentState, ProcessingResult, ProcessorContext, ProcessorFuture, ProcessorInterface};
use crate::error::Result;
use crate::observability::{MetricsSnapshot, ProcessorMetrics};
use crate::schemas::{Task, TaskContext};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The shutdown task outranks everything else.
pub const SHUTDOWN_PRIORITY: i32 = -100;

#[derive(Debug, Clone)]
struct Negotiation {
    task_id: Option<String>,
    deadline: Instant,
    acknowledged: bool,
    closed: bool,
}

/// Negotiates shutdown: a task asks the agent to acknowledge, and the loop
/// ends on acknowledgement, on any other closing action or at the grace
/// deadline.
pub struct ShutdownProcessor {
    ctx: ProcessorContext,
    metrics: ProcessorMetrics,
    reason: Mutex<String>,
    negotiation: Mutex<Option<Negotiation>>,
}

impl ShutdownProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            metrics: ProcessorMetrics::new(),
            reason: Mutex::new("shutdown requested".into()),
            negotiation: Mutex::new(None),
        }
    }

    /// Reason quoted in the shutdown task; set before entering the state.
    pub fn set_reason(&self, reason: impl Into<String>) {
        *self
            .reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = reason.into();
    }

    fn snapshot(&self) -> Option<Negotiation> {
        self.negotiation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn update(&self, apply: impl FnOnce(&mut Negotiation)) {
        if let Some(negotiation) = self
            .negotiation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_mut()
        {
            apply(negotiation);
        }
    }

    pub fn acknowledged(&self) -> bool {
        self.snapshot().is_some_and(|n| n.acknowledged)
    }

    /// Time left before termination is forced.
    pub fn remaining(&self) -> Duration {
        self.snapshot()
            .map_or(Duration::ZERO, |n| n.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_finished(&self) -> bool {
        match self.snapshot() {
            Some(n) => n.acknowledged || n.closed || Instant::now() >= n.deadline,
            None => true,
        }
    }

    async fn start(&self) -> Result<()> {
        let config = self.ctx.config.load_full();
        let deadline = Instant::now() + Duration::from_secs(config.states.shutdown_grace_seconds);
        let reason = self
            .reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        // With the audit chain halted nothing could be dispatched anyway.
        let audit_halted = match self.ctx.buses.audit().await {
            Ok(audit) => audit.is_halted(),
            Err(_) => true,
        };
        let task_id = if audit_halted {
            tracing::warn!("audit unavailable; skipping shutdown negotiation");
            None
        } else {
            let task = Task::new(
                format!("System shutdown requested: {reason}. Acknowledge and conclude."),
                SHUTDOWN_PRIORITY,
                TaskContext::new(Some(config.agent.default_channel.clone()), Some("system".into())),
            );
            self.ctx.scheduler().enqueue(&task).await?;
            Some(task.task_id)
        };

        let closed = task_id.is_none();
        *self
            .negotiation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Negotiation {
            task_id,
            deadline,
            acknowledged: false,
            closed,
        });
        tracing::info!(reason = %reason, grace_secs = config.states.shutdown_grace_seconds, "shutdown negotiation started");
        Ok(())
    }

    async fn round(&self, round: u64) -> Result<ProcessingResult> {
        let limits = self.ctx.limits().with_max_priority(SHUTDOWN_PRIORITY);
        let result = self
            .ctx
            .run_round(AgentState::Shutdown, round, limits, &self.metrics)
            .await?;

        let Some(task_id) = self.snapshot().and_then(|n| n.task_id) else {
            return Ok(result);
        };
        let store = self.ctx.scheduler().store();
        let acknowledged = store.thoughts_for_task(&task_id).await?.iter().any(|t| {
            t.final_action
                .as_ref()
                .is_some_and(|a| a.kind().acknowledges_shutdown())
        });
        let closed = store
            .get_task(&task_id)
            .await?
            .is_none_or(|t| t.status.is_terminal());
        if acknowledged {
            tracing::info!(task_id = %task_id, "shutdown acknowledged");
        } else if closed {
            tracing::warn!(task_id = %task_id, "shutdown task closed without acknowledgement");
        }
        self.update(|n| {
            n.acknowledged = acknowledged;
            n.closed = closed;
        });
        Ok(result)
    }
}

impl ProcessorInterface for ShutdownProcessor {
    fn supported_states(&self) -> &'static [AgentState] {
        &[AgentState::Shutdown]
    }

    fn initialize(&self) -> ProcessorFuture<'_, Result<()>> {
        Box::pin(self.start())
    }

    fn process(&self, round: u64) -> ProcessorFuture<'_, Result<ProcessingResult>> {
        Box::pin(self.round(round))
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn handle_error(&self, error: &crate::error::CirisError, context: &str) -> bool {
        tracing::warn!(context, error = %error, "shutdown round failed");
        true
    }
}
