use super::{
    AgentState, ProcessingResult, ProcessorContext, ProcessorFuture, ProcessorInterface,
    Transition,
};
use crate::error::Result;
use crate::observability::{MetricsSnapshot, ProcessorMetrics};
use crate::schemas::TaskStatus;

/// Only tasks at or above the configured priority run. Regular work waiting
/// brings the agent back to WORK.
pub struct SolitudeProcessor {
    ctx: ProcessorContext,
    metrics: ProcessorMetrics,
}

impl SolitudeProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            metrics: ProcessorMetrics::new(),
        }
    }

    fn threshold(&self) -> i32 {
        self.ctx.config.load().states.solitude_priority_threshold
    }

    async fn regular_work_waiting(&self) -> Result<bool> {
        let threshold = self.threshold();
        let store = self.ctx.scheduler().store();
        for status in [TaskStatus::Pending, TaskStatus::Active] {
            if store
                .list_tasks(Some(status), 256)
                .await?
                .iter()
                .any(|t| t.priority > threshold)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl ProcessorInterface for SolitudeProcessor {
    fn supported_states(&self) -> &'static [AgentState] {
        &[AgentState::Solitude]
    }

    fn can_process(&self) -> ProcessorFuture<'_, bool> {
        Box::pin(self.ctx.preconditions_met())
    }

    fn process(&self, round: u64) -> ProcessorFuture<'_, Result<ProcessingResult>> {
        Box::pin(async move {
            let limits = self.ctx.limits().with_max_priority(self.threshold());
            self.ctx
                .run_round(AgentState::Solitude, round, limits, &self.metrics)
                .await
        })
    }

    fn should_transition(&self) -> ProcessorFuture<'_, Option<Transition>> {
        Box::pin(async move {
            match self.regular_work_waiting().await {
                Ok(true) => Some(Transition::new(AgentState::Work, "regular tasks are waiting")),
                Ok(false) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "solitude queue check failed");
                    None
                }
            }
        })
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
