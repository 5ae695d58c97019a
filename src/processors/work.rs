use super::{
    AgentState, ProcessingResult, ProcessorContext, ProcessorFuture, ProcessorInterface,
    Transition,
};
use crate::error::Result;
use crate::observability::{MetricsSnapshot, ProcessorMetrics};
use std::sync::atomic::{AtomicU32, Ordering};

/// Normal operation: one batch per round. Enough idle rounds in a row send
/// the agent to DREAM when configured.
pub struct WorkProcessor {
    ctx: ProcessorContext,
    metrics: ProcessorMetrics,
    idle_rounds: AtomicU32,
}

impl WorkProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            metrics: ProcessorMetrics::new(),
            idle_rounds: AtomicU32::new(0),
        }
    }

    pub fn idle_rounds(&self) -> u32 {
        self.idle_rounds.load(Ordering::Relaxed)
    }

    async fn round(&self, round: u64) -> Result<ProcessingResult> {
        let result = self
            .ctx
            .run_round(AgentState::Work, round, self.ctx.limits(), &self.metrics)
            .await?;
        let idle = result.processed == 0 && !self.ctx.scheduler().has_pending_work(None).await?;
        if idle {
            self.idle_rounds.fetch_add(1, Ordering::Relaxed);
        } else {
            self.idle_rounds.store(0, Ordering::Relaxed);
        }
        Ok(result)
    }
}

impl ProcessorInterface for WorkProcessor {
    fn supported_states(&self) -> &'static [AgentState] {
        &[AgentState::Work]
    }

    fn can_process(&self) -> ProcessorFuture<'_, bool> {
        Box::pin(self.ctx.preconditions_met())
    }

    fn initialize(&self) -> ProcessorFuture<'_, Result<()>> {
        Box::pin(async move {
            self.idle_rounds.store(0, Ordering::Relaxed);
            Ok(())
        })
    }

    fn process(&self, round: u64) -> ProcessorFuture<'_, Result<ProcessingResult>> {
        Box::pin(self.round(round))
    }

    fn should_transition(&self) -> ProcessorFuture<'_, Option<Transition>> {
        Box::pin(async move {
            let threshold = self.ctx.config.load().states.idle_rounds_before_dream;
            let idle = self.idle_rounds();
            (threshold > 0 && idle >= threshold).then(|| {
                Transition::new(AgentState::Dream, format!("idle for {idle} rounds"))
            })
        })
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Work with a relaxed batch for a fixed number of rounds.
pub struct PlayProcessor {
    ctx: ProcessorContext,
    metrics: ProcessorMetrics,
    rounds: AtomicU32,
}

impl PlayProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            metrics: ProcessorMetrics::new(),
            rounds: AtomicU32::new(0),
        }
    }
}

impl ProcessorInterface for PlayProcessor {
    fn supported_states(&self) -> &'static [AgentState] {
        &[AgentState::Play]
    }

    fn can_process(&self) -> ProcessorFuture<'_, bool> {
        Box::pin(self.ctx.preconditions_met())
    }

    fn initialize(&self) -> ProcessorFuture<'_, Result<()>> {
        Box::pin(async move {
            self.rounds.store(0, Ordering::Relaxed);
            Ok(())
        })
    }

    fn process(&self, round: u64) -> ProcessorFuture<'_, Result<ProcessingResult>> {
        Box::pin(async move {
            let mut limits = self.ctx.limits();
            limits.max_tasks = limits.max_tasks.saturating_mul(2);
            limits.max_thoughts = limits.max_thoughts.saturating_mul(2);
            let result = self
                .ctx
                .run_round(AgentState::Play, round, limits, &self.metrics)
                .await;
            self.rounds.fetch_add(1, Ordering::Relaxed);
            result
        })
    }

    fn should_transition(&self) -> ProcessorFuture<'_, Option<Transition>> {
        Box::pin(async move {
            let limit = self.ctx.config.load().states.play_rounds;
            (self.rounds.load(Ordering::Relaxed) >= limit)
                .then(|| Transition::new(AgentState::Work, "play session complete"))
        })
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
