use super::{
    AgentState, ProcessingResult, ProcessorContext, ProcessorFuture, ProcessorInterface,
    Transition,
};
use crate::buses::MemoryEntry;
use crate::error::Result;
use crate::observability::{MetricsSnapshot, ProcessorMetrics};
use crate::schemas::{MemoryScope, TaskStatus};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

/// Memory key of the latest consolidation note.
pub const DREAM_NOTE_KEY: &str = "dream/last";

/// Maintenance rounds: verify the audit chain and leave a consolidation
/// note in memory. No thoughts are processed.
pub struct DreamProcessor {
    ctx: ProcessorContext,
    metrics: ProcessorMetrics,
    rounds: AtomicU32,
    consolidated: AtomicBool,
}

impl DreamProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            metrics: ProcessorMetrics::new(),
            rounds: AtomicU32::new(0),
            consolidated: AtomicBool::new(false),
        }
    }

    /// Chain verification first: a broken chain ends the dream with a fatal
    /// error before anything else is written.
    async fn consolidate(&self) -> Result<()> {
        let audit = self.ctx.buses.audit().await?;
        let report = audit.verify_chain().await?;

        let store = self.ctx.scheduler().store();
        let note = json!({
            "at": Utc::now(),
            "audit_records": report.records,
            "completed": store.count_tasks(Some(TaskStatus::Completed)).await?,
            "failed": store.count_tasks(Some(TaskStatus::Failed)).await?,
            "deferred": store.count_tasks(Some(TaskStatus::Deferred)).await?,
        });
        if let Err(e) = self
            .ctx
            .buses
            .memorize(MemoryScope::Local, MemoryEntry::new(DREAM_NOTE_KEY, note))
            .await
        {
            tracing::warn!(error = %e, "consolidation note not stored");
        }
        tracing::info!(records = report.records, "dream consolidation finished");
        Ok(())
    }
}

impl ProcessorInterface for DreamProcessor {
    fn supported_states(&self) -> &'static [AgentState] {
        &[AgentState::Dream]
    }

    fn can_process(&self) -> ProcessorFuture<'_, bool> {
        Box::pin(self.ctx.preconditions_met())
    }

    fn initialize(&self) -> ProcessorFuture<'_, Result<()>> {
        Box::pin(async move {
            self.rounds.store(0, Ordering::Relaxed);
            self.consolidated.store(false, Ordering::Relaxed);
            Ok(())
        })
    }

    fn process(&self, round: u64) -> ProcessorFuture<'_, Result<ProcessingResult>> {
        Box::pin(async move {
            let started = Instant::now();
            if !self.consolidated.swap(true, Ordering::Relaxed)
                && let Err(e) = self.consolidate().await
            {
                self.metrics.record_error();
                return Err(e);
            }
            self.rounds.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_round(started.elapsed());
            Ok(ProcessingResult::idle(AgentState::Dream, round, started))
        })
    }

    fn should_transition(&self) -> ProcessorFuture<'_, Option<Transition>> {
        Box::pin(async move {
            match self.ctx.scheduler().has_pending_work(None).await {
                Ok(true) => return Some(Transition::new(AgentState::Work, "tasks are waiting")),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "pending work unknown"),
            }
            let limit = self.ctx.config.load().states.dream_rounds;
            (self.rounds.load(Ordering::Relaxed) >= limit)
                .then(|| Transition::new(AgentState::Work, "dream complete"))
        })
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEntry, AuditOutcome, Direction};
    use crate::buses::MemoryService;
    use crate::processors::testkit::Rig;

    #[tokio::test]
    async fn dream_verifies_and_leaves_a_note() {
        let rig = Rig::with_config(|c| c.states.dream_rounds = 2).await;
        rig.audit
            .record(AuditEntry::new(Direction::Internal, "ciris", "BOOT", AuditOutcome::Ok))
            .await
            .unwrap();
        let dream = DreamProcessor::new(rig.ctx.clone());
        dream.initialize().await.unwrap();

        dream.process(1).await.unwrap();
        assert!(dream.should_transition().await.is_none());
        let note = rig
            .memory
            .fetch(MemoryScope::Local, DREAM_NOTE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.value["audit_records"], 1);

        dream.process(2).await.unwrap();
        assert_eq!(
            dream.should_transition().await.unwrap().reason,
            "dream complete"
        );
    }

    #[tokio::test]
    async fn waiting_task_ends_the_dream() {
        let rig = Rig::with_config(|c| c.states.dream_rounds = 10).await;
        let dream = DreamProcessor::new(rig.ctx.clone());
        dream.initialize().await.unwrap();
        dream.process(1).await.unwrap();
        rig.submit("Hello", 0).await;
        assert_eq!(
            dream.should_transition().await.unwrap().reason,
            "tasks are waiting"
        );
    }

    #[tokio::test]
    async fn broken_chain_is_fatal() {
        let rig = Rig::new().await;
        rig.audit
            .record(AuditEntry::new(Direction::Internal, "ciris", "BOOT", AuditOutcome::Ok))
            .await
            .unwrap();
        sqlx::query("UPDATE audit_log SET action = 'TAMPERED'")
            .execute(rig.audit.pool())
            .await
            .unwrap();

        let dream = DreamProcessor::new(rig.ctx.clone());
        dream.initialize().await.unwrap();
        let err = dream.process(1).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!dream.handle_error(&err, "dream"));
    }
}
