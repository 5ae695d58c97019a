use super::{
    AgentState, DreamProcessor, PlayProcessor, ProcessingResult, ProcessorContext,
    ProcessorInterface, ShutdownProcessor, SolitudeProcessor, Transition, WakeupProcessor,
    WorkProcessor,
};
use crate::error::Result;
use crate::observability::{MetricsSnapshot, RuntimeEvent, emit};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Owns the round loop and the agent state machine.
pub struct AgentProcessor {
    ctx: ProcessorContext,
    processors: Vec<Arc<dyn ProcessorInterface>>,
    shutdown: Arc<ShutdownProcessor>,
    state: watch::Sender<AgentState>,
    requested: Mutex<Option<Transition>>,
    round: AtomicU64,
}

impl AgentProcessor {
    /// Starts in WAKEUP, or directly in WORK when the ritual is disabled.
    pub fn new(ctx: ProcessorContext) -> Self {
        let initial = if ctx.config.load().states.wakeup_enabled {
            AgentState::Wakeup
        } else {
            AgentState::Work
        };
        let shutdown = Arc::new(ShutdownProcessor::new(ctx.clone()));
        let processors: Vec<Arc<dyn ProcessorInterface>> = vec![
            Arc::new(WakeupProcessor::new(ctx.clone())),
            Arc::new(WorkProcessor::new(ctx.clone())),
            Arc::new(PlayProcessor::new(ctx.clone())),
            Arc::new(DreamProcessor::new(ctx.clone())),
            Arc::new(SolitudeProcessor::new(ctx.clone())),
            shutdown.clone(),
        ];
        let (state, _) = watch::channel(initial);
        Self {
            ctx,
            processors,
            shutdown,
            state,
            requested: Mutex::new(None),
            round: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn rounds(&self) -> u64 {
        self.round.load(Ordering::Relaxed)
    }

    /// Ask for a transition at the next round boundary. Illegal requests are
    /// dropped with a warning when applied.
    pub fn request_transition(&self, to: AgentState, reason: impl Into<String>) {
        *self
            .requested
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Transition::new(to, reason));
    }

    fn take_request(&self) -> Option<Transition> {
        self.requested
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    pub fn metrics(&self) -> BTreeMap<AgentState, MetricsSnapshot> {
        self.processors
            .iter()
            .flat_map(|p| {
                let snapshot = p.metrics();
                p.supported_states()
                    .iter()
                    .map(move |state| (*state, snapshot.clone()))
            })
            .collect()
    }

    fn processor_for(&self, state: AgentState) -> Result<Arc<dyn ProcessorInterface>> {
        self.processors
            .iter()
            .find(|p| p.handles(state))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no processor handles {state}").into())
    }

    fn round_delay(&self) -> Duration {
        let seconds = self.ctx.config.load().workflow.round_delay_seconds;
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
    }

    async fn audit_halted(&self) -> bool {
        match self.ctx.buses.audit().await {
            Ok(audit) => audit.is_halted(),
            Err(_) => true,
        }
    }

    /// Run rounds until SHUTDOWN completes.
    pub async fn run(&self) -> Result<()> {
        let mut state = self.state();
        if let Err(e) = self.processor_for(state)?.initialize().await {
            tracing::error!(state = %state, error = %e, "initial state failed to start");
            state = self
                .transition(state, Transition::new(AgentState::Shutdown, format!("startup failed: {e}")))
                .await;
        }
        tracing::info!(state = %state, "agent processor started");

        loop {
            if state != AgentState::Shutdown {
                if self.ctx.cancel.is_cancelled() {
                    let request = self
                        .take_request()
                        .filter(|r| r.to == AgentState::Shutdown)
                        .unwrap_or_else(|| Transition::new(AgentState::Shutdown, "shutdown requested"));
                    state = self.transition(state, request).await;
                } else if let Some(request) = self.take_request() {
                    state = self.transition(state, request).await;
                }
            }

            let processor = self.processor_for(state)?;
            let round = self.round.fetch_add(1, Ordering::Relaxed) + 1;
            emit(&self.ctx.events, RuntimeEvent::RoundStarted { state, round });

            let mut next = None;
            match self.process_round(state, processor.as_ref(), round).await {
                Ok(result) => emit(
                    &self.ctx.events,
                    RuntimeEvent::RoundCompleted {
                        state,
                        round,
                        processed: result.processed,
                        errors: result.errors,
                        duration_ms: result.duration_ms(),
                    },
                ),
                Err(e) => {
                    if e.is_fatal() {
                        emit(
                            &self.ctx.events,
                            RuntimeEvent::IntegrityFault {
                                message: e.to_string(),
                            },
                        );
                    }
                    if !processor.handle_error(&e, "round") {
                        next = Some(Transition::new(AgentState::Shutdown, format!("unrecoverable error: {e}")));
                    }
                }
            }

            if state == AgentState::Shutdown {
                if self.shutdown.is_finished() {
                    break;
                }
                tokio::time::sleep(self.round_delay().min(self.shutdown.remaining())).await;
                continue;
            }

            if next.is_none() && self.audit_halted().await {
                next = Some(Transition::new(AgentState::Shutdown, "audit integrity fault"));
            }
            if next.is_none() {
                next = processor.should_transition().await;
            }
            if let Some(transition) = next {
                state = self.transition(state, transition).await;
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(self.round_delay()) => {}
                () = self.ctx.cancel.cancelled() => {}
            }
        }

        self.shutdown.cleanup().await;
        tracing::info!(
            rounds = self.rounds(),
            acknowledged = self.shutdown.acknowledged(),
            "agent processor stopped"
        );
        Ok(())
    }

    /// SHUTDOWN rounds are cut off at the grace deadline; in-flight thoughts
    /// are abandoned and requeued on the next start.
    async fn process_round(
        &self,
        state: AgentState,
        processor: &dyn ProcessorInterface,
        round: u64,
    ) -> Result<ProcessingResult> {
        if state != AgentState::Shutdown {
            if !processor.can_process().await {
                tracing::warn!(state = %state, round, "round skipped; preconditions unmet");
                return Ok(ProcessingResult::idle(state, round, Instant::now()));
            }
            return processor.process(round).await;
        }
        let started = Instant::now();
        match tokio::time::timeout(self.shutdown.remaining(), processor.process(round)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(round, "shutdown grace period elapsed mid-round");
                Ok(ProcessingResult::idle(state, round, started))
            }
        }
    }

    async fn enter(&self, state: AgentState) -> Result<()> {
        self.processor_for(state)?.initialize().await
    }

    /// Apply `transition` if the state machine allows it. Returns the state
    /// the agent is in afterwards.
    async fn transition(&self, from: AgentState, transition: Transition) -> AgentState {
        let Transition { to, reason } = transition;
        if !from.can_transition_to(to) {
            tracing::warn!(from = %from, to = %to, reason = %reason, "illegal state transition ignored");
            return from;
        }

        if let Ok(current) = self.processor_for(from) {
            current.cleanup().await;
        }
        if to == AgentState::Shutdown {
            self.shutdown.set_reason(reason.clone());
        }

        let (to, reason) = match self.enter(to).await {
            Ok(()) => (to, reason),
            Err(e) if to != AgentState::Shutdown => {
                tracing::error!(state = %to, error = %e, "state failed to start");
                let reason = format!("entering {to} failed: {e}");
                self.shutdown.set_reason(reason.clone());
                if let Err(e) = self.enter(AgentState::Shutdown).await {
                    tracing::error!(error = %e, "shutdown failed to start");
                }
                (AgentState::Shutdown, reason)
            }
            Err(e) => {
                tracing::error!(error = %e, "shutdown failed to start");
                (to, reason)
            }
        };

        self.state.send_replace(to);
        tracing::info!(from = %from, to = %to, reason = %reason, "agent state changed");
        emit(
            &self.ctx.events,
            RuntimeEvent::StateTransition { from, to, reason },
        );
        to
    }
}
