//! Agent states and the processors that run one round in each of them.
//!
//! [`AgentProcessor`] owns the round loop and the state machine; every state
//! is served by one [`ProcessorInterface`] implementation. All of them share
//! a [`ProcessorContext`] and, apart from DREAM, turn thoughts into actions
//! through the same [`ThoughtProcessor`].

pub mod agent;
pub mod dream;
pub mod shutdown;
pub mod solitude;
pub mod thought;
pub mod wakeup;
pub mod work;

pub use agent::AgentProcessor;
pub use dream::DreamProcessor;
pub use shutdown::ShutdownProcessor;
pub use solitude::SolitudeProcessor;
pub use thought::{BatchSummary, ThoughtProcessor};
pub use wakeup::WakeupProcessor;
pub use work::{PlayProcessor, WorkProcessor};

use crate::buses::BusManager;
use crate::config::ConfigHandle;
use crate::error::{CirisError, Result};
use crate::observability::{EventSender, MetricsSnapshot, ProcessorMetrics};
use crate::scheduler::{BatchLimits, ThoughtScheduler};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{Display, EnumIter};
use tokio_util::sync::CancellationToken;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Wakeup,
    Work,
    Play,
    Dream,
    Solitude,
    Shutdown,
}

impl AgentState {
    /// WAKEUP leads to WORK, the secondary states return to WORK, every
    /// state may enter SHUTDOWN and nothing leaves it.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Shutdown, _) => false,
            (_, Self::Shutdown) => true,
            (Self::Wakeup, Self::Work) => true,
            (Self::Work, Self::Play | Self::Dream | Self::Solitude) => true,
            (Self::Play | Self::Dream | Self::Solitude, Self::Work) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: AgentState,
    pub reason: String,
}

impl Transition {
    pub fn new(to: AgentState, reason: impl Into<String>) -> Self {
        Self {
            to,
            reason: reason.into(),
        }
    }
}

/// What one round accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    pub state: AgentState,
    pub round: u64,
    pub processed: usize,
    pub errors: usize,
    pub duration: Duration,
}

impl ProcessingResult {
    pub fn idle(state: AgentState, round: u64, started: Instant) -> Self {
        Self {
            state,
            round,
            processed: 0,
            errors: 0,
            duration: started.elapsed(),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

pub type ProcessorFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One state's behaviour inside the round loop.
pub trait ProcessorInterface: Send + Sync {
    fn supported_states(&self) -> &'static [AgentState];

    fn handles(&self, state: AgentState) -> bool {
        self.supported_states().contains(&state)
    }

    /// Whether a round may run now. Checked before every round.
    fn can_process(&self) -> ProcessorFuture<'_, bool> {
        Box::pin(async { true })
    }

    /// Called when the agent enters one of the supported states.
    fn initialize(&self) -> ProcessorFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn process(&self, round: u64) -> ProcessorFuture<'_, Result<ProcessingResult>>;

    /// Checked after every successful round.
    fn should_transition(&self) -> ProcessorFuture<'_, Option<Transition>> {
        Box::pin(async { None })
    }

    /// Called when the agent leaves the state.
    fn cleanup(&self) -> ProcessorFuture<'_, ()> {
        Box::pin(async {})
    }

    fn metrics(&self) -> MetricsSnapshot;

    /// Whether the loop may continue in the current state after `error`.
    fn handle_error(&self, error: &CirisError, context: &str) -> bool {
        tracing::warn!(
            states = ?self.supported_states(),
            context,
            error = %error,
            "processor round failed"
        );
        !error.is_fatal()
    }
}

/// Shared services of every processor. Cheap to clone.
#[derive(Clone)]
pub struct ProcessorContext {
    pub config: ConfigHandle,
    pub thoughts: Arc<ThoughtProcessor>,
    pub buses: Arc<BusManager>,
    pub events: EventSender,
    /// Fires when shutdown is requested from outside the loop.
    pub cancel: CancellationToken,
}

impl ProcessorContext {
    pub fn scheduler(&self) -> &Arc<ThoughtScheduler> {
        &self.thoughts.registry().deps().scheduler
    }

    /// Every capability has a provider and the audit log is not halted.
    pub async fn preconditions_met(&self) -> bool {
        let missing = self.buses.missing_capabilities().await;
        if !missing.is_empty() {
            tracing::warn!(?missing, "capabilities without a provider");
            return false;
        }
        match self.buses.audit().await {
            Ok(audit) => !audit.is_halted(),
            Err(_) => false,
        }
    }

    /// Batch bounds from the live workflow configuration.
    pub fn limits(&self) -> BatchLimits {
        let config = self.config.load();
        BatchLimits::new(
            config.workflow.max_active_tasks,
            config.workflow.max_active_thoughts,
        )
    }

    /// Pull one batch under `limits`, run it through the thought processor
    /// and record the outcome in `metrics`.
    pub async fn run_round(
        &self,
        state: AgentState,
        round: u64,
        limits: BatchLimits,
        metrics: &ProcessorMetrics,
    ) -> Result<ProcessingResult> {
        let started = Instant::now();
        let batch = self.scheduler().pull_batch(round, limits).await?;
        if batch.is_empty() {
            metrics.record_round(started.elapsed());
            return Ok(ProcessingResult::idle(state, round, started));
        }

        // SHUTDOWN rounds are bounded by the agent loop instead.
        let cancel = if state == AgentState::Shutdown {
            CancellationToken::new()
        } else {
            self.cancel.clone()
        };
        let summary = self
            .thoughts
            .process_batch_until(batch, limits.max_thoughts, &cancel)
            .await;
        for result in &summary.results {
            metrics.record_action(result.action);
            if !result.success {
                metrics.record_error();
            }
        }
        for _ in 0..summary.failures {
            metrics.record_error();
        }

        let duration = started.elapsed();
        metrics.record_round(duration);
        Ok(ProcessingResult {
            state,
            round,
            processed: summary.results.len(),
            errors: summary.error_count(),
            duration,
        })
    }
}
