use super::events::{EventReceiver, RuntimeEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Log-based observer: mirrors runtime events into `tracing`.
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }

    pub fn record_event(&self, event: &RuntimeEvent) {
        match event {
            RuntimeEvent::RoundStarted { state, round } => {
                info!(state = %state, round, "round.start");
            }
            RuntimeEvent::RoundCompleted {
                state,
                round,
                processed,
                errors,
                duration_ms,
            } => {
                info!(
                    state = %state,
                    round,
                    processed,
                    errors,
                    duration_ms,
                    "round.end"
                );
            }
            RuntimeEvent::ThoughtDispatched {
                thought_id,
                task_id,
                action,
                success,
            } => {
                info!(thought_id = %thought_id, task_id = %task_id, action = %action, success, "thought.dispatch");
            }
            RuntimeEvent::GuardrailTriggered {
                thought_id,
                guardrail,
                detail,
            } => {
                info!(thought_id = %thought_id, guardrail = %guardrail, detail = %detail, "guardrail.hit");
            }
            RuntimeEvent::TaskClosed { task_id, status } => {
                info!(task_id = %task_id, status = %status, "task.closed");
            }
            RuntimeEvent::StateTransition { from, to, reason } => {
                info!(from = %from, to = %to, reason = %reason, "state.transition");
            }
            RuntimeEvent::IntegrityFault { message } => {
                warn!(error = %message, "integrity.fault");
            }
            RuntimeEvent::ShutdownRequested { reason } => {
                info!(reason = %reason, "shutdown.requested");
            }
        }
    }

    /// Drain `rx` into the log until `cancel` fires or the bus closes.
    pub fn spawn(self, mut rx: EventReceiver, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => self.record_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "log observer lagged behind the event bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new()
    }
}
