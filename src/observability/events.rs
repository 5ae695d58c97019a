use crate::processors::AgentState;
use crate::schemas::{ActionKind, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the runtime for observers and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeEvent {
    RoundStarted {
        state: AgentState,
        round: u64,
    },
    RoundCompleted {
        state: AgentState,
        round: u64,
        processed: usize,
        errors: usize,
        duration_ms: u64,
    },
    ThoughtDispatched {
        thought_id: String,
        task_id: String,
        action: ActionKind,
        success: bool,
    },
    GuardrailTriggered {
        thought_id: String,
        guardrail: String,
        detail: String,
    },
    TaskClosed {
        task_id: String,
        status: TaskStatus,
    },
    StateTransition {
        from: AgentState,
        to: AgentState,
        reason: String,
    },
    IntegrityFault {
        message: String,
    },
    ShutdownRequested {
        reason: String,
    },
}

pub type EventSender = broadcast::Sender<RuntimeEvent>;
pub type EventReceiver = broadcast::Receiver<RuntimeEvent>;

/// Create a broadcast event bus with the given capacity.
pub fn event_bus(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity.max(1))
}

/// Publish without caring whether anyone listens.
pub fn emit(tx: &EventSender, event: RuntimeEvent) {
    // A send error only means there are no receivers right now.
    let _ = tx.send(event);
}
