use crate::schemas::ActionKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters kept per processor.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    rounds: AtomicU64,
    thoughts_processed: AtomicU64,
    errors: AtomicU64,
    last_round_ms: AtomicU64,
    actions: Mutex<BTreeMap<ActionKind, u64>>,
}

/// Point-in-time copy of [`ProcessorMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub rounds: u64,
    pub thoughts_processed: u64,
    pub errors: u64,
    pub last_round_ms: u64,
    pub actions: BTreeMap<ActionKind, u64>,
}

impl ProcessorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round(&self, duration: Duration) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.last_round_ms.store(ms, Ordering::Relaxed);
    }

    pub fn record_action(&self, action: ActionKind) {
        self.thoughts_processed.fetch_add(1, Ordering::Relaxed);
        let mut actions = self
            .actions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *actions.entry(action).or_default() += 1;
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rounds: self.rounds.load(Ordering::Relaxed),
            thoughts_processed: self.thoughts_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_round_ms: self.last_round_ms.load(Ordering::Relaxed),
            actions: self
                .actions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }
}
