//! Task/thought scheduler.
//!
//! Decides which thoughts enter a round. Thoughts of one task are strictly
//! serialised: a task is *owned* from the moment one of its thoughts is
//! pulled until the thought reaches a terminal action and the task is
//! released.

use crate::error::StoreError;
use crate::persistence::{StoreResult, TaskStore};
use crate::schemas::{Task, TaskStatus, Thought, ThoughtStatus};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Bounds for one `pull_batch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_tasks: usize,
    pub max_thoughts: usize,
    /// Only tasks with `priority <= max_priority` are activated or pulled.
    pub max_priority: Option<i32>,
}

impl BatchLimits {
    pub fn new(max_tasks: usize, max_thoughts: usize) -> Self {
        Self {
            max_tasks,
            max_thoughts,
            max_priority: None,
        }
    }

    pub fn with_max_priority(mut self, max_priority: i32) -> Self {
        self.max_priority = Some(max_priority);
        self
    }
}

pub struct ThoughtScheduler {
    store: Arc<dyn TaskStore>,
    owned: Mutex<HashSet<String>>,
}

impl ThoughtScheduler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            owned: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Persist a PENDING task and its SEED thought.
    pub async fn enqueue(&self, task: &Task) -> StoreResult<Thought> {
        if task.status != TaskStatus::Pending {
            return Err(StoreError::IllegalTransition {
                kind: "task",
                from: task.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        self.store.add_task(task).await?;
        let seed = Thought::seed(task);
        self.store.add_thought(&seed).await?;
        tracing::debug!(
            task_id = %task.task_id,
            thought_id = %seed.thought_id,
            priority = task.priority,
            "task enqueued"
        );
        Ok(seed)
    }

    /// Activate waiting tasks up to `max_tasks`, then claim at most one
    /// PENDING thought per idle task, marking it PROCESSING for `round`.
    pub async fn pull_batch(&self, round: u64, limits: BatchLimits) -> StoreResult<Vec<Thought>> {
        self.activate_pending(limits).await?;

        if limits.max_thoughts == 0 {
            return Ok(Vec::new());
        }

        let mut owned = self.owned.lock().await;
        let candidates = self
            .store
            .next_pending_thoughts(limits.max_priority, limits.max_thoughts + owned.len())
            .await?;

        let mut batch = Vec::with_capacity(limits.max_thoughts);
        for candidate in candidates {
            if batch.len() >= limits.max_thoughts {
                break;
            }
            if owned.contains(&candidate.source_task_id) {
                continue;
            }
            match self
                .store
                .mark_thought_processing(&candidate.thought_id, round)
                .await
            {
                Ok(thought) => {
                    owned.insert(thought.source_task_id.clone());
                    batch.push(thought);
                }
                // Claimed elsewhere between the read and the update.
                Err(StoreError::IllegalTransition { .. }) => {
                    tracing::debug!(thought_id = %candidate.thought_id, "thought already claimed");
                }
                Err(err) => return Err(err),
            }
        }

        if !batch.is_empty() {
            tracing::debug!(round, pulled = batch.len(), "batch pulled");
        }
        Ok(batch)
    }

    /// Only tasks this round may serve count against `max_tasks`, so work
    /// under a priority bound is never starved by ordinary tasks.
    async fn activate_pending(&self, limits: BatchLimits) -> StoreResult<usize> {
        let active = self.store.count_busy_tasks(limits.max_priority).await?;
        let room = limits.max_tasks.saturating_sub(active);
        if room == 0 {
            return Ok(0);
        }

        let waiting = self
            .store
            .list_tasks(Some(TaskStatus::Pending), room.saturating_mul(4))
            .await?;

        let mut activated = 0;
        for task in waiting
            .into_iter()
            .filter(|t| limits.max_priority.is_none_or(|max| t.priority <= max))
            .take(room)
        {
            self.store
                .update_task_status(&task.task_id, TaskStatus::Active)
                .await?;
            tracing::debug!(task_id = %task.task_id, "task activated");
            activated += 1;
        }
        Ok(activated)
    }

    /// Allow the next thought of `task_id` to be scheduled.
    pub async fn release(&self, task_id: &str) -> bool {
        self.owned.lock().await.remove(task_id)
    }

    /// Release `task_id` and put its thought back in the queue if it is still
    /// PROCESSING. Returns whether the thought was requeued.
    pub async fn requeue(&self, thought_id: &str, task_id: &str) -> StoreResult<bool> {
        self.settle(thought_id, task_id, ThoughtStatus::Pending).await
    }

    /// Release `task_id` and fail a still-PROCESSING thought together with
    /// its task, which would otherwise never be scheduled again.
    pub async fn abandon(&self, thought_id: &str, task_id: &str) -> StoreResult<bool> {
        if !self.settle(thought_id, task_id, ThoughtStatus::Failed).await? {
            return Ok(false);
        }
        let task = self.store.get_task(task_id).await?;
        if task.is_some_and(|t| t.status.can_transition_to(TaskStatus::Failed)) {
            self.store
                .update_task_status(task_id, TaskStatus::Failed)
                .await?;
        }
        Ok(true)
    }

    async fn settle(&self, thought_id: &str, task_id: &str, status: ThoughtStatus) -> StoreResult<bool> {
        self.release(task_id).await;
        let processing = self
            .store
            .get_thought(thought_id)
            .await?
            .is_some_and(|t| t.status == ThoughtStatus::Processing);
        if !processing {
            return Ok(false);
        }
        self.store
            .update_thought_status(thought_id, status, None)
            .await?;
        tracing::warn!(thought_id, task_id, status = %status, "unfinished thought settled");
        Ok(true)
    }

    pub async fn owned_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.owned.lock().await.iter().cloned().collect();
        tasks.sort();
        tasks
    }

    /// Whether any task still has work that could be scheduled.
    pub async fn has_pending_work(&self, max_priority: Option<i32>) -> StoreResult<bool> {
        let waiting = self
            .store
            .list_tasks(Some(TaskStatus::Pending), 64)
            .await?
            .iter()
            .any(|t| max_priority.is_none_or(|max| t.priority <= max));
        if waiting {
            return Ok(true);
        }
        Ok(!self
            .store
            .next_pending_thoughts(max_priority, 1)
            .await?
            .is_empty())
    }

    /// Put thoughts left PROCESSING by an interrupted run back in the queue.
    pub async fn recover(&self) -> StoreResult<usize> {
        self.owned.lock().await.clear();
        let reset = self.store.reset_processing_thoughts().await?;
        if reset > 0 {
            tracing::warn!(reset, "requeued thoughts from an interrupted run");
        }
        Ok(reset)
    }
}
