use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle of a task. Transitions only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Deferred,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Deferred)
    }

    /// `PENDING → ACTIVE → {COMPLETED, FAILED, DEFERRED}`; nothing leaves a
    /// terminal state.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next == Self::Active,
            Self::Active => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Deferred => false,
        }
    }
}

/// Where a task came from and who is waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub requester_id: Option<String>,
    /// Shared by every audit record written on behalf of this task.
    pub correlation_id: String,
}

impl TaskContext {
    pub fn new(channel_id: Option<String>, requester_id: Option<String>) -> Self {
        Self {
            channel_id,
            requester_id,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Lower value means higher priority.
    pub priority: i32,
    pub parent_task_id: Option<String>,
    pub context: TaskContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>, priority: i32, context: TaskContext) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority,
            parent_task_id: None,
            context,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.context.correlation_id
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
