use super::actions::ActionSelectionResult;
use super::task::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ThoughtType {
    Seed,
    Standard,
    Followup,
    Ponder,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ThoughtStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ThoughtStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `PROCESSING → PENDING` is the cancelled-round release path.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next == Self::Processing,
            Self::Processing => matches!(next, Self::Pending | Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    pub thought_id: String,
    pub source_task_id: String,
    pub thought_type: ThoughtType,
    pub status: ThoughtStatus,
    pub content: String,
    pub round_number: u64,
    /// Recursion counter along a SEED → FOLLOWUP/PONDER chain.
    pub depth: u32,
    pub parent_thought_id: Option<String>,
    #[serde(default)]
    pub ponder_notes: Vec<String>,
    pub final_action: Option<ActionSelectionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thought {
    /// The single SEED thought that starts processing of `task`.
    pub fn seed(task: &Task) -> Self {
        let now = Utc::now();
        Self {
            thought_id: Uuid::new_v4().to_string(),
            source_task_id: task.task_id.clone(),
            thought_type: ThoughtType::Seed,
            status: ThoughtStatus::Pending,
            content: task.description.clone(),
            round_number: 0,
            depth: 0,
            parent_thought_id: None,
            ponder_notes: Vec::new(),
            final_action: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A follow-up one level deeper than `self`, under the same task.
    pub fn child(&self, thought_type: ThoughtType, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thought_id: Uuid::new_v4().to_string(),
            source_task_id: self.source_task_id.clone(),
            thought_type,
            status: ThoughtStatus::Pending,
            content: content.into(),
            round_number: self.round_number,
            depth: self.depth.saturating_add(1),
            parent_thought_id: Some(self.thought_id.clone()),
            ponder_notes: Vec::new(),
            final_action: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.ponder_notes = notes;
        self
    }

    /// Whether one more PONDER/FOLLOWUP level would exceed `max_depth`.
    pub fn at_depth_limit(&self, max_depth: u32) -> bool {
        self.depth >= max_depth
    }
}
