use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString};

/// Every action a thought can end in.
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
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ActionKind {
    Speak,
    Memorize,
    Recall,
    Forget,
    Observe,
    Tool,
    Ponder,
    Reject,
    Defer,
    TaskComplete,
}

impl ActionKind {
    /// DEFER and REJECT may only be escalated, never overridden into an
    /// action with external effect.
    pub fn is_conservative(self) -> bool {
        matches!(self, Self::Defer | Self::Reject)
    }

    /// Actions that close the owning task.
    pub fn closes_task(self) -> bool {
        matches!(self, Self::TaskComplete | Self::Defer | Self::Reject)
    }

    /// Actions that count as an acknowledgement of a shutdown request.
    pub fn acknowledges_shutdown(self) -> bool {
        matches!(self, Self::Speak | Self::TaskComplete)
    }
}

/// Namespaces of the memory graph.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryScope {
    #[default]
    Local,
    Identity,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakParams {
    /// Falls back to the task's originating channel.
    #[serde(default)]
    pub channel_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorizeParams {
    #[serde(default)]
    pub scope: MemoryScope,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallParams {
    #[serde(default)]
    pub scope: MemoryScope,
    /// Key prefix to match.
    pub query: String,
    #[serde(default = "default_recall_limit")]
    pub limit: usize,
}

fn default_recall_limit() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgetParams {
    #[serde(default)]
    pub scope: MemoryScope,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserveParams {
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default = "default_observe_limit")]
    pub limit: usize,
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

fn default_observe_limit() -> usize {
    20
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PonderParams {
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectParams {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferParams {
    pub reason: String,
    #[serde(default)]
    pub defer_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskCompleteParams {
    #[serde(default)]
    pub summary: Option<String>,
}

/// Action parameters, discriminated by the action kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionParams {
    Speak(SpeakParams),
    Memorize(MemorizeParams),
    Recall(RecallParams),
    Forget(ForgetParams),
    Observe(ObserveParams),
    Tool(ToolParams),
    Ponder(PonderParams),
    Reject(RejectParams),
    Defer(DeferParams),
    TaskComplete(TaskCompleteParams),
}

impl ActionParams {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Speak(_) => ActionKind::Speak,
            Self::Memorize(_) => ActionKind::Memorize,
            Self::Recall(_) => ActionKind::Recall,
            Self::Forget(_) => ActionKind::Forget,
            Self::Observe(_) => ActionKind::Observe,
            Self::Tool(_) => ActionKind::Tool,
            Self::Ponder(_) => ActionKind::Ponder,
            Self::Reject(_) => ActionKind::Reject,
            Self::Defer(_) => ActionKind::Defer,
            Self::TaskComplete(_) => ActionKind::TaskComplete,
        }
    }

    /// Structural checks that do not need any service.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let action = self.kind().to_string();
        let missing = |field: &str| ValidationError::MissingField {
            action: action.clone(),
            field: field.to_string(),
        };
        let invalid = |field: &str, message: &str| ValidationError::InvalidField {
            action: action.clone(),
            field: field.to_string(),
            message: message.to_string(),
        };

        match self {
            Self::Speak(p) if p.content.trim().is_empty() => Err(missing("content")),
            Self::Memorize(p) if p.key.trim().is_empty() => Err(missing("key")),
            Self::Memorize(p) if p.value.is_null() => Err(missing("value")),
            Self::Recall(p) if p.query.trim().is_empty() => Err(missing("query")),
            Self::Recall(p) if p.limit == 0 || p.limit > 100 => {
                Err(invalid("limit", "must be between 1 and 100"))
            }
            Self::Forget(p) if p.key.trim().is_empty() => Err(missing("key")),
            Self::Forget(p) if p.reason.trim().is_empty() => Err(missing("reason")),
            Self::Observe(p) if p.limit == 0 || p.limit > 100 => {
                Err(invalid("limit", "must be between 1 and 100"))
            }
            Self::Tool(p) if p.name.trim().is_empty() => Err(missing("name")),
            Self::Tool(p) if p.timeout_seconds == Some(0) => {
                Err(invalid("timeout_seconds", "must be positive"))
            }
            Self::Ponder(p) if p.questions.iter().all(|q| q.trim().is_empty()) => {
                Err(missing("questions"))
            }
            Self::Reject(p) if p.reason.trim().is_empty() => Err(missing("reason")),
            Self::Defer(p) if p.reason.trim().is_empty() => Err(missing("reason")),
            _ => Ok(()),
        }
    }
}

/// The one action chosen for a thought, with the reasoning behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSelectionResult {
    pub action: ActionParams,
    pub rationale: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl ActionSelectionResult {
    pub fn new(action: ActionParams, rationale: impl Into<String>) -> Self {
        Self {
            action,
            rationale: rationale.into(),
            confidence: default_confidence(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    pub fn defer(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ActionParams::Defer(DeferParams {
                reason: reason.clone(),
                defer_until: None,
            }),
            reason,
        )
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ActionParams::Reject(RejectParams {
                reason: reason.clone(),
            }),
            reason,
        )
    }

    pub fn ponder(questions: Vec<String>, rationale: impl Into<String>) -> Self {
        Self::new(ActionParams::Ponder(PonderParams { questions }), rationale)
    }

    pub fn speak(content: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self::new(
            ActionParams::Speak(SpeakParams {
                channel_id: None,
                content: content.into(),
            }),
            rationale,
        )
    }

    pub fn task_complete(summary: Option<String>, rationale: impl Into<String>) -> Self {
        Self::new(
            ActionParams::TaskComplete(TaskCompleteParams { summary }),
            rationale,
        )
    }
}
