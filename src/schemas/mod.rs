pub mod actions;
pub mod task;
pub mod thought;

pub use actions::{
    ActionKind, ActionParams, ActionSelectionResult, DeferParams, ForgetParams, MemorizeParams,
    MemoryScope, ObserveParams, PonderParams, RecallParams, RejectParams, SpeakParams,
    TaskCompleteParams, ToolParams,
};
pub use task::{Task, TaskContext, TaskStatus, timestamp};
pub use thought::{Thought, ThoughtStatus, ThoughtType};
