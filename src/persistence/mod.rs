//! Durable queue and relationship table for tasks and thoughts.
//!
//! The store holds no business logic beyond the status transition laws; the
//! scheduler decides what runs, the handlers decide what happens next.

pub mod sqlite;

use crate::error::StoreError;
use crate::schemas::{ActionSelectionResult, Task, TaskStatus, Thought, ThoughtStatus};
use std::future::Future;
use std::pin::Pin;

pub use sqlite::SqliteTaskStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Async task/thought persistence contract.
pub trait TaskStore: Send + Sync {
    fn add_task<'a>(
        &'a self,
        task: &'a Task,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>>;

    fn get_task<'a>(
        &'a self,
        task_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<Task>>> + Send + 'a>>;

    /// Move a task forward. Illegal transitions fail without touching the row.
    fn update_task_status<'a>(
        &'a self,
        task_id: &'a str,
        status: TaskStatus,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Task>> + Send + 'a>>;

    /// Tasks ordered by priority, then creation time.
    fn list_tasks<'a>(
        &'a self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Vec<Task>>> + Send + 'a>>;

    fn count_tasks<'a>(
        &'a self,
        status: Option<TaskStatus>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<usize>> + Send + 'a>>;

    /// ACTIVE tasks that carry thoughts, limited to `priority <= max_priority`.
    /// Grouping tasks without thoughts hold no slot.
    fn count_busy_tasks<'a>(
        &'a self,
        max_priority: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<usize>> + Send + 'a>>;

    fn add_thought<'a>(
        &'a self,
        thought: &'a Thought,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>>;

    fn get_thought<'a>(
        &'a self,
        thought_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<Thought>>> + Send + 'a>>;

    /// `PENDING → PROCESSING`, stamping the round number.
    fn mark_thought_processing<'a>(
        &'a self,
        thought_id: &'a str,
        round_number: u64,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Thought>> + Send + 'a>>;

    /// Move a thought forward; `final_action` is recorded on terminal statuses.
    fn update_thought_status<'a>(
        &'a self,
        thought_id: &'a str,
        status: ThoughtStatus,
        final_action: Option<&'a ActionSelectionResult>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Thought>> + Send + 'a>>;

    fn thoughts_for_task<'a>(
        &'a self,
        task_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Vec<Thought>>> + Send + 'a>>;

    /// The oldest PENDING thought of each ACTIVE task that has nothing in
    /// PROCESSING, in scheduling order: task priority, task creation time,
    /// thought creation time. `max_priority` drops tasks ranked below it.
    fn next_pending_thoughts<'a>(
        &'a self,
        max_priority: Option<i32>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Vec<Thought>>> + Send + 'a>>;

    fn count_thoughts<'a>(
        &'a self,
        status: Option<ThoughtStatus>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<usize>> + Send + 'a>>;

    /// Return thoughts left PROCESSING by an interrupted run to PENDING.
    fn reset_processing_thoughts(
        &self,
    ) -> Pin<Box<dyn Future<Output = StoreResult<usize>> + Send + '_>>;
}
