use super::{StoreResult, TaskStore};
use crate::error::StoreError;
use crate::schemas::{
    ActionSelectionResult, Task, TaskContext, TaskStatus, Thought, ThoughtStatus, ThoughtType,
    timestamp,
};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

const STORE_SCHEMA_META_TABLE: &str = "
CREATE TABLE IF NOT EXISTS store_schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";
const STORE_SCHEMA_VERSION_KEY: &str = "task_store_schema_version";
const STORE_SCHEMA_VERSION: u32 = 1;

const TASK_COLUMNS: &str = "task_id, description, status, priority, parent_task_id, channel_id,
     requester_id, correlation_id, created_at, updated_at";
const THOUGHT_COLUMNS: &str = "th.thought_id, th.source_task_id, th.thought_type, th.status,
     th.content, th.round_number, th.depth, th.parent_thought_id, th.ponder_notes,
     th.final_action, th.created_at, th.updated_at";

/// Open a pool against `url`. In-memory databases get a single connection so
/// every query sees the same database.
pub async fn connect(url: &str) -> StoreResult<SqlitePool> {
    let max_connections = if url.contains(":memory:") { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    Ok(pool)
}

async fn ensure_store_schema_version(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(STORE_SCHEMA_META_TABLE).execute(pool).await?;

    let stored_version: Option<(String,)> =
        sqlx::query_as("SELECT value FROM store_schema_meta WHERE key = $1")
            .bind(STORE_SCHEMA_VERSION_KEY)
            .fetch_optional(pool)
            .await?;

    if let Some((value,)) = stored_version {
        let parsed = value
            .parse::<u32>()
            .map_err(|_| StoreError::Corrupt(format!("invalid store schema version: {value}")))?;
        if parsed != STORE_SCHEMA_VERSION {
            return Err(StoreError::Corrupt(format!(
                "incompatible store schema version: stored={parsed}, expected={STORE_SCHEMA_VERSION}"
            )));
        }
        return Ok(());
    }

    sqlx::query("INSERT INTO store_schema_meta (key, value) VALUES ($1, $2)")
        .bind(STORE_SCHEMA_VERSION_KEY)
        .bind(STORE_SCHEMA_VERSION.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// SQLite-backed task/thought store using an sqlx async pool.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new store with an existing pool and run migrations.
    pub async fn new(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await?;

        ensure_store_schema_version(&pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                 task_id TEXT PRIMARY KEY,
                 description TEXT NOT NULL,
                 status TEXT NOT NULL,
                 priority INTEGER NOT NULL DEFAULT 0,
                 parent_task_id TEXT,
                 channel_id TEXT,
                 requester_id TEXT,
                 correlation_id TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_priority
                 ON tasks(status, priority, created_at)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS thoughts (
                 thought_id TEXT PRIMARY KEY,
                 source_task_id TEXT NOT NULL REFERENCES tasks(task_id),
                 thought_type TEXT NOT NULL,
                 status TEXT NOT NULL,
                 content TEXT NOT NULL,
                 round_number INTEGER NOT NULL DEFAULT 0,
                 depth INTEGER NOT NULL DEFAULT 0,
                 parent_thought_id TEXT,
                 ponder_notes TEXT NOT NULL DEFAULT '[]',
                 final_action TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_thoughts_status_created
                 ON thoughts(status, created_at)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_thoughts_task
                 ON thoughts(source_task_id, created_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Fresh private database; used by tests and dry runs.
    pub async fn in_memory() -> StoreResult<Self> {
        Self::new(connect("sqlite::memory:").await?).await
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{raw}': {e}")))
}

fn parse_enum<T: FromStr>(kind: &str, raw: &str) -> StoreResult<T> {
    T::from_str(raw).map_err(|_| StoreError::Corrupt(format!("unknown {kind}: {raw}")))
}

fn map_task_row(row: &SqliteRow) -> StoreResult<Task> {
    let status_raw: String = row.try_get("status")?;
    let priority: i64 = row.try_get("priority")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;

    Ok(Task {
        task_id: row.try_get("task_id")?,
        description: row.try_get("description")?,
        status: parse_enum("task status", &status_raw)?,
        priority: i32::try_from(priority)
            .map_err(|_| StoreError::Corrupt(format!("priority out of range: {priority}")))?,
        parent_task_id: row.try_get("parent_task_id")?,
        context: TaskContext {
            channel_id: row.try_get("channel_id")?,
            requester_id: row.try_get("requester_id")?,
            correlation_id: row.try_get("correlation_id")?,
        },
        created_at: parse_time(&created_raw)?,
        updated_at: parse_time(&updated_raw)?,
    })
}

fn map_thought_row(row: &SqliteRow) -> StoreResult<Thought> {
    let type_raw: String = row.try_get("thought_type")?;
    let status_raw: String = row.try_get("status")?;
    let round_number: i64 = row.try_get("round_number")?;
    let depth: i64 = row.try_get("depth")?;
    let notes_raw: String = row.try_get("ponder_notes")?;
    let final_raw: Option<String> = row.try_get("final_action")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;

    let final_action = final_raw
        .map(|raw| serde_json::from_str::<ActionSelectionResult>(&raw))
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("final_action: {e}")))?;

    Ok(Thought {
        thought_id: row.try_get("thought_id")?,
        source_task_id: row.try_get("source_task_id")?,
        thought_type: parse_enum::<ThoughtType>("thought type", &type_raw)?,
        status: parse_enum("thought status", &status_raw)?,
        content: row.try_get("content")?,
        round_number: u64::try_from(round_number)
            .map_err(|_| StoreError::Corrupt(format!("negative round number: {round_number}")))?,
        depth: u32::try_from(depth)
            .map_err(|_| StoreError::Corrupt(format!("depth out of range: {depth}")))?,
        parent_thought_id: row.try_get("parent_thought_id")?,
        ponder_notes: serde_json::from_str(&notes_raw)
            .map_err(|e| StoreError::Corrupt(format!("ponder_notes: {e}")))?,
        final_action,
        created_at: parse_time(&created_raw)?,
        updated_at: parse_time(&updated_raw)?,
    })
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("value out of range: {value}")))
}

impl TaskStore for SqliteTaskStore {
    fn add_task<'a>(
        &'a self,
        task: &'a Task,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO tasks (task_id, description, status, priority, parent_task_id,
                     channel_id, requester_id, correlation_id, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(&task.task_id)
            .bind(&task.description)
            .bind(task.status.to_string())
            .bind(i64::from(task.priority))
            .bind(&task.parent_task_id)
            .bind(&task.context.channel_id)
            .bind(&task.context.requester_id)
            .bind(&task.context.correlation_id)
            .bind(timestamp(task.created_at))
            .bind(timestamp(task.updated_at))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_task<'a>(
        &'a self,
        task_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<Task>>> + Send + 'a>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = $1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| map_task_row(&r)).transpose()
        })
    }

    fn update_task_status<'a>(
        &'a self,
        task_id: &'a str,
        status: TaskStatus,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Task>> + Send + 'a>> {
        Box::pin(async move {
            let current = self
                .get_task(task_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    kind: "task",
                    id: task_id.to_string(),
                })?;

            if !current.status.can_transition_to(status) {
                return Err(StoreError::IllegalTransition {
                    kind: "task",
                    from: current.status.to_string(),
                    to: status.to_string(),
                });
            }

            let now = Utc::now();
            // Guard on the observed status so a concurrent writer cannot be overwritten.
            let result = sqlx::query(
                "UPDATE tasks SET status = $1, updated_at = $2
                 WHERE task_id = $3 AND status = $4",
            )
            .bind(status.to_string())
            .bind(timestamp(now))
            .bind(task_id)
            .bind(current.status.to_string())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::IllegalTransition {
                    kind: "task",
                    from: current.status.to_string(),
                    to: status.to_string(),
                });
            }

            Ok(Task {
                status,
                updated_at: now,
                ..current
            })
        })
    }

    fn list_tasks<'a>(
        &'a self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Vec<Task>>> + Send + 'a>> {
        Box::pin(async move {
            let limit = to_i64(limit as u64)?;
            let rows = match status {
                Some(status) => {
                    sqlx::query(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1
                         ORDER BY priority ASC, created_at ASC, rowid ASC LIMIT $2"
                    ))
                    .bind(status.to_string())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks
                         ORDER BY priority ASC, created_at ASC, rowid ASC LIMIT $1"
                    ))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            rows.iter().map(map_task_row).collect()
        })
    }

    fn count_tasks<'a>(
        &'a self,
        status: Option<TaskStatus>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<usize>> + Send + 'a>> {
        Box::pin(async move {
            let (count,): (i64,) = match status {
                Some(status) => {
                    sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = $1")
                        .bind(status.to_string())
                        .fetch_one(&self.pool)
                        .await?
                }
                None => {
                    sqlx::query_as("SELECT COUNT(*) FROM tasks")
                        .fetch_one(&self.pool)
                        .await?
                }
            };
            usize::try_from(count)
                .map_err(|_| StoreError::Corrupt(format!("negative count: {count}")))
        })
    }

    fn count_busy_tasks<'a>(
        &'a self,
        max_priority: Option<i32>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<usize>> + Send + 'a>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM tasks t
                 WHERE t.status = $1 AND t.priority <= $2
                   AND EXISTS (SELECT 1 FROM thoughts th WHERE th.source_task_id = t.task_id)",
            )
            .bind(TaskStatus::Active.to_string())
            .bind(i64::from(max_priority.unwrap_or(i32::MAX)))
            .fetch_one(&self.pool)
            .await?;
            usize::try_from(count)
                .map_err(|_| StoreError::Corrupt(format!("negative count: {count}")))
        })
    }

    fn add_thought<'a>(
        &'a self,
        thought: &'a Thought,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let notes = serde_json::to_string(&thought.ponder_notes)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let final_action = thought
                .final_action
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;

            sqlx::query(
                "INSERT INTO thoughts (thought_id, source_task_id, thought_type, status, content,
                     round_number, depth, parent_thought_id, ponder_notes, final_action,
                     created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(&thought.thought_id)
            .bind(&thought.source_task_id)
            .bind(thought.thought_type.to_string())
            .bind(thought.status.to_string())
            .bind(&thought.content)
            .bind(to_i64(thought.round_number)?)
            .bind(i64::from(thought.depth))
            .bind(&thought.parent_thought_id)
            .bind(notes)
            .bind(final_action)
            .bind(timestamp(thought.created_at))
            .bind(timestamp(thought.updated_at))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_thought<'a>(
        &'a self,
        thought_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<Thought>>> + Send + 'a>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {THOUGHT_COLUMNS} FROM thoughts th WHERE th.thought_id = $1"
            ))
            .bind(thought_id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|r| map_thought_row(&r)).transpose()
        })
    }

    fn mark_thought_processing<'a>(
        &'a self,
        thought_id: &'a str,
        round_number: u64,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Thought>> + Send + 'a>> {
        Box::pin(async move {
            let now = Utc::now();
            let result = sqlx::query(
                "UPDATE thoughts SET status = $1, round_number = $2, updated_at = $3
                 WHERE thought_id = $4 AND status = $5",
            )
            .bind(ThoughtStatus::Processing.to_string())
            .bind(to_i64(round_number)?)
            .bind(timestamp(now))
            .bind(thought_id)
            .bind(ThoughtStatus::Pending.to_string())
            .execute(&self.pool)
            .await?;

            let thought = self
                .get_thought(thought_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    kind: "thought",
                    id: thought_id.to_string(),
                })?;

            if result.rows_affected() == 0 {
                return Err(StoreError::IllegalTransition {
                    kind: "thought",
                    from: thought.status.to_string(),
                    to: ThoughtStatus::Processing.to_string(),
                });
            }
            Ok(thought)
        })
    }

    fn update_thought_status<'a>(
        &'a self,
        thought_id: &'a str,
        status: ThoughtStatus,
        final_action: Option<&'a ActionSelectionResult>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Thought>> + Send + 'a>> {
        Box::pin(async move {
            let current = self
                .get_thought(thought_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    kind: "thought",
                    id: thought_id.to_string(),
                })?;

            if !current.status.can_transition_to(status) {
                return Err(StoreError::IllegalTransition {
                    kind: "thought",
                    from: current.status.to_string(),
                    to: status.to_string(),
                });
            }

            let final_json = final_action
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let now = Utc::now();

            let result = sqlx::query(
                "UPDATE thoughts
                 SET status = $1, final_action = COALESCE($2, final_action), updated_at = $3
                 WHERE thought_id = $4 AND status = $5",
            )
            .bind(status.to_string())
            .bind(final_json)
            .bind(timestamp(now))
            .bind(thought_id)
            .bind(current.status.to_string())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::IllegalTransition {
                    kind: "thought",
                    from: current.status.to_string(),
                    to: status.to_string(),
                });
            }

            Ok(Thought {
                status,
                final_action: final_action.cloned().or(current.final_action.clone()),
                updated_at: now,
                ..current
            })
        })
    }

    fn thoughts_for_task<'a>(
        &'a self,
        task_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Vec<Thought>>> + Send + 'a>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {THOUGHT_COLUMNS} FROM thoughts th
                 WHERE th.source_task_id = $1
                 ORDER BY th.created_at ASC, th.rowid ASC"
            ))
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(map_thought_row).collect()
        })
    }

    fn next_pending_thoughts<'a>(
        &'a self,
        max_priority: Option<i32>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Vec<Thought>>> + Send + 'a>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {THOUGHT_COLUMNS} FROM thoughts th
                 JOIN tasks t ON t.task_id = th.source_task_id
                 WHERE th.status = $1 AND t.status = $2 AND t.priority <= $3
                   AND th.rowid = (
                       SELECT first.rowid FROM thoughts first
                       WHERE first.source_task_id = th.source_task_id AND first.status = $1
                       ORDER BY first.created_at ASC, first.rowid ASC LIMIT 1
                   )
                   AND NOT EXISTS (
                       SELECT 1 FROM thoughts busy
                       WHERE busy.source_task_id = th.source_task_id AND busy.status = $4
                   )
                 ORDER BY t.priority ASC, t.created_at ASC, t.rowid ASC, th.created_at ASC
                 LIMIT $5"
            ))
            .bind(ThoughtStatus::Pending.to_string())
            .bind(TaskStatus::Active.to_string())
            .bind(i64::from(max_priority.unwrap_or(i32::MAX)))
            .bind(ThoughtStatus::Processing.to_string())
            .bind(to_i64(limit as u64)?)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(map_thought_row).collect()
        })
    }

    fn count_thoughts<'a>(
        &'a self,
        status: Option<ThoughtStatus>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<usize>> + Send + 'a>> {
        Box::pin(async move {
            let (count,): (i64,) = match status {
                Some(status) => {
                    sqlx::query_as("SELECT COUNT(*) FROM thoughts WHERE status = $1")
                        .bind(status.to_string())
                        .fetch_one(&self.pool)
                        .await?
                }
                None => {
                    sqlx::query_as("SELECT COUNT(*) FROM thoughts")
                        .fetch_one(&self.pool)
                        .await?
                }
            };
            usize::try_from(count)
                .map_err(|_| StoreError::Corrupt(format!("negative count: {count}")))
        })
    }

    fn reset_processing_thoughts(
        &self,
    ) -> Pin<Box<dyn Future<Output = StoreResult<usize>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE thoughts SET status = $1, updated_at = $2 WHERE status = $3",
            )
            .bind(ThoughtStatus::Pending.to_string())
            .bind(timestamp(Utc::now()))
            .bind(ThoughtStatus::Processing.to_string())
            .execute(&self.pool)
            .await?;
            Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
        })
    }
}
