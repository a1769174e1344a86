use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::PgExecutor;

use crate::{
    error::{StorageError, ValidationError},
    id,
    metrics::Metrics,
};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// A `task` row's lifecycle. `status` transitions form a DAG:
/// `New -> {Retry, Completed, Failed}`, `Retry -> {Retry, Completed, Failed}`.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TaskStatus {
    New,
    Retry,
    Completed,
    Failed,
}

/// A decoded `task` row, as handed to a handler.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub props: Json,
    pub queue: String,
    pub priority: i32,
    pub max_retries: i32,
    pub retry_num: i32,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// An eligible row is `new`/`retry` and already due; this is the
    /// dispatch-time latency the `tasks_checkout_timing` summary observes.
    pub fn lateness(&self) -> Duration {
        (Utc::now() - self.scheduled_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Framework-owned fields for `submit`. Kept separate from `props` so the
/// caller never needs a reserved-key filter (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct SubmitMeta {
    pub task: String,
    pub queue: String,
    pub priority: i32,
    pub max_retries: i32,
    pub delay: Duration,
}

impl SubmitMeta {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            delay: Duration::ZERO,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Insert a new `task` row. `executor` participates in the caller's
/// transaction when one is supplied (a `Transaction<'_, Postgres>` is
/// itself a valid `PgExecutor`).
pub async fn submit<'e>(
    executor: impl PgExecutor<'e>,
    meta: SubmitMeta,
    props: Json,
    metrics: &Metrics,
) -> Result<String, SubmitError> {
    if meta.task.is_empty() {
        return Err(ValidationError("task name must not be empty".into()).into());
    }

    let id = id::generate("task");
    let delay_ms = meta.delay.as_millis() as i64;

    sqlx::query(
        r#"
        INSERT INTO task (id, name, props, queue, priority, max_retries, scheduled_at, status)
        VALUES ($1, $2, $3, $4, $5, $6, clock_timestamp() + make_interval(secs => $7 / 1000.0), 'new')
        "#,
    )
    .bind(&id)
    .bind(&meta.task)
    .bind(&props)
    .bind(&meta.queue)
    .bind(meta.priority)
    .bind(meta.max_retries)
    .bind(delay_ms)
    .execute(executor)
    .await
    .map_err(StorageError)?;

    metrics.record_submit(&meta.task);

    Ok(id)
}

/// Look up a single task by id, decoded the same way a worker would decode
/// a polled row. Used by operational tooling and by the submit/retrieve
/// round-trip property.
pub async fn get_task<'e>(
    executor: impl PgExecutor<'e>,
    id: &str,
) -> Result<Option<Task>, StorageError> {
    sqlx::query_as::<_, Task>(
        r#"
        SELECT id, name, props, queue, priority, max_retries, retry_num,
               status, error, scheduled_at, modified_at, completed_at
        FROM task
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(StorageError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    #[sqlx::test(migrations = "./migrations")]
    async fn submit_then_get_round_trips_props(pool: PgPool) {
        let metrics = Metrics::new();
        let meta = SubmitMeta::new("noop").queue("default").priority(50);
        let props = serde_json::json!({"n": 1});

        let id = submit(&pool, meta, props.clone(), &metrics)
            .await
            .expect("submit");

        let task = get_task(&pool, &id)
            .await
            .expect("get_task")
            .expect("row present");

        assert_eq!(task.props, props);
        assert_eq!(task.priority, 50);
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.retry_num, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn submit_rejects_empty_task_name(pool: PgPool) {
        let metrics = Metrics::new();
        let meta = SubmitMeta::new("");

        let err = submit(&pool, meta, serde_json::Value::Null, &metrics)
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::Validation(_)));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn get_task_returns_none_for_unknown_id(pool: PgPool) {
        let result = get_task(&pool, "task_does_not_exist").await.expect("query");
        assert!(result.is_none());
    }
}
