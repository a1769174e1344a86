mod cron;

use std::{cmp::Reverse, collections::BinaryHeap, sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::{Pool, Postgres};
use tokio::sync::{Mutex, watch};

use crate::{SchedulerOptions, error::ConfigurationError, executor::Executor, handler::Registry};

/// One cron-defined entry: a stable id, its schedule, and the handler name
/// it invokes when it fires. `props` are passed through to the handler the
/// same way a submitted task's `props` would be.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: String,
    pub cron_expr: String,
    pub task: String,
    pub props: serde_json::Value,
}

impl ScheduleEntry {
    pub fn new(id: impl Into<String>, cron_expr: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cron_expr: cron_expr.into(),
            task: task.into(),
            props: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ScheduledTaskRow {
    id: String,
    cron_expr: String,
}

#[derive(Clone)]
pub struct Config {
    pub pool: Pool<Postgres>,
    pub executor: Arc<Executor>,
    pub schedule: Vec<ScheduleEntry>,
    pub tasks: Registry,
}

impl Config {
    pub async fn from_cli(
        _options: SchedulerOptions,
        pool: Pool<Postgres>,
        executor: Arc<Executor>,
        schedule: Vec<ScheduleEntry>,
        tasks: Registry,
    ) -> Self {
        Self {
            pool,
            executor,
            schedule,
            tasks,
        }
    }
}

/// Ordered by soonest-first; backs the single-thread timer's priority
/// queue of armed firings.
struct Armed {
    fire_at: Duration,
    entry: ScheduleEntry,
}

impl PartialEq for Armed {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for Armed {}
impl PartialOrd for Armed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Armed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

/// Registers cron-defined tasks, arms their firings on a single-thread
/// timer loop, and executes each firing under a row lock so only one node
/// in the cluster runs it per window.
pub async fn start(config: Config, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    upsert_schedule(&config.pool, &config.schedule, &config.tasks).await?;

    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => {
            tracing::info!("scheduler shutting down");
        },
        res = timer_loop(&config) => res?,
    }

    Ok(())
}

async fn upsert_schedule(
    pool: &Pool<Postgres>,
    schedule: &[ScheduleEntry],
    tasks: &Registry,
) -> anyhow::Result<()> {
    for entry in schedule {
        if !tasks.contains(&entry.task) {
            return Err(ConfigurationError {
                scheduled_task_id: entry.id.clone(),
                name: entry.task.clone(),
            }
            .into());
        }

        sqlx::query(
            r#"
            INSERT INTO scheduled_task (id, cron_expr)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET cron_expr = EXCLUDED.cron_expr, modified_at = now()
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.cron_expr)
        .execute(pool)
        .await?;

        tracing::info!(id = %entry.id, cron = %entry.cron_expr, "registered scheduled task");
    }

    Ok(())
}

/// Single task owns the whole timer: a min-heap of armed firings keyed by
/// delay-from-start, always sleeping until the soonest one. This is what
/// gives the scheduler its "single-thread timer" determinism — one node
/// never runs two firings of the same id concurrently, because re-arming
/// happens only after the previous firing's transaction commits.
async fn timer_loop(config: &Config) -> anyhow::Result<()> {
    let start = tokio::time::Instant::now();
    let now = Utc::now();

    let mut heap = BinaryHeap::new();
    for entry in &config.schedule {
        match cron::ms_until_next_valid(&entry.cron_expr, now) {
            Ok(ms) => heap.push(Reverse(Armed {
                fire_at: Duration::from_millis(ms as u64),
                entry: entry.clone(),
            })),
            Err(err) => tracing::error!(id = %entry.id, %err, "invalid cron expression, will not be scheduled"),
        }
    }

    let heap = Arc::new(Mutex::new(heap));

    loop {
        let next = {
            let mut guard = heap.lock().await;
            guard.pop()
        };

        let Some(Reverse(armed)) = next else {
            // nothing scheduled; sleep and re-check rather than busy-loop
            tokio::time::sleep(Duration::from_secs(3)).await;
            continue;
        };

        tokio::time::sleep_until(start + armed.fire_at).await;

        if let Err(err) = fire(&config.pool, &armed.entry, &config.tasks).await {
            tracing::error!(id = %armed.entry.id, %err, "scheduled task firing failed");
        }

        // Re-arm happens unconditionally, in a finally-equivalent scope: a
        // handler throwing never halts the periodic schedule.
        match cron::ms_until_next_valid(&armed.entry.cron_expr, Utc::now()) {
            Ok(ms) => {
                let fire_at = tokio::time::Instant::now() + Duration::from_millis(ms as u64) - start;
                heap.lock().await.push(Reverse(Armed {
                    fire_at,
                    entry: armed.entry,
                }));
            }
            Err(err) => {
                tracing::error!(id = %armed.entry.id, %err, "failed to re-arm scheduled task")
            }
        }
    }
}

/// BEGIN; SELECT ... FOR UPDATE SKIP LOCKED; invoke handler if still
/// present; COMMIT. If another node already claimed this firing window the
/// SELECT finds nothing locked and this node silently skips.
async fn fire(pool: &Pool<Postgres>, entry: &ScheduleEntry, tasks: &Registry) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, ScheduledTaskRow>(
        "SELECT id, cron_expr FROM scheduled_task WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(&entry.id)
    .fetch_optional(&mut *tx)
    .await?;

    if row.is_none() {
        tx.commit().await?;
        return Ok(());
    }

    if let Some(handler) = tasks.get(&entry.task) {
        let task = crate::task::Task {
            id: entry.id.clone(),
            name: entry.task.clone(),
            props: entry.props.clone(),
            queue: "scheduler".to_string(),
            priority: 0,
            max_retries: 0,
            retry_num: 0,
            status: crate::task::TaskStatus::New,
            error: None,
            scheduled_at: Utc::now(),
            modified_at: Utc::now(),
            completed_at: None,
        };

        if let Err(err) = handler.handle(&task).await {
            tracing::error!(id = %entry.id, %err, "scheduled task handler returned an error");
        }
    } else {
        tracing::warn!(id = %entry.id, task = %entry.task, "no handler registered for scheduled task firing");
    }

    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use async_trait::async_trait;
    use sqlx::PgPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_rejects_entry_with_unregistered_handler(pool: PgPool) {
        let schedule = vec![ScheduleEntry::new("heartbeat", "* * * * *", "does-not-exist")];
        let err = upsert_schedule(&pool, &schedule, &Registry::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn upsert_is_idempotent_on_cron_expr_change(pool: PgPool) {
        let tasks = Registry::new().register("noop", Arc::new(CountingHandler::default()));
        let first = vec![ScheduleEntry::new("heartbeat", "* * * * *", "noop")];
        upsert_schedule(&pool, &first, &tasks).await.expect("first upsert");

        let second = vec![ScheduleEntry::new("heartbeat", "*/5 * * * *", "noop")];
        upsert_schedule(&pool, &second, &tasks).await.expect("second upsert");

        let row: ScheduledTaskRow =
            sqlx::query_as("SELECT id, cron_expr FROM scheduled_task WHERE id = $1")
                .bind("heartbeat")
                .fetch_one(&pool)
                .await
                .expect("row present");
        assert_eq!(row.cron_expr, "*/5 * * * *");
    }

    #[derive(Default, Clone)]
    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _task: &crate::task::Task) -> Result<(), crate::error::HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn concurrent_fire_only_runs_once_per_window(pool: PgPool) {
        sqlx::query("INSERT INTO scheduled_task (id, cron_expr) VALUES ($1, $2)")
            .bind("heartbeat")
            .bind("* * * * *")
            .execute(&pool)
            .await
            .expect("seed scheduled_task");

        let counter = CountingHandler::default();
        let tasks = Registry::new().register("noop", Arc::new(counter.clone()));
        let entry = ScheduleEntry::new("heartbeat", "* * * * *", "noop");

        // `FOR UPDATE SKIP LOCKED` means two concurrent firings within the
        // same transaction window never both invoke the handler.
        let (a, b) = tokio::join!(fire(&pool, &entry, &tasks), fire(&pool, &entry, &tasks));
        a.expect("fire a");
        b.expect("fire b");

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
