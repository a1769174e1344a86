use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use sqlx::{Pool, Postgres};
use tokio::sync::watch;

use crate::{
    error::{HandlerError, PollError, RetryStrategy},
    executor::Executor,
    handler::Registry,
    metrics::Metrics,
    task::{Task, TaskStatus},
};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Config {
    pub name: String,
    pub queue: String,
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub tasks: Registry,
    pub executor: Arc<Executor>,
    pub pool: Pool<Postgres>,
    pub metrics: Arc<Metrics>,
}

impl Config {
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        pool: Pool<Postgres>,
        executor: Arc<Executor>,
        tasks: Registry,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            batch_size: 2,
            poll_interval: Duration::from_secs(5),
            tasks,
            executor,
            pool,
            metrics,
        }
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// What a poll step found.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Empty,
    Handled,
}

/// Scoped handle owning a worker's poll loop. Dropping the handle does not
/// stop the loop; call `shutdown` to signal it and wait for the in-flight
/// batch (if any) to finish persisting its outcomes.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl WorkerHandle {
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await?
    }
}

pub fn spawn(config: Config) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(run(config, shutdown_rx));
    WorkerHandle { shutdown_tx, join }
}

/// The event loop from §4.3: submit a poll step to the executor, race it
/// against the shutdown signal (shutdown wins ties), then dispatch on the
/// result.
async fn run(config: Config, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    tracing::info!(name = %config.name, queue = %config.queue, "worker loop starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut step = config.executor.spawn(poll_step(config.clone()));

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                tracing::info!(name = %config.name, "shutdown signal received, draining in-flight batch");
                let _ = (&mut step).await;
                break;
            }
            joined = &mut step => {
                match joined {
                    Ok(Ok(PollOutcome::Empty)) => {
                        tokio::time::sleep(config.poll_interval).await;
                    }
                    Ok(Ok(PollOutcome::Handled)) => {
                        // resume immediately, no sleep
                    }
                    Ok(Err(PollError::Transient { sqlstate, source })) => {
                        tracing::debug!(name = %config.name, %sqlstate, %source, "transient storage error, retrying after poll_interval");
                        tokio::time::sleep(config.poll_interval).await;
                    }
                    Ok(Err(PollError::PoolClosed)) => {
                        tracing::warn!(name = %config.name, "pool observed closed, stopping worker");
                        break;
                    }
                    Ok(Err(PollError::Other(err))) => {
                        tracing::error!(name = %config.name, error = ?err, "unexpected error in poll step");
                        tokio::time::sleep(config.poll_interval).await;
                    }
                    Err(join_err) => {
                        // The poll step task panicked or was aborted: the
                        // future resolved to an absence rather than a
                        // result (§4.3's NIL), which this loop treats the
                        // same as an explicit shutdown request.
                        tracing::error!(name = %config.name, error = %join_err, "poll step task did not complete, treating as shutdown");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(name = %config.name, "worker loop stopped");
    Ok(())
}

/// One transactional attempt to claim and process a batch (§4.3.1).
async fn poll_step(config: Config) -> Result<PollOutcome, PollError> {
    let mut tx = config
        .pool
        .begin()
        .await
        .map_err(PollError::classify)?;

    let rows = sqlx::query_as::<_, Task>(
        r#"
        SELECT id, name, props, queue, priority, max_retries, retry_num,
               status, error, scheduled_at, modified_at, completed_at
        FROM task
        WHERE scheduled_at <= now()
          AND queue = $1
          AND status IN ('new', 'retry')
        ORDER BY priority DESC, scheduled_at ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(&config.queue)
    .bind(config.batch_size)
    .fetch_all(&mut *tx)
    .await
    .map_err(PollError::classify)?;

    if rows.is_empty() {
        tx.commit().await.map_err(PollError::classify)?;
        return Ok(PollOutcome::Empty);
    }

    let executor = config.executor.clone();
    let futures = rows.iter().map(|row| {
        let config = config.clone();
        let row = row.clone();
        executor.submit(run_task(row, config))
    });
    let outcomes: Vec<(Task, Outcome)> = join_all(futures).await;

    for (task, outcome) in outcomes {
        persist_outcome(&mut tx, &task, outcome)
            .await
            .map_err(PollError::classify)?;
    }

    tx.commit().await.map_err(PollError::classify)?;

    Ok(PollOutcome::Handled)
}

enum Outcome {
    Completed,
    Retry {
        delay: Duration,
        increment: i32,
        error: Option<String>,
    },
    Failed {
        error: String,
    },
}

/// Invoke the registered handler and classify the result into one of the
/// three outcomes from §4.3.2.
async fn run_task(task: Task, config: Config) -> (Task, Outcome) {
    config.metrics.record_checkout(task.lateness());

    let Some(handler) = config.tasks.get(&task.name) else {
        tracing::warn!(id = %task.id, name = %task.name, "no handler registered for task, marking completed");
        return (task, Outcome::Completed);
    };

    let start = std::time::Instant::now();
    let result = handler.handle(&task).await;
    config
        .metrics
        .record_handler_duration(&task.name, start.elapsed());

    let outcome = match result {
        Ok(()) => Outcome::Completed,
        Err(HandlerError::Retry {
            message,
            delay,
            strategy,
        }) => Outcome::Retry {
            delay: delay.unwrap_or(DEFAULT_RETRY_DELAY),
            increment: if strategy == RetryStrategy::Noop { 0 } else { 1 },
            error: message,
        },
        Err(HandlerError::Failure(err)) => {
            let correlation_id = crate::id::generate("err");
            tracing::error!(id = %task.id, %correlation_id, error = ?err, "uncontrolled handler exception");

            if task.retry_num < task.max_retries {
                Outcome::Retry {
                    delay: DEFAULT_RETRY_DELAY,
                    increment: 1,
                    error: Some(format!("{err:#} (correlation_id={correlation_id})")),
                }
            } else {
                Outcome::Failed {
                    error: format!("{err:#} (correlation_id={correlation_id})"),
                }
            }
        }
    };

    (task, outcome)
}

async fn persist_outcome(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    task: &Task,
    outcome: Outcome,
) -> Result<(), sqlx::Error> {
    match outcome {
        Outcome::Completed => {
            sqlx::query(
                r#"
                UPDATE task
                SET status = 'completed', completed_at = now(), modified_at = now()
                WHERE id = $1
                "#,
            )
            .bind(&task.id)
            .execute(&mut **tx)
            .await?;
        }
        Outcome::Retry {
            delay,
            increment,
            error,
        } => {
            let delay_ms = delay.as_millis() as i64;
            sqlx::query(
                r#"
                UPDATE task
                SET status = 'retry',
                    scheduled_at = clock_timestamp() + make_interval(secs => $2 / 1000.0),
                    modified_at = clock_timestamp(),
                    error = $3,
                    retry_num = retry_num + $4
                WHERE id = $1
                "#,
            )
            .bind(&task.id)
            .bind(delay_ms)
            .bind(error)
            .bind(increment)
            .execute(&mut **tx)
            .await?;
        }
        Outcome::Failed { error } => {
            sqlx::query(
                r#"
                UPDATE task
                SET status = 'failed', error = $2, modified_at = now()
                WHERE id = $1
                "#,
            )
            .bind(&task.id)
            .bind(error)
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::Handler;
    use async_trait::async_trait;
    use chrono::Utc;

    fn sample_task(retry_num: i32, max_retries: i32) -> Task {
        Task {
            id: "task_test".to_string(),
            name: "noop".to_string(),
            props: serde_json::json!({}),
            queue: "default".to_string(),
            priority: 100,
            max_retries,
            retry_num,
            status: TaskStatus::New,
            error: None,
            scheduled_at: Utc::now(),
            modified_at: Utc::now(),
            completed_at: None,
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl Handler for AlwaysFails {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            Err(HandlerError::Failure(anyhow::anyhow!("boom")))
        }
    }

    struct AlwaysRetriesNoop;
    #[async_trait]
    impl Handler for AlwaysRetriesNoop {
        async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
            Err(HandlerError::retry_noop())
        }
    }

    fn test_config(registry: Registry) -> Config {
        Config::new(
            "test-worker",
            "default",
            // never connected to; not used by run_task directly
            sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/does-not-exist")
                .expect("lazy pool"),
            Arc::new(Executor::new(crate::executor::Config::default())),
            registry,
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn exhausted_retries_produce_failed_outcome() {
        let registry = Registry::new().register("noop", Arc::new(AlwaysFails));
        let config = test_config(registry);
        let task = sample_task(1, 1);

        let (_, outcome) = run_task(task, config).await;
        assert!(matches!(outcome, Outcome::Failed { .. }));
    }

    #[tokio::test]
    async fn retries_below_budget_produce_retry_outcome() {
        let registry = Registry::new().register("noop", Arc::new(AlwaysFails));
        let config = test_config(registry);
        let task = sample_task(0, 1);

        let (_, outcome) = run_task(task, config).await;
        match outcome {
            Outcome::Retry { increment, .. } => assert_eq!(increment, 1),
            _ => panic!("expected retry"),
        }
    }

    #[tokio::test]
    async fn noop_retry_strategy_does_not_increment() {
        let registry = Registry::new().register("noop", Arc::new(AlwaysRetriesNoop));
        let config = test_config(registry);
        let task = sample_task(0, 3);

        let (_, outcome) = run_task(task, config).await;
        match outcome {
            Outcome::Retry { increment, .. } => assert_eq!(increment, 0),
            _ => panic!("expected retry"),
        }
    }

    #[tokio::test]
    async fn unknown_handler_completes_rather_than_poisons_the_queue() {
        let config = test_config(Registry::new());
        let task = sample_task(0, 3);

        let (_, outcome) = run_task(task, config).await;
        assert!(matches!(outcome, Outcome::Completed));
    }

    fn db_config(pool: sqlx::PgPool, registry: Registry) -> Config {
        Config::new(
            "test-worker",
            "default",
            pool,
            Arc::new(Executor::new(crate::executor::Config::default())),
            registry,
            Arc::new(Metrics::new()),
        )
        .batch_size(5)
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn poll_step_claims_and_completes_eligible_task(pool: sqlx::PgPool) {
        struct Noop;
        #[async_trait]
        impl Handler for Noop {
            async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
                Ok(())
            }
        }

        let metrics = Metrics::new();
        let id = crate::task::submit(
            &pool,
            crate::task::SubmitMeta::new("noop"),
            serde_json::json!({}),
            &metrics,
        )
        .await
        .expect("submit");

        let registry = Registry::new().register("noop", Arc::new(Noop));
        let config = db_config(pool.clone(), registry);

        let outcome = poll_step(config).await.expect("poll_step");
        assert_eq!(outcome, PollOutcome::Handled);

        let task = crate::task::get_task(&pool, &id)
            .await
            .expect("get_task")
            .expect("row present");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn poll_step_is_empty_when_nothing_is_due(pool: sqlx::PgPool) {
        let config = db_config(pool, Registry::new());
        let outcome = poll_step(config).await.expect("poll_step");
        assert_eq!(outcome, PollOutcome::Empty);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn two_workers_split_a_batch_without_double_claiming(pool: sqlx::PgPool) {
        struct Noop;
        #[async_trait]
        impl Handler for Noop {
            async fn handle(&self, _task: &Task) -> Result<(), HandlerError> {
                Ok(())
            }
        }

        let metrics = Metrics::new();
        let mut ids = Vec::new();
        for _ in 0..6 {
            let id = crate::task::submit(
                &pool,
                crate::task::SubmitMeta::new("noop"),
                serde_json::json!({}),
                &metrics,
            )
            .await
            .expect("submit");
            ids.push(id);
        }

        let registry = Registry::new().register("noop", Arc::new(Noop));
        let worker_a = db_config(pool.clone(), registry.clone()).batch_size(3);
        let worker_b = db_config(pool.clone(), registry).batch_size(3);

        let (a, b) = tokio::join!(poll_step(worker_a), poll_step(worker_b));
        assert_eq!(a.expect("poll_step a"), PollOutcome::Handled);
        assert_eq!(b.expect("poll_step b"), PollOutcome::Handled);

        for id in ids {
            let task = crate::task::get_task(&pool, &id)
                .await
                .expect("get_task")
                .expect("row present");
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }
}
