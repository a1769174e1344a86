use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::{Instant, sleep_until},
};

use crate::ExecutorOptions;

/// Bounded pool used to run handler invocations and DB polls off whichever
/// loop submitted them. Backed by the Tokio runtime's own thread pool;
/// `max_threads` is enforced as a concurrency bound via a semaphore rather
/// than a dedicated OS thread pool, since spawning blocking OS threads per
/// task would defeat the point of running on an async runtime.
#[derive(Clone)]
pub struct Executor {
    name: String,
    max_threads: usize,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub min_threads: usize,
    pub max_threads: usize,
    pub idle_timeout_ms: u64,
}

impl Config {
    pub async fn from_cli(options: ExecutorOptions) -> Self {
        Self {
            max_threads: options.max_threads,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "executor".to_string(),
            min_threads: 0,
            max_threads: 256,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Cancel handle for a `schedule`d future. Dropping it leaves the timer
/// armed; call `cancel` to stop it before it fires.
pub struct CancelHandle {
    handle: JoinHandle<()>,
}

impl CancelHandle {
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Executor {
    pub fn new(config: Config) -> Self {
        tracing::info!(name = %config.name, max_threads = config.max_threads, "executor starting");
        Self {
            name: config.name,
            max_threads: config.max_threads.max(1),
            permits: Arc::new(Semaphore::new(config.max_threads.max(1))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` against the pool, waiting for a free slot if all
    /// `max_threads` permits are checked out.
    pub async fn submit<F>(&self, f: F) -> F::Output
    where
        F: Future + Send,
        F::Output: Send,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("executor semaphore closed");
        let result = f.await;
        drop(permit);
        result
    }

    /// Like `submit`, but detaches `f` onto its own task rather than
    /// awaiting it inline. The worker uses this for its poll step so the
    /// step keeps running to completion even if the main loop moves on to
    /// select against a shutdown signal.
    pub fn spawn<F>(&self, f: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("executor semaphore closed");
            f.await
        })
    }

    /// Arm `f` to run once, `delay` from now, on a dedicated single-thread
    /// timer task so scheduler firings observe deterministic ordering
    /// relative to each other regardless of how busy the shared pool is.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> CancelHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            f.await;
        });

        CancelHandle { handle }
    }

    /// Scoped shutdown: stop accepting new work and give in-flight
    /// submissions up to 500ms to finish before returning.
    pub async fn shutdown(&self) {
        tracing::info!(name = %self.name, "executor shutting down");
        let drain = async {
            let _ = self
                .permits
                .acquire_many(self.max_threads as u32)
                .await
                .expect("executor semaphore closed");
        };

        if tokio::time::timeout(Duration::from_millis(500), drain)
            .await
            .is_err()
        {
            tracing::warn!(name = %self.name, "executor shutdown timed out with work in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_runs_future_and_releases_permit() {
        let executor = Executor::new(Config {
            max_threads: 1,
            ..Config::default()
        });

        let result = executor.submit(async { 1 + 1 }).await;
        assert_eq!(result, 2);

        // the single permit must have been returned
        let result = executor.submit(async { 2 + 2 }).await;
        assert_eq!(result, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_fires_after_delay() {
        let executor = Executor::new(Config::default());
        let (tx, rx) = tokio::sync::oneshot::channel();

        let _handle = executor.schedule(Duration::from_millis(50), async move {
            let _ = tx.send(());
        });

        tokio::time::advance(Duration::from_millis(60)).await;
        rx.await.expect("timer fired");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let executor = Executor::new(Config::default());
        let (tx, mut rx) = tokio::sync::oneshot::channel::<()>();

        let handle = executor.schedule(Duration::from_millis(50), async move {
            let _ = tx.send(());
        });
        handle.cancel();

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
