use std::time::Duration;

use thiserror::Error;

/// Fatal at startup: a schedule entry references a handler name that was
/// never registered with the worker/scheduler's task registry.
#[derive(Debug, Error)]
#[error("unknown handler {name:?} referenced by scheduled task {scheduled_task_id:?}")]
pub struct ConfigurationError {
    pub scheduled_task_id: String,
    pub name: String,
}

/// A `submit` call was missing a required field.
#[derive(Debug, Error)]
#[error("invalid submit options: {0}")]
pub struct ValidationError(pub String);

/// Any database failure that escapes the worker's own recovery table, e.g.
/// raised out of `submit` or out of the scheduler's startup upsert.
#[derive(Debug, Error)]
#[error("storage error: {0}")]
pub struct StorageError(#[from] pub sqlx::Error);

/// Classification of a `sqlx::Error` as observed by the worker's poll loop.
/// Connection-class SQLSTATEs (08xxx) and serialization failures (40001)
/// are recoverable by sleeping and resuming; everything else is opaque.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("transient storage error ({sqlstate}): {source}")]
    Transient {
        sqlstate: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database pool observed closed")]
    PoolClosed,
    #[error(transparent)]
    Other(#[from] sqlx::Error),
}

impl PollError {
    /// Classify a driver error the way §7 classifies SQLSTATEs: connection
    /// loss and serialization conflicts are transient and recoverable,
    /// everything else just gets logged and retried by the caller's
    /// catch-all branch.
    pub fn classify(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::PoolClosed) {
            return PollError::PoolClosed;
        }

        if let sqlx::Error::Database(ref db_err) = err
            && let Some(code) = db_err.code()
            && matches!(
                code.as_ref(),
                "08001" | "08003" | "08004" | "08006" | "40001"
            )
        {
            return PollError::Transient {
                sqlstate: code.into_owned(),
                source: err,
            };
        }

        PollError::Other(err)
    }
}

/// Outcome of invoking a handler, as surfaced to `run_task`. A handler
/// returns `Ok(())` for a clean completion, or one of these two error kinds
/// for anything else. `Retry` is the "controlled retry signal" from the
/// spec; `Failure` is an uncontrolled exception, subject to the retry
/// budget in `task.max_retries`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler requested retry: {message:?}")]
    Retry {
        message: Option<String>,
        delay: Option<Duration>,
        strategy: RetryStrategy,
    },
    #[error("handler failed: {0}")]
    Failure(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn retry() -> Self {
        HandlerError::Retry {
            message: None,
            delay: None,
            strategy: RetryStrategy::Default,
        }
    }

    pub fn retry_after(delay: Duration) -> Self {
        HandlerError::Retry {
            message: None,
            delay: Some(delay),
            strategy: RetryStrategy::Default,
        }
    }

    pub fn retry_noop() -> Self {
        HandlerError::Retry {
            message: None,
            delay: None,
            strategy: RetryStrategy::Noop,
        }
    }
}

/// `noop` takes the retry without charging it against `max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    #[default]
    Default,
    Noop,
}
