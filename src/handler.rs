use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{error::HandlerError, task::Task};

/// A registered handler. Implementations are shared immutable references;
/// the registry is built once at startup and never mutated after.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        (self)(task.clone()).await
    }
}

/// Name -> handler mapping, immutable after construction. Looking up an
/// unregistered name is not an error here; that's the worker's call to
/// make (§7 `UnknownHandler`).
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}
