//! Handler registration: maps the handler names tasks carry to runnable
//! code. The task names its handler directly, there is no routing table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::Task;

/// A handler failure, plus whether another attempt could help.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub message: String,
    pub retryable: bool,
}

impl TaskFailure {
    /// A transient failure; the task re-enters the retry schedule while
    /// budget remains.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure no retry can fix; the task goes straight to dead.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskFailure {}

/// Application code executing one task.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, task: Task) -> Result<(), TaskFailure>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), TaskFailure>> + Send>>;

struct FnHandler {
    f: Box<dyn Fn(Task) -> HandlerFuture + Send + Sync>,
}

#[async_trait]
impl Handler for FnHandler {
    async fn run(&self, task: Task) -> Result<(), TaskFailure> {
        (self.f)(task).await
    }
}

/// Registry of handlers, indexed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register a plain async function or closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskFailure>> + Send + 'static,
    {
        let f = Box::new(move |task: Task| -> HandlerFuture { Box::pin(f(task)) });
        self.register(name, Arc::new(FnHandler { f }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
