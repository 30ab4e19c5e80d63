//! Executors and the registry that maps task names to them.
//!
//! An executor is the business logic behind a task name. The registry is
//! injected into the engine at construction; it is not process-global, so
//! independent engines (and tests) never see each other's executors.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::Task;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Runs one task. May be invoked concurrently for different tasks.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, ctx: ExecContext, task: Task) -> BoxFuture<anyhow::Result<()>>;
}

impl<F, Fut> Executor for F
where
    F: Fn(ExecContext, Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn execute(&self, ctx: ExecContext, task: Task) -> BoxFuture<anyhow::Result<()>> {
        Box::pin(self(ctx, task))
    }
}

/// What an executor knows about the attempt it is running.
///
/// The token is cancelled when the attempt times out or the caller gives up.
/// Executors that do long work should watch it; the sandbox stops waiting
/// either way.
#[derive(Debug, Clone)]
pub struct ExecContext {
    cancellation: CancellationToken,
    deadline: Instant,
}

impl ExecContext {
    pub(crate) fn new(cancellation: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancellation,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Registry of executors, indexed by task name.
///
/// Registration takes a write lock so it may race with lookups from running
/// engines.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    /// Create an empty registry with no executors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` under `name`. A name can only be registered once;
    /// the first registration stays active.
    pub fn register(&self, name: impl Into<String>, executor: impl Executor) -> Result<()> {
        let name = name.into();
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        if executors.contains_key(&name) {
            return Err(Error::DuplicateExecutor(name));
        }
        executors.insert(name, Arc::new(executor));
        Ok(())
    }

    /// Look up an executor by task name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
