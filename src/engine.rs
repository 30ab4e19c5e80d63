//! Compensation engine. The public API for submitting and retrying tasks.
//!
//! A submitted task is persisted with its submitter as lease holder and run
//! at once. Success deletes the row. Failure records the error on the row,
//! and a later batch sweep claims it again once the lease has expired.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::db::{Claim, Failure, TaskStore};
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorRegistry};
use crate::model::{NewTask, Task, TaskId, lease_expiry};
use crate::sandbox::{self, Notifier};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, start_sweep_span, start_task_span};

/// Derives the cancellation token an async submission runs under.
pub type AsyncContext = Arc<dyn Fn(&CancellationToken) -> CancellationToken + Send + Sync>;

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Added to every execution timeout to form the lease.
    pub lease_margin: Duration,
    /// Clear the lease holder when recording a failure. Rows that keep their
    /// holder are never claimed again.
    pub release_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_margin: Duration::from_secs(5),
            release_on_failure: true,
        }
    }
}

/// Outcome of a synchronous execution.
#[derive(Debug)]
pub struct Execution {
    /// Rows touched by the finalize write. Zero means the lease was lost.
    pub rows_affected: u64,
    /// The task as finalized.
    pub task: Task,
    /// What the executor did.
    pub result: Result<()>,
}

/// Outcome of an asynchronous submission.
#[derive(Debug)]
pub struct Submission {
    /// Rows written by the insert.
    pub rows_affected: u64,
    pub task: Task,
}

/// The compensation engine. Cheap to clone; clones share all state.
pub struct Compensator<S> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    notifier: Option<Notifier>,
    async_context: AsyncContext,
}

impl<S> Clone for Compensator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            notifier: self.notifier.clone(),
            async_context: Arc::clone(&self.async_context),
        }
    }
}

impl<S: TaskStore> Compensator<S> {
    pub fn new(store: Arc<S>, registry: Arc<ExecutorRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            config,
            notifier: None,
            async_context: Arc::new(|_: &CancellationToken| CancellationToken::new()),
        }
    }

    /// Replace the wall clock used for lease arithmetic.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Receive one line per attempt and per finalize.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Choose how `execute_async` derives its cancellation token from the
    /// caller's. The default ignores the caller and detaches.
    pub fn with_async_context<F>(mut self, derive: F) -> Self
    where
        F: Fn(&CancellationToken) -> CancellationToken + Send + Sync + 'static,
    {
        self.async_context = Arc::new(derive);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an executor for task `name`.
    pub fn register(&self, name: impl Into<String>, executor: impl Executor) -> Result<()> {
        self.registry.register(name, executor)
    }

    /// Persist `new` and run it now, waiting for the outcome.
    ///
    /// The outer error is reserved for persistence failures. Whatever the
    /// executor did is reported in [`Execution::result`].
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        new: NewTask,
        timeout: Duration,
    ) -> Result<Execution> {
        let (_, task) = self.submit(new, timeout, "sync").await?;
        self.attempt(ctx, task, timeout).await
    }

    /// Persist `new` and run it in the background.
    pub async fn execute_async(
        &self,
        ctx: &CancellationToken,
        new: NewTask,
        timeout: Duration,
    ) -> Result<Submission> {
        let (rows_affected, task) = self.submit(new, timeout, "async").await?;

        let engine = self.clone();
        let token = (self.async_context)(ctx);
        let background = task.clone();
        tokio::spawn(async move {
            let id = background.id;
            if let Err(e) = engine.attempt(&token, background, timeout).await {
                error!(id = %id, error = %e, "async finalize failed");
            }
        });

        Ok(Submission {
            rows_affected,
            task,
        })
    }

    /// Claim up to `limit` expired tasks of `group` and run them concurrently.
    ///
    /// Returns how many tasks were claimed. Individual failures are recorded
    /// on their rows and logged; only a failed claim is returned as an error.
    pub async fn execute_batch(
        &self,
        ctx: &CancellationToken,
        group: i32,
        limit: i64,
        timeout: Duration,
    ) -> Result<usize> {
        let span = start_sweep_span(group, limit);
        let tasks = self
            .claim(group, limit, timeout)
            .instrument(span.clone())
            .await?;
        let claimed = tasks.len();
        span.record("sweep.claimed", claimed as u64);

        let mut attempts = JoinSet::new();
        for task in tasks {
            let engine = self.clone();
            let token = ctx.clone();
            attempts.spawn(async move {
                let id = task.id;
                (id, engine.attempt(&token, task, timeout).await)
            });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((id, Ok(execution))) => match execution.result {
                    Err(e) if e.is_execution_failure() => {
                        debug!(id = %id, error = %e, "batch attempt failed")
                    }
                    Err(e) => warn!(id = %id, error = %e, "batch attempt failed outside the executor"),
                    Ok(()) => {}
                },
                Ok((id, Err(e))) => warn!(id = %id, error = %e, "batch finalize failed"),
                Err(e) => error!(error = %e, "batch attempt aborted"),
            }
        }

        span.in_scope(|| info!(group, claimed, "sweep finished"));
        Ok(claimed)
    }

    /// Lease up to `limit` expired, unheld tasks of `group`, oldest first.
    /// A non-positive `limit` claims nothing.
    pub async fn claim(&self, group: i32, limit: i64, timeout: Duration) -> Result<Vec<Task>> {
        if limit <= 0 {
            debug!(group, limit, "claim limit is not positive");
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let claim = Claim {
            group,
            limit,
            locker: Uuid::new_v4().to_string(),
            now,
            lock_expire: lease_expiry(now, self.lease(timeout)?)?,
        };
        let tasks = self.store.claim(&claim).await?;

        metrics::tasks_claimed().add(tasks.len() as u64, &[KeyValue::new("group", group as i64)]);
        debug!(group, claimed = tasks.len(), locker = %claim.locker, "claimed tasks");
        Ok(tasks)
    }

    /// Look up a task. `None` means it succeeded and was deleted, or never
    /// existed.
    pub async fn task_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        self.store.get(id).await
    }

    /// Tasks of `group` still waiting to succeed, oldest first.
    pub async fn outstanding(&self, group: i32, limit: i64) -> Result<Vec<Task>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        self.store.list(group, limit).await
    }

    fn lease(&self, timeout: Duration) -> Result<chrono::Duration> {
        let lease = self
            .config
            .lease_margin
            .checked_add(timeout)
            .ok_or_else(|| Error::Other(format!("lease overflow for timeout {timeout:?}")))?;
        chrono::Duration::from_std(lease)
            .map_err(|e| Error::Other(format!("lease {lease:?} out of range: {e}")))
    }

    async fn submit(&self, new: NewTask, timeout: Duration, mode: &'static str) -> Result<(u64, Task)> {
        let task = Task::submitted(new, self.clock.now(), self.lease(timeout)?)?;
        let rows = self.store.insert(&task).await?;

        metrics::tasks_submitted().add(
            1,
            &[
                KeyValue::new("name", task.name.clone()),
                KeyValue::new("mode", mode),
            ],
        );
        info!(id = %task.id, name = %task.name, group = task.group, mode, "task submitted");
        Ok((rows, task))
    }

    /// Run one attempt of a task this engine holds the lease for, then
    /// finalize the row.
    async fn attempt(
        &self,
        ctx: &CancellationToken,
        mut task: Task,
        timeout: Duration,
    ) -> Result<Execution> {
        let span = start_task_span(&task.name, &task.id, task.group, task.retries);

        async {
            let started = std::time::Instant::now();
            let result = match self.registry.get(&task.name) {
                Some(executor) => {
                    sandbox::run(executor, ctx, task.clone(), timeout, self.notifier.as_ref())
                        .await
                }
                None => {
                    let e = Error::ExecutorNotFound(task.name.clone());
                    warn!(name = %task.name, "no executor registered");
                    self.notify(&format!("{}[{}] err: {e}", task.name, task.args));
                    Err(e)
                }
            };

            let outcome = result.as_ref().err().map_or("ok", Error::outcome);
            metrics::task_attempts().add(
                1,
                &[
                    KeyValue::new("name", task.name.clone()),
                    KeyValue::new("outcome", outcome),
                ],
            );
            metrics::task_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("name", task.name.clone())],
            );

            let rows_affected = self.finalize(&mut task, &result).await?;
            record_outcome(&span, outcome, rows_affected);

            Ok(Execution {
                rows_affected,
                task,
                result,
            })
        }
        .instrument(span.clone())
        .await
    }

    /// Delete the row on success, record the error on failure. Both writes
    /// only apply while this attempt's lease holder still owns the row.
    async fn finalize(&self, task: &mut Task, result: &Result<()>) -> Result<u64> {
        let (operation, written) = match result {
            Ok(()) => ("delete", self.store.delete(task.id, &task.locker).await),
            Err(e) => {
                let failure = Failure {
                    id: task.id,
                    locker: task.locker.clone(),
                    message: e.to_string(),
                    exec_time: self.clock.now(),
                    release: self.config.release_on_failure,
                };
                let written = self.store.record_failure(&failure).await;
                task.last_error = failure.message;
                task.exec_time = Some(failure.exec_time);
                if failure.release {
                    task.locker.clear();
                }
                ("record_error", written)
            }
        };

        match &written {
            Ok(rows) => {
                self.notify(&format!("finalize {} rows {rows} err none", task.id));
                if *rows == 0 {
                    warn!(id = %task.id, operation, "finalize matched no row; lease lost");
                }
                metrics::tasks_finalized().add(
                    1,
                    &[
                        KeyValue::new("operation", operation),
                        KeyValue::new("applied", *rows > 0),
                    ],
                );
            }
            Err(e) => {
                self.notify(&format!("finalize {} rows 0 err {e}", task.id));
                error!(id = %task.id, operation, error = %e, "finalize failed");
            }
        }

        written
    }

    fn notify(&self, line: &str) {
        if let Some(notify) = &self.notifier {
            notify(line);
        }
    }
}
