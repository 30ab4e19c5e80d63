//! Execution sandbox: one executor invocation under a deadline.
//!
//! The executor runs on its own tokio task behind `catch_unwind`, on a child
//! of the caller's cancellation token. The caller observes exactly one of
//! success, executor error, panic, timeout, or cancellation. When the caller
//! stops waiting, or drops the future outright, the child token is cancelled
//! and the join handle is dropped, which detaches the task; whatever it
//! eventually returns is discarded.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::executor::{ExecContext, Executor};
use crate::model::Task;

/// Receives a human-readable line for every attempt and finalize.
pub type Notifier = Arc<dyn Fn(&str) + Send + Sync>;

/// Run `task` on `executor`, bounded by `timeout` and by `parent`.
pub async fn run(
    executor: Arc<dyn Executor>,
    parent: &CancellationToken,
    task: Task,
    timeout: Duration,
    notifier: Option<&Notifier>,
) -> Result<()> {
    let token = parent.child_token();
    // Fires on every exit, including the caller dropping this future.
    let _cancel_on_drop = token.clone().drop_guard();
    let ctx = ExecContext::new(token.clone(), timeout);
    let summary = format!("{}[{}]", task.name, task.args);

    let handle = tokio::spawn(async move {
        AssertUnwindSafe(async move { executor.execute(ctx, task).await })
            .catch_unwind()
            .await
    });

    let result = tokio::select! {
        joined = handle => match joined {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::Handler(format!("{e:#}"))),
            Ok(Err(payload)) => Err(Error::Panic(panic_message(payload.as_ref()))),
            // The runtime is shutting down underneath us.
            Err(e) => Err(Error::Other(format!("executor task failed: {e}"))),
        },
        _ = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
        _ = parent.cancelled() => Err(Error::Cancelled),
    };

    match &result {
        Ok(()) => debug!(task = %summary, "executor finished"),
        Err(e) => warn!(task = %summary, error = %e, "executor failed"),
    }
    if let Some(notify) = notifier {
        let outcome = match &result {
            Ok(()) => "none".to_string(),
            Err(e) => e.to_string(),
        };
        notify(&format!("{summary} err: {outcome}"));
    }

    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
