//! Background sweep that retries failed tasks.
//!
//! Every `interval`, runs one batch per configured group. Tasks whose lease
//! has expired and that no worker holds are claimed and executed again.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db::TaskStore;
use crate::engine::Compensator;

/// Sweep schedule.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Groups swept each round, in order.
    pub groups: Vec<i32>,
    /// Max tasks claimed per group per round.
    pub limit: i64,
    /// Execution timeout for each claimed task.
    pub timeout: Duration,
    /// Pause between rounds.
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            groups: vec![0],
            limit: 100,
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(10),
        }
    }
}

/// Start the sweep loop.
///
/// Returns a CancellationToken that stops the loop when cancelled. Attempts
/// still running at that point are cancelled with it.
pub fn start<S: TaskStore>(engine: Compensator<S>, config: SweepConfig) -> CancellationToken {
    let cancel = CancellationToken::new();
    let stop = cancel.clone();

    tokio::spawn(async move {
        info!(
            "compensation sweeper started (interval={:?}, groups={:?})",
            config.interval, config.groups
        );
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("compensation sweeper stopped");
                    break;
                }
                _ = tokio::time::sleep(config.interval) => {
                    for &group in &config.groups {
                        debug!(group, "sweeping");
                        match engine.execute_batch(&stop, group, config.limit, config.timeout).await {
                            Ok(0) => {}
                            Ok(n) => info!(group, claimed = n, "swept tasks"),
                            Err(e) => error!(group, error = %e, "sweep failed"),
                        }
                    }
                }
            }
        }
    });

    cancel
}
