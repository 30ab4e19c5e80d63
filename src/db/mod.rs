//! Task storage: the store seam, its row mapping, and the SQL backends.
//!
//! The `compensation_task` table is the single source of truth. Every lease
//! transition is a conditional statement against it; nothing is cached in
//! memory across workers.

pub mod postgres;
pub mod sqlite;

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Task, TaskId};

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

/// Parameters of one claim. Generated by the engine so that lease math uses
/// the engine's clock.
#[derive(Debug, Clone)]
pub struct Claim {
    pub group: i32,
    pub limit: i64,
    /// Lease holder written to every claimed row.
    pub locker: String,
    /// Rows whose lease expired strictly before this are eligible.
    pub now: DateTime<Utc>,
    pub lock_expire: DateTime<Utc>,
}

/// A failed attempt to be recorded on its row.
#[derive(Debug, Clone)]
pub struct Failure {
    pub id: TaskId,
    /// Only the current lease holder may record.
    pub locker: String,
    pub message: String,
    pub exec_time: DateTime<Utc>,
    /// Clear the lease holder so a later sweep can reclaim the row.
    pub release: bool,
}

/// Durable task storage.
///
/// Implementations must run `claim` as one transaction: a bounded conditional
/// UPDATE followed by a read-back of the rows carrying the new lease holder.
pub trait TaskStore: Send + Sync + 'static {
    /// Apply pending schema migrations.
    fn migrate(&self) -> impl Future<Output = Result<()>> + Send;

    /// Simple round trip to the database.
    fn health_check(&self) -> impl Future<Output = Result<()>> + Send;

    fn insert(&self, task: &Task) -> impl Future<Output = Result<u64>> + Send;

    fn get(&self, id: TaskId) -> impl Future<Output = Result<Option<Task>>> + Send;

    /// Lease up to `claim.limit` eligible rows of a group, oldest first.
    fn claim(&self, claim: &Claim) -> impl Future<Output = Result<Vec<Task>>> + Send;

    /// Delete a row still held by `locker`. Returns rows affected.
    fn delete(&self, id: TaskId, locker: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Record a failed attempt on a row still held by `failure.locker`.
    fn record_failure(&self, failure: &Failure) -> impl Future<Output = Result<u64>> + Send;

    /// Outstanding rows of a group, oldest first.
    fn list(&self, group: i32, limit: i64) -> impl Future<Output = Result<Vec<Task>>> + Send;
}

/// Which SQL backend a database URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Backend::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else {
            Err(Error::Config(format!(
                "unsupported database url scheme: {}",
                url.split(':').next().unwrap_or_default()
            )))
        }
    }
}

/// Column list shared by every SELECT, in `TaskRow` order.
pub(crate) const TASK_COLUMNS: &str =
    "id, created_at, task_group, name, args, retries, locker, last_error, lock_expire, exec_time";

/// Internal row type for sqlx::FromRow. Timestamps are unix seconds.
#[derive(sqlx::FromRow)]
pub(crate) struct TaskRow {
    id: String,
    created_at: i64,
    task_group: i32,
    name: String,
    args: String,
    retries: i64,
    locker: String,
    last_error: String,
    lock_expire: i64,
    exec_time: i64,
}

impl TaskRow {
    pub(crate) fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id.parse()?,
            created_at: from_unix(self.created_at)?,
            group: self.task_group,
            name: self.name,
            args: self.args,
            retries: self.retries,
            locker: self.locker,
            last_error: self.last_error,
            lock_expire: from_unix(self.lock_expire)?,
            exec_time: match self.exec_time {
                0 => None,
                secs => Some(from_unix(secs)?),
            },
        })
    }
}

pub(crate) fn rows_into_tasks(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(TaskRow::try_into_task).collect()
}

fn from_unix(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Other(format!("timestamp out of range: {secs}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_follows_url_scheme() {
        assert_eq!(
            Backend::from_url("postgres://u:p@localhost/db").unwrap(),
            Backend::Postgres
        );
        assert_eq!(
            Backend::from_url("postgresql://localhost/db").unwrap(),
            Backend::Postgres
        );
        assert_eq!(
            Backend::from_url("sqlite::memory:").unwrap(),
            Backend::Sqlite
        );
        assert!(matches!(
            Backend::from_url("mysql://localhost/db"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn zero_exec_time_maps_to_never() {
        let row = TaskRow {
            id: TaskId::new().to_string(),
            created_at: 1_700_000_000,
            task_group: 2,
            name: "A".to_string(),
            args: "{}".to_string(),
            retries: 1,
            locker: String::new(),
            last_error: "boom".to_string(),
            lock_expire: 1_700_000_010,
            exec_time: 0,
        };
        let task = row.try_into_task().unwrap();
        assert_eq!(task.group, 2);
        assert!(task.exec_time.is_none());
        assert_eq!(task.lock_expire.timestamp(), 1_700_000_010);
    }

    #[test]
    fn malformed_id_is_rejected() {
        let row = TaskRow {
            id: "not-a-uuid".to_string(),
            created_at: 0,
            task_group: 0,
            name: String::new(),
            args: String::new(),
            retries: 0,
            locker: String::new(),
            last_error: String::new(),
            lock_expire: 0,
            exec_time: 0,
        };
        assert!(row.try_into_task().is_err());
    }
}
