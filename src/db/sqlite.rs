//! SQLite task store, for embedded deployments and tests.
//!
//! SQLite serializes writers per database, so the claim UPDATE needs no row
//! locking clause. An in-memory database lives only as long as its single
//! connection; `in_memory` pins the pool to one connection that never idles out.

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::{Claim, Failure, TASK_COLUMNS, TaskRow, TaskStore, rows_into_tasks};
use crate::error::Result;
use crate::model::{Task, TaskId};

/// SQLite handle. Owns the connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl TaskStore for SqliteStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, task: &Task) -> Result<u64> {
        let rows = sqlx::query(
            "INSERT INTO compensation_task (id, created_at, task_group, name, args, retries, locker, last_error, lock_expire, exec_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.created_at.timestamp())
        .bind(task.group)
        .bind(&task.name)
        .bind(&task.args)
        .bind(task.retries)
        .bind(&task.locker)
        .bind(&task.last_error)
        .bind(task.lock_expire.timestamp())
        .bind(task.exec_time.map_or(0, |t| t.timestamp()))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM compensation_task WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    async fn claim(&self, claim: &Claim) -> Result<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE compensation_task
             SET locker = ?, lock_expire = ?, retries = retries + 1
             WHERE id IN (
                 SELECT id FROM compensation_task
                 WHERE task_group = ? AND lock_expire < ? AND locker = ''
                 ORDER BY created_at ASC
                 LIMIT ?
             )",
        )
        .bind(&claim.locker)
        .bind(claim.lock_expire.timestamp())
        .bind(claim.group)
        .bind(claim.now.timestamp())
        .bind(claim.limit)
        .execute(&mut *tx)
        .await?;

        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM compensation_task WHERE locker = ? ORDER BY created_at ASC"
        ))
        .bind(&claim.locker)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        rows_into_tasks(rows)
    }

    async fn delete(&self, id: TaskId, locker: &str) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM compensation_task WHERE id = ? AND locker = ?")
            .bind(id.to_string())
            .bind(locker)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn record_failure(&self, failure: &Failure) -> Result<u64> {
        let rows = sqlx::query(
            "UPDATE compensation_task
             SET last_error = ?, exec_time = ?, locker = CASE WHEN ? THEN '' ELSE locker END
             WHERE id = ? AND locker = ?",
        )
        .bind(&failure.message)
        .bind(failure.exec_time.timestamp())
        .bind(failure.release)
        .bind(failure.id.to_string())
        .bind(&failure.locker)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows)
    }

    async fn list(&self, group: i32, limit: i64) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM compensation_task WHERE task_group = ? ORDER BY created_at ASC LIMIT ?"
        ))
        .bind(group)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows_into_tasks(rows)
    }
}
