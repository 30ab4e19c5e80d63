//! Postgres task store.
//!
//! Concurrent claimers race on a bounded subselect taken with
//! `FOR UPDATE SKIP LOCKED`, so each eligible row lands in exactly one
//! claimer's UPDATE.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use super::{Claim, Failure, TASK_COLUMNS, TaskRow, TaskStore, rows_into_tasks};
use crate::error::Result;
use crate::model::{Task, TaskId};

/// Postgres handle. Owns the connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl TaskStore for PgStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, task: &Task) -> Result<u64> {
        let rows = sqlx::query(
            "INSERT INTO compensation_task (id, created_at, task_group, name, args, retries, locker, last_error, lock_expire, exec_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
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
            "SELECT {TASK_COLUMNS} FROM compensation_task WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    async fn claim(&self, claim: &Claim) -> Result<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE compensation_task
             SET locker = $1, lock_expire = $2, retries = retries + 1
             WHERE id IN (
                 SELECT id FROM compensation_task
                 WHERE task_group = $3 AND lock_expire < $4 AND locker = ''
                 ORDER BY created_at ASC
                 LIMIT $5
                 FOR UPDATE SKIP LOCKED
             )",
        )
        .bind(&claim.locker)
        .bind(claim.lock_expire.timestamp())
        .bind(claim.group)
        .bind(claim.now.timestamp())
        .bind(claim.limit)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM compensation_task WHERE locker = $1 ORDER BY created_at ASC"
        ))
        .bind(&claim.locker)
        .fetch_all(&mut *tx)
        .await?;

        // Dropping `tx` on an early return rolls the claim back.
        tx.commit().await?;

        debug!(group = claim.group, updated, locker = %claim.locker, "claimed tasks");
        rows_into_tasks(rows)
    }

    async fn delete(&self, id: TaskId, locker: &str) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM compensation_task WHERE id = $1 AND locker = $2")
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
             SET last_error = $1, exec_time = $2, locker = CASE WHEN $3 THEN '' ELSE locker END
             WHERE id = $4 AND locker = $5",
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
            "SELECT {TASK_COLUMNS} FROM compensation_task WHERE task_group = $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(group)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows_into_tasks(rows)
    }
}
