//! Core data model.
//!
//! A task is a unit of work that must eventually succeed. It lives as a row
//! until an execution attempt succeeds; the row's absence is the success
//! signal. Lease bookkeeping (`locker`, `lock_expire`, `retries`) decides
//! which worker may run it next.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A persisted compensation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned at creation.
    pub id: TaskId,

    pub created_at: DateTime<Utc>,

    /// Partition key. Sweeps claim within a single group.
    pub group: i32,

    /// Name of the executor that runs this task.
    pub name: String,

    /// Opaque payload handed to the executor. Usually JSON.
    pub args: String,

    /// Number of times a sweep has claimed this task.
    pub retries: i64,

    /// Current lease holder. Empty means unclaimed.
    pub locker: String,

    /// Message of the most recent failed attempt.
    pub last_error: String,

    /// The lease is stale after this instant.
    pub lock_expire: DateTime<Utc>,

    /// When the last attempt was finalized, if ever.
    pub exec_time: Option<DateTime<Utc>>,
}

impl Task {
    /// Build the row for a direct submission. The submitter owns the task
    /// from the start, so it carries a fresh lease holder and expiry.
    pub fn submitted(new: NewTask, now: DateTime<Utc>, lease: Duration) -> Result<Self> {
        Ok(Self {
            id: TaskId::new(),
            created_at: now,
            group: new.group,
            name: new.name,
            args: new.args,
            retries: 0,
            locker: Uuid::new_v4().to_string(),
            last_error: String::new(),
            lock_expire: lease_expiry(now, lease)?,
            exec_time: None,
        })
    }

    /// Parse `args` as a non-empty JSON object.
    pub fn params(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let params: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&self.args).map_err(|e| Error::InvalidParams(e.to_string()))?;
        if params.is_empty() {
            return Err(Error::InvalidParams("params not enough".to_string()));
        }
        Ok(params)
    }

    /// Deserialize `args` into a typed value.
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.args).map_err(|e| Error::InvalidParams(e.to_string()))
    }

    /// Time left on the current lease, zero once it has expired.
    pub fn remaining_lease(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.lock_expire - now).to_std().unwrap_or_default()
    }

    /// Whether a sweep over `group` at `now` may claim this task.
    pub fn is_claimable(&self, group: i32, now: DateTime<Utc>) -> bool {
        self.group == group && self.lock_expire < now && self.locker.is_empty()
    }
}

/// `now + lease`, or an error when the instant is out of range.
pub fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(lease)
        .ok_or_else(|| Error::Other(format!("lease of {lease} from {now} is out of range")))
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|e| Error::Other(format!("invalid task id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting new tasks.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) name: String,
    pub(crate) group: i32,
    pub(crate) args: String,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: 0,
            args: String::new(),
        }
    }

    pub fn group(mut self, group: i32) -> Self {
        self.group = group;
        self
    }

    pub fn args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    /// Serialize `value` as the task's JSON args.
    pub fn json_args<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.args = serde_json::to_string(value)
            .map_err(|e| Error::InvalidParams(format!("serialize args: {e}")))?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn task_with_args(args: &str) -> Task {
        Task::submitted(NewTask::new("A").args(args), at(1_000), Duration::seconds(10)).unwrap()
    }

    #[test]
    fn submitted_task_is_owned_by_its_submitter() {
        let task = Task::submitted(
            NewTask::new("A").group(3).args("{}"),
            at(1_000),
            Duration::seconds(15),
        ).unwrap();
        assert_eq!(task.group, 3);
        assert_eq!(task.retries, 0);
        assert!(!task.locker.is_empty());
        assert_eq!(task.lock_expire, at(1_015));
        assert!(task.exec_time.is_none());
        assert!(task.last_error.is_empty());
    }

    #[test]
    fn lease_past_the_calendar_is_an_error() {
        let err = Task::submitted(NewTask::new("A"), at(1_000), Duration::days(365 * 1_000_000)).unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(lease_expiry(at(1_000), Duration::seconds(5)).is_ok());
    }

    #[test]
    fn params_parses_a_non_empty_object() {
        let params = task_with_args(r#"{"k":1}"#).params().unwrap();
        assert_eq!(params["k"], json!(1));
    }

    #[test]
    fn params_rejects_empty_object() {
        let err = task_with_args("{}").params().unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn params_rejects_non_json() {
        let err = task_with_args("not json").params().unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn args_as_deserializes_typed_payload() {
        #[derive(Deserialize)]
        struct Refund {
            order: u32,
        }
        let refund: Refund = task_with_args(r#"{"order":42}"#).args_as().unwrap();
        assert_eq!(refund.order, 42);
    }

    #[test]
    fn claimable_requires_group_expiry_and_no_holder() {
        let mut task = task_with_args("{}");
        // Still held by the submitter.
        assert!(!task.is_claimable(0, at(2_000)));

        task.locker.clear();
        assert!(task.is_claimable(0, at(2_000)));
        assert!(!task.is_claimable(1, at(2_000)));
        // Lease not yet expired.
        assert!(!task.is_claimable(0, at(1_005)));
        // Expiry is strict.
        assert!(!task.is_claimable(0, at(1_010)));
    }

    #[test]
    fn remaining_lease_saturates_at_zero() {
        let task = task_with_args("{}");
        assert_eq!(task.remaining_lease(at(1_004)).as_secs(), 6);
        assert_eq!(task.remaining_lease(at(5_000)).as_secs(), 0);
    }

    #[test]
    fn task_id_round_trips_through_display() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("nope".parse::<TaskId>().is_err());
    }
}
