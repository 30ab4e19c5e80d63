//! # compensator-rs
//!
//! Durable, at-least-once task compensation backed by a SQL store.
//!
//! Tasks are persisted before they run. A worker holds a task through a
//! lease (`locker` + `lock_expire`) while its executor runs in a sandbox
//! with a timeout and panic containment. Success deletes the row; failure
//! records the error, and periodic sweeps claim expired tasks and run them
//! again until they succeed.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod model;
pub mod sandbox;
pub mod sweeper;
pub mod telemetry;

pub use engine::{Compensator, EngineConfig, Execution, Submission};
pub use error::{Error, Result};
pub use executor::{ExecContext, Executor, ExecutorRegistry};
pub use model::{NewTask, Task, TaskId};
