//! Core domain types and rules for the Gantry workflow run scheduler.
//!
//! This crate contains:
//! - Typed identifiers for runs, jobs, tasks, runners and schedules
//! - The shared job/run status machine and its aggregation rules
//! - Trigger-event kinds and their behaviour table
//! - Run, RunJob, Task and Runner entities
//! - Cron schedule specs
//! - The error taxonomy shared by every layer above storage

pub mod commit_status;
pub mod credential;
pub mod error;
pub mod event;
pub mod id;
pub mod repository;
pub mod run;
pub mod runner;
pub mod schedule;
pub mod secret;
pub mod status;
pub mod task;

pub use error::{Error, Result};
pub use event::TriggerEvent;
pub use id::{JobId, OwnerId, RepoId, RunId, RunnerId, ScheduleId, SpecId, StepId, TaskId, UserId};
pub use status::Status;
