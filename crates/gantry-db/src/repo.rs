//! Repository traits.
//!
//! Each trait covers one entity. A [`Transaction`] implements all of them, so
//! a scheduler operation reads and writes every table it touches atomically.

pub mod commit_status;
pub mod job;
pub mod repository;
pub mod run;
pub mod runner;
pub mod schedule;
pub mod task;

use async_trait::async_trait;

use crate::DbResult;

pub use commit_status::CommitStatusRepo;
pub use job::{JobFilter, JobGuard, JobRepo};
pub use repository::RepositoryRepo;
pub use run::{RunFilter, RunRepo};
pub use runner::RunnerRepo;
pub use schedule::{DueSpec, ScheduleRepo};
pub use task::{TaskFilter, TaskRepo};

/// One unit of atomic work. Dropping a transaction without calling
/// [`Transaction::commit`] discards its writes.
#[async_trait]
pub trait Transaction:
    RunRepo + JobRepo + TaskRepo + RunnerRepo + ScheduleRepo + RepositoryRepo + CommitStatusRepo + Send
{
    async fn commit(self: Box<Self>) -> DbResult<()>;
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>>;
}
