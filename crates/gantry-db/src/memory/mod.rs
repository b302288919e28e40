//! In-memory backend.
//!
//! All tables live behind one async mutex. A transaction holds the lock for
//! its whole lifetime and works on a private copy of the tables; commit swaps
//! the copy in, drop discards it. Transactions are therefore fully
//! serialised, which gives tests the same atomicity the PostgreSQL backend
//! gets from row locks and conditional updates.

mod commit_status;
mod job;
mod repository;
mod run;
mod runner;
mod schedule;
mod task;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use gantry_core::commit_status::CommitStatus;
use gantry_core::repository::Repository;
use gantry_core::run::{Run, RunJob};
use gantry_core::runner::Runner;
use gantry_core::schedule::{Schedule, ScheduleSpec};
use gantry_core::secret::{Secret, Variable};
use gantry_core::task::{Task, TaskStep};
use gantry_core::{JobId, RepoId, RunId, RunnerId, ScheduleId, SpecId, StepId, TaskId};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{Database, DbResult, Transaction};

#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    next_id: i64,
    repositories: BTreeMap<RepoId, Repository>,
    run_indexes: HashMap<RepoId, i64>,
    runs: BTreeMap<RunId, Run>,
    jobs: BTreeMap<JobId, RunJob>,
    tasks: BTreeMap<TaskId, Task>,
    steps: BTreeMap<StepId, TaskStep>,
    outputs: BTreeMap<TaskId, BTreeMap<String, String>>,
    runners: BTreeMap<RunnerId, Runner>,
    schedules: BTreeMap<ScheduleId, Schedule>,
    specs: BTreeMap<SpecId, ScheduleSpec>,
    secrets: Vec<Secret>,
    variables: Vec<Variable>,
    commit_statuses: Vec<CommitStatus>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A [`Database`] that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> DbResult<Box<dyn Transaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, staged }))
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> DbResult<()> {
        let MemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepositoryRepo;
    use gantry_core::OwnerId;
    use gantry_core::repository::NewRepository;

    fn new_repo() -> NewRepository {
        NewRepository {
            owner_id: OwnerId::new(1),
            owner_name: "acme".into(),
            name: "widgets".into(),
        }
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        let repo = tx.insert_repository(&new_repo()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        assert_eq!(tx.get_repository(repo.id).await.unwrap().name, "widgets");
    }

    #[tokio::test]
    async fn test_drop_discards_writes() {
        let db = MemoryDatabase::new();
        let repo_id = {
            let mut tx = db.begin().await.unwrap();
            tx.insert_repository(&new_repo()).await.unwrap().id
        };

        let mut tx = db.begin().await.unwrap();
        assert!(matches!(
            tx.get_repository(repo_id).await,
            Err(crate::DbError::NotFound(_))
        ));
    }
}
