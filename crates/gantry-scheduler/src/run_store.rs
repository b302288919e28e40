//! Persistence and identity of runs and their jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gantry_core::run::{JobDescriptor, NewRun, Run, RunJob, plan_rerun};
use gantry_core::{Error, JobId, RepoId, Result, RunId, Status, TriggerEvent, UserId};
use gantry_db::{Database, JobGuard, Transaction};
use tracing::info;

use crate::commit_status::CommitStatusProjector;
use crate::jobs::{resolve_run_jobs, sync_run_status};
use crate::materializer::materialize;
use crate::notifier::TaskNotifier;

/// A freshly inserted run.
#[derive(Debug, Clone)]
pub struct InsertedRun {
    pub run: Run,
    pub jobs: Vec<RunJob>,
    /// At least one job can be dispatched right away.
    pub has_waiting: bool,
}

#[derive(Clone)]
pub struct RunStore {
    db: Arc<dyn Database>,
    notifier: TaskNotifier,
    statuses: CommitStatusProjector,
}

impl RunStore {
    pub fn new(
        db: Arc<dyn Database>,
        notifier: TaskNotifier,
        statuses: CommitStatusProjector,
    ) -> Self {
        Self {
            db,
            notifier,
            statuses,
        }
    }

    /// Insert a run with the next index of its repository and one job per
    /// descriptor.
    pub async fn insert_run(
        &self,
        run: &NewRun,
        descriptors: &[JobDescriptor],
    ) -> Result<InsertedRun> {
        let mut tx = self.db.begin().await?;
        let inserted = insert_run_in(tx.as_mut(), run, descriptors, Utc::now()).await?;
        tx.commit().await?;

        if inserted.has_waiting {
            self.notifier.notify();
        }
        info!(
            run_id = %inserted.run.id,
            repo_id = %inserted.run.repo_id,
            index = inserted.run.index,
            jobs = inserted.jobs.len(),
            "Inserted run"
        );
        self.statuses.project(&job_ids(&inserted.jobs)).await;
        Ok(inserted)
    }

    pub async fn get_run(&self, id: RunId) -> Result<Run> {
        let mut tx = self.db.begin().await?;
        Ok(tx.get_run(id).await?)
    }

    pub async fn get_latest_run(&self, repo_id: RepoId) -> Result<Run> {
        let mut tx = self.db.begin().await?;
        Ok(tx.latest_run(repo_id).await?)
    }

    /// The run that stopped most recently, strictly before `before`.
    pub async fn get_run_before(&self, repo_id: RepoId, before: DateTime<Utc>) -> Result<Run> {
        let mut tx = self.db.begin().await?;
        Ok(tx.run_before(repo_id, before).await?)
    }

    pub async fn get_run_by_index(&self, repo_id: RepoId, index: i64) -> Result<Run> {
        let mut tx = self.db.begin().await?;
        Ok(tx.get_run_by_index(repo_id, index).await?)
    }

    /// Latest run of a workflow, optionally narrowed to a ref and an event.
    pub async fn latest_run_for(
        &self,
        repo_id: RepoId,
        git_ref: Option<&str>,
        workflow_id: &str,
        event: Option<TriggerEvent>,
    ) -> Result<Run> {
        let mut tx = self.db.begin().await?;
        Ok(tx
            .latest_run_for(repo_id, git_ref, workflow_id, event)
            .await?)
    }

    pub async fn jobs_of_run(&self, run_id: RunId) -> Result<Vec<RunJob>> {
        let mut tx = self.db.begin().await?;
        Ok(tx.jobs_of_run(run_id).await?)
    }

    /// Write `run` if its stored version is still `expected_version`.
    pub async fn update_run(&self, run: &Run, expected_version: i32) -> Result<Run> {
        let mut tx = self.db.begin().await?;
        let stored = update_run_in(tx.as_mut(), run, expected_version).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// Record the approver of a run and release its approval-blocked jobs.
    pub async fn approve_run(&self, run_id: RunId, approver: UserId) -> Result<Run> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let mut run = tx.get_run(run_id).await?;
        if !run.approval_pending() {
            return Err(Error::InvalidInput(format!(
                "run {} is not waiting for approval",
                run_id
            )));
        }
        let version = run.version;
        run.approved_by = Some(approver);
        run.updated = now;
        let mut run = update_run_in(tx.as_mut(), &run, version).await?;

        let mut jobs = tx.jobs_of_run(run_id).await?;
        let released = resolve_run_jobs(tx.as_mut(), &run, &mut jobs, now).await?;
        sync_run_status(tx.as_mut(), &mut run, &jobs, now).await?;
        tx.commit().await?;

        if released.woke {
            self.notifier.notify();
        }
        info!(run_id = %run_id, approver = %approver, released = released.changed.len(), "Approved run");
        self.statuses.project(&released.changed).await;
        Ok(run)
    }

    /// Re-run a finished run: every job, or `job_id` plus every job that
    /// transitively needs it.
    pub async fn rerun(&self, run_id: RunId, job_id: Option<&str>) -> Result<Run> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let mut run = tx.get_run(run_id).await?;
        if !run.status.is_done() {
            return Err(Error::InvalidInput(format!(
                "run {} is still in progress",
                run_id
            )));
        }
        let mut jobs = tx.jobs_of_run(run_id).await?;
        if let Some(target) = job_id {
            if !jobs.iter().any(|j| j.job_id == target) {
                return Err(Error::NotFound(format!("job '{}' of run {}", target, run_id)));
            }
        }

        let plan = plan_rerun(&jobs, job_id, run.approval_pending());
        let mut changed = Vec::with_capacity(plan.len());
        for (id, status) in plan {
            let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
                continue;
            };
            let previous = job.status;
            job.status = status;
            job.task_id = None;
            job.runner_id = None;
            job.started = None;
            job.stopped = None;
            job.updated = now;
            if tx.update_job(job, JobGuard::StatusIs(previous)).await? == 0 {
                return Err(Error::ConcurrentModification(format!(
                    "job {} has changed",
                    id
                )));
            }
            changed.push(id);
        }

        let version = run.version;
        run.previous_duration_secs = run.duration(now).num_seconds();
        run.started = None;
        run.stopped = None;
        run.status = Status::aggregate(jobs.iter().map(|j| j.status));
        run.updated = now;
        let run = update_run_in(tx.as_mut(), &run, version).await?;
        tx.commit().await?;

        if jobs.iter().any(|j| j.status == Status::Waiting) {
            self.notifier.notify();
        }
        info!(run_id = %run_id, job = job_id.unwrap_or("*"), jobs = changed.len(), "Re-ran run");
        self.statuses.project(&changed).await;
        Ok(run)
    }
}

/// Insert a run and its jobs inside `tx` and refresh the repository's run
/// counters.
pub(crate) async fn insert_run_in(
    tx: &mut dyn Transaction,
    run: &NewRun,
    descriptors: &[JobDescriptor],
    now: DateTime<Utc>,
) -> Result<InsertedRun> {
    let materialized = materialize(descriptors, run.needs_approval)?;
    let index = tx.next_run_index(run.repo_id).await?;
    let status = Status::aggregate(materialized.jobs.iter().map(|j| j.status));
    let stored = tx.insert_run(run, index, status, now).await?;
    let jobs = tx.insert_jobs(&stored, &materialized.jobs, now).await?;
    tx.recompute_run_counters(run.repo_id).await?;

    Ok(InsertedRun {
        run: stored,
        jobs,
        has_waiting: materialized.has_waiting,
    })
}

/// Version-checked run write followed by a counter refresh.
pub(crate) async fn update_run_in(
    tx: &mut dyn Transaction,
    run: &Run,
    expected_version: i32,
) -> Result<Run> {
    let stored = tx.update_run(run, expected_version).await?;
    tx.recompute_run_counters(run.repo_id).await?;
    Ok(stored)
}

pub(crate) fn job_ids(jobs: &[RunJob]) -> Vec<JobId> {
    jobs.iter().map(|j| j.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::repository::NewRepository;
    use gantry_core::{OwnerId, TriggerEvent};
    use gantry_db::MemoryDatabase;

    fn descriptor(id: &str, needs: &[&str]) -> JobDescriptor {
        JobDescriptor {
            job_id: id.to_string(),
            name: id.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            runs_on: vec!["ubuntu".to_string()],
            payload: "{}".to_string(),
        }
    }

    async fn store() -> (RunStore, RepoId) {
        let db = Arc::new(MemoryDatabase::new());
        let mut tx = db.begin().await.unwrap();
        let repo = tx
            .insert_repository(&NewRepository {
                owner_id: OwnerId::new(1),
                owner_name: "acme".to_string(),
                name: "widgets".to_string(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let statuses = CommitStatusProjector::new(db.clone(), "http://ci.test".to_string());
        (RunStore::new(db, TaskNotifier::new(), statuses), repo.id)
    }

    fn new_run(repo_id: RepoId, needs_approval: bool) -> NewRun {
        NewRun {
            repo_id,
            owner_id: OwnerId::new(1),
            workflow_id: "ci.kdl".to_string(),
            trigger_user_id: UserId::new(7),
            git_ref: "refs/heads/main".to_string(),
            commit_sha: "abc123".to_string(),
            event: TriggerEvent::Push,
            trigger_event: TriggerEvent::Push,
            event_payload: "{}".to_string(),
            needs_approval,
        }
    }

    #[tokio::test]
    async fn test_indexes_increase_per_repository() {
        let (store, repo_id) = store().await;
        let first = store
            .insert_run(&new_run(repo_id, false), &[descriptor("a", &[])])
            .await
            .unwrap();
        let second = store
            .insert_run(&new_run(repo_id, false), &[descriptor("a", &[])])
            .await
            .unwrap();

        assert_eq!(first.run.index + 1, second.run.index);
        assert!(first.has_waiting);
        assert_eq!(store.get_latest_run(repo_id).await.unwrap().id, second.run.id);
        assert_eq!(
            store.get_run_by_index(repo_id, first.run.index).await.unwrap().id,
            first.run.id
        );
    }

    #[tokio::test]
    async fn test_dangling_need_inserts_nothing() {
        let (store, repo_id) = store().await;
        let err = store
            .insert_run(&new_run(repo_id, false), &[descriptor("a", &["missing"])])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidWorkflow(_)));
        assert!(matches!(
            store.get_latest_run(repo_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (store, repo_id) = store().await;
        let inserted = store
            .insert_run(&new_run(repo_id, false), &[descriptor("a", &[])])
            .await
            .unwrap();
        let version = inserted.run.version;

        let updated = store.update_run(&inserted.run, version).await.unwrap();
        assert_eq!(updated.version, version + 1);

        let err = store.update_run(&inserted.run, version).await.unwrap_err();
        assert!(err.is_concurrent_modification());
    }

    #[tokio::test]
    async fn test_approval_releases_jobs_without_needs() {
        let (store, repo_id) = store().await;
        let inserted = store
            .insert_run(
                &new_run(repo_id, true),
                &[descriptor("a", &[]), descriptor("b", &["a"])],
            )
            .await
            .unwrap();
        assert!(!inserted.has_waiting);
        assert_eq!(inserted.run.status, Status::Blocked);

        let run = store.approve_run(inserted.run.id, UserId::new(9)).await.unwrap();
        assert_eq!(run.approved_by, Some(UserId::new(9)));
        assert_eq!(run.status, Status::Waiting);

        let jobs = store.jobs_of_run(run.id).await.unwrap();
        assert_eq!(jobs[0].status, Status::Waiting);
        assert_eq!(jobs[1].status, Status::Blocked);

        assert!(store.approve_run(run.id, UserId::new(9)).await.is_err());
    }

    #[tokio::test]
    async fn test_rerun_requires_finished_run() {
        let (store, repo_id) = store().await;
        let inserted = store
            .insert_run(&new_run(repo_id, false), &[descriptor("a", &[])])
            .await
            .unwrap();

        let err = store.rerun(inserted.run.id, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
