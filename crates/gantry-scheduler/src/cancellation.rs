//! Cancelling superseded and abandoned work.
//!
//! Undispatched jobs are cancelled immediately with a write that only holds
//! while the job still has no task. Dispatched jobs are cancelled by stopping
//! their task; the runner learns about it on its next report.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gantry_core::run::RunJob;
use gantry_core::{Error, JobId, RepoId, Result, RunId, Status, TriggerEvent};
use gantry_db::{Database, JobGuard, RunFilter, Transaction};
use tracing::info;

use crate::commit_status::CommitStatusProjector;
use crate::jobs::{JobUpdate, Propagation, update_run_job};
use crate::notifier::TaskNotifier;
use crate::task_state::stop_task_in;

const OPEN: [Status; 3] = [Status::Waiting, Status::Blocked, Status::Running];

#[derive(Clone)]
pub struct CancellationEngine {
    db: Arc<dyn Database>,
    notifier: TaskNotifier,
    statuses: CommitStatusProjector,
}

impl CancellationEngine {
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

    /// Cancel every open job of every open run of `workflow_id` on `git_ref`
    /// that was triggered by `trigger_event`. Returns the jobs written.
    pub async fn cancel_previous_jobs(
        &self,
        repo_id: RepoId,
        git_ref: &str,
        workflow_id: &str,
        trigger_event: TriggerEvent,
    ) -> Result<Vec<JobId>> {
        let mut tx = self.db.begin().await?;
        let update = cancel_previous_jobs_in(
            tx.as_mut(),
            repo_id,
            git_ref,
            workflow_id,
            trigger_event,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;
        self.finish(update).await
    }

    /// Cancel every open job of one run.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<Vec<JobId>> {
        let mut tx = self.db.begin().await?;
        let update = cancel_jobs_in(tx.as_mut(), run_id, Utc::now()).await?;
        tx.commit().await?;
        info!(run_id = %run_id, jobs = update.changed.len(), "Cancelled run");
        self.finish(update).await
    }

    /// Conditionally cancel one undispatched job. Fails with a concurrent
    /// modification error when the job was dispatched in the meantime.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Vec<JobId>> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let job = tx.get_job(job_id).await?;
        let update = cancel_job_in(tx.as_mut(), job, now).await?;
        tx.commit().await?;
        self.finish(update).await
    }

    async fn finish(&self, update: JobUpdate) -> Result<Vec<JobId>> {
        if update.woke {
            self.notifier.notify();
        }
        self.statuses.project(&update.changed).await;
        Ok(update.changed)
    }
}

pub(crate) async fn cancel_previous_jobs_in(
    tx: &mut dyn Transaction,
    repo_id: RepoId,
    git_ref: &str,
    workflow_id: &str,
    trigger_event: TriggerEvent,
    now: DateTime<Utc>,
) -> Result<JobUpdate> {
    let runs = tx
        .find_runs(&RunFilter {
            repo_id: Some(repo_id),
            git_ref: Some(git_ref.to_string()),
            workflow_id: Some(workflow_id.to_string()),
            trigger_event: Some(trigger_event),
            statuses: OPEN.to_vec(),
        })
        .await?;

    let mut update = JobUpdate::default();
    for run in runs {
        update.absorb(cancel_jobs_in(tx, run.id, now).await?);
        info!(run_id = %run.id, workflow = %workflow_id, git_ref = %git_ref, "Cancelled superseded run");
    }
    Ok(update)
}

/// Cancel the open jobs of one run. Finished jobs are left alone.
pub(crate) async fn cancel_jobs_in(
    tx: &mut dyn Transaction,
    run_id: RunId,
    now: DateTime<Utc>,
) -> Result<JobUpdate> {
    let mut update = JobUpdate::default();
    for job in tx.jobs_of_run(run_id).await? {
        if job.status.is_done() {
            continue;
        }
        update.absorb(cancel_job_in(tx, job, now).await?);
    }
    Ok(update)
}

/// Cancel one job: conditionally while it has no task, through its task
/// otherwise.
pub(crate) async fn cancel_job_in(
    tx: &mut dyn Transaction,
    mut job: RunJob,
    now: DateTime<Utc>,
) -> Result<JobUpdate> {
    if job.status.is_done() {
        return Ok(JobUpdate::default());
    }

    match job.task_id {
        None => {
            job.status = Status::Cancelled;
            job.stopped = Some(now);
            job.updated = now;
            let update = update_run_job(
                tx,
                &job,
                JobGuard::Unassigned,
                Propagation::AggregateOnly,
                now,
            )
            .await?;
            if update.rows == 0 {
                return Err(Error::ConcurrentModification(
                    "job has changed, try again".to_string(),
                ));
            }
            Ok(update)
        }
        Some(task_id) => Ok(
            stop_task_in(tx, task_id, Status::Cancelled, now, Propagation::AggregateOnly)
                .await?
                .unwrap_or_default(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::repository::NewRepository;
    use gantry_core::run::{JobDescriptor, NewRun};
    use gantry_core::{OwnerId, UserId};
    use gantry_db::MemoryDatabase;

    use crate::run_store::insert_run_in;

    async fn seed(db: &MemoryDatabase, trigger_event: TriggerEvent) -> RunId {
        let mut tx = db.begin().await.unwrap();
        let repo_id = RepoId::new(1);
        if tx.get_repository(repo_id).await.is_err() {
            tx.insert_repository(&NewRepository {
                owner_id: OwnerId::new(1),
                owner_name: "acme".to_string(),
                name: "widgets".to_string(),
            })
            .await
            .unwrap();
        }
        let descriptor = |id: &str, needs: &[&str]| JobDescriptor {
            job_id: id.to_string(),
            name: id.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            runs_on: vec!["ubuntu".to_string()],
            payload: "{}".to_string(),
        };
        let inserted = insert_run_in(
            tx.as_mut(),
            &NewRun {
                repo_id,
                owner_id: OwnerId::new(1),
                workflow_id: "nightly.kdl".to_string(),
                trigger_user_id: UserId::new(1),
                git_ref: "refs/heads/main".to_string(),
                commit_sha: "abc123".to_string(),
                event: TriggerEvent::Push,
                trigger_event,
                event_payload: "{}".to_string(),
                needs_approval: false,
            },
            &[descriptor("a", &[]), descriptor("b", &["a"])],
            Utc::now(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        inserted.run.id
    }

    fn engine(db: Arc<MemoryDatabase>) -> CancellationEngine {
        let statuses = CommitStatusProjector::new(db.clone(), "http://ci.test".to_string());
        CancellationEngine::new(db, TaskNotifier::new(), statuses)
    }

    #[tokio::test]
    async fn test_cancel_previous_matches_trigger_event() {
        let db = Arc::new(MemoryDatabase::new());
        let scheduled = seed(&db, TriggerEvent::Schedule).await;
        let pushed = seed(&db, TriggerEvent::Push).await;

        let changed = engine(db.clone())
            .cancel_previous_jobs(
                RepoId::new(1),
                "refs/heads/main",
                "nightly.kdl",
                TriggerEvent::Schedule,
            )
            .await
            .unwrap();
        assert_eq!(changed.len(), 2);

        let mut tx = db.begin().await.unwrap();
        let jobs = tx.jobs_of_run(scheduled).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == Status::Cancelled));
        assert_eq!(tx.get_run(scheduled).await.unwrap().status, Status::Cancelled);
        assert_eq!(tx.get_run(pushed).await.unwrap().status, Status::Waiting);
    }

    #[tokio::test]
    async fn test_cancel_run_leaves_finished_jobs() {
        let db = Arc::new(MemoryDatabase::new());
        let run_id = seed(&db, TriggerEvent::Push).await;

        let mut tx = db.begin().await.unwrap();
        let mut a = tx.jobs_of_run(run_id).await.unwrap().remove(0);
        a.status = Status::Success;
        tx.update_job(&a, JobGuard::Always).await.unwrap();
        tx.commit().await.unwrap();

        let changed = engine(db.clone()).cancel_run(run_id).await.unwrap();
        assert_eq!(changed.len(), 1);

        let mut tx = db.begin().await.unwrap();
        let jobs = tx.jobs_of_run(run_id).await.unwrap();
        assert_eq!(jobs[0].status, Status::Success);
        assert_eq!(jobs[1].status, Status::Cancelled);
    }

    #[tokio::test]
    async fn test_dispatched_job_reports_conflict() {
        let db = Arc::new(MemoryDatabase::new());
        let run_id = seed(&db, TriggerEvent::Push).await;

        let mut tx = db.begin().await.unwrap();
        let job = tx.jobs_of_run(run_id).await.unwrap().remove(0);
        let mut claimed = job.clone();
        claimed.task_id = Some(gantry_core::TaskId::new(77));
        tx.update_job(&claimed, JobGuard::Always).await.unwrap();

        let err = cancel_job_in(tx.as_mut(), job, Utc::now()).await.unwrap_err();
        assert!(err.is_concurrent_modification());
    }
}
