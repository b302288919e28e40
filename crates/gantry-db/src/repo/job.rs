//! Run job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::run::{NewRunJob, Run, RunJob};
use gantry_core::runner::RunnerScope;
use gantry_core::{JobId, OwnerId, RepoId, RunId, RunnerId, Status, TaskId};

use crate::pg::{PgTransaction, decode};
use crate::{DbError, DbResult};

/// Condition a job row must still satisfy for [`JobRepo::update_job`] to
/// write it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobGuard {
    /// Write unconditionally.
    Always,
    /// No task assigned yet.
    Unassigned,
    /// Waiting with no task assigned: the dispatch claim.
    Claimable,
    /// Still in the given status.
    StatusIs(Status),
    /// Still bound to the given task.
    AssignedTo(TaskId),
}

impl JobGuard {
    pub fn admits(&self, stored: &RunJob) -> bool {
        let (status, unassigned, task) = self.conditions();
        status.is_none_or(|s| stored.status == s)
            && (!unassigned || stored.task_id.is_none())
            && task.is_none_or(|t| stored.task_id == Some(t))
    }

    /// Required status, whether the task must still be unassigned, and the
    /// task the job must still be bound to.
    fn conditions(self) -> (Option<Status>, bool, Option<TaskId>) {
        match self {
            JobGuard::Always => (None, false, None),
            JobGuard::Unassigned => (None, true, None),
            JobGuard::Claimable => (Some(Status::Waiting), true, None),
            JobGuard::StatusIs(status) => (Some(status), false, None),
            JobGuard::AssignedTo(task) => (None, false, Some(task)),
        }
    }
}

/// Criteria for [`JobRepo::find_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub run_id: Option<RunId>,
    pub statuses: Vec<Status>,
    pub updated_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobRepo: Send {
    async fn insert_jobs(
        &mut self,
        run: &Run,
        jobs: &[NewRunJob],
        now: DateTime<Utc>,
    ) -> DbResult<Vec<RunJob>>;
    async fn get_job(&mut self, id: JobId) -> DbResult<RunJob>;
    /// Jobs of a run in insertion order.
    async fn jobs_of_run(&mut self, run_id: RunId) -> DbResult<Vec<RunJob>>;
    async fn find_jobs(&mut self, filter: &JobFilter) -> DbResult<Vec<RunJob>>;
    /// Waiting, unassigned jobs visible to `scope`, oldest first.
    async fn waiting_jobs(&mut self, scope: RunnerScope) -> DbResult<Vec<RunJob>>;
    /// Write the mutable columns of `job` if the stored row satisfies `guard`.
    /// Returns the number of rows written.
    async fn update_job(&mut self, job: &RunJob, guard: JobGuard) -> DbResult<u64>;
}

/// A run job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub run_id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub commit_sha: String,
    pub job_id: String,
    pub name: String,
    pub payload: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub task_id: Option<i64>,
    pub runner_id: Option<i64>,
    pub attempt: i64,
    pub status: String,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl TryFrom<JobRecord> for RunJob {
    type Error = DbError;

    fn try_from(r: JobRecord) -> DbResult<Self> {
        Ok(RunJob {
            id: JobId::new(r.id),
            run_id: RunId::new(r.run_id),
            repo_id: RepoId::new(r.repo_id),
            owner_id: OwnerId::new(r.owner_id),
            commit_sha: r.commit_sha,
            job_id: r.job_id,
            name: r.name,
            payload: r.payload,
            needs: r.needs,
            runs_on: r.runs_on,
            task_id: r.task_id.map(TaskId::new),
            runner_id: r.runner_id.map(RunnerId::new),
            attempt: r.attempt,
            status: decode("run_jobs.status", &r.status)?,
            started: r.started,
            stopped: r.stopped,
            created: r.created,
            updated: r.updated,
        })
    }
}

#[async_trait]
impl JobRepo for PgTransaction {
    async fn insert_jobs(
        &mut self,
        run: &Run,
        jobs: &[NewRunJob],
        now: DateTime<Utc>,
    ) -> DbResult<Vec<RunJob>> {
        let mut inserted = Vec::with_capacity(jobs.len());
        for job in jobs {
            let record = sqlx::query_as::<_, JobRecord>(
                r#"
                INSERT INTO run_jobs (run_id, repo_id, owner_id, commit_sha, job_id, name, payload,
                                      needs, runs_on, status, created, updated)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
                RETURNING *
                "#,
            )
            .bind(run.id.get())
            .bind(run.repo_id.get())
            .bind(run.owner_id.get())
            .bind(&run.commit_sha)
            .bind(&job.job_id)
            .bind(&job.name)
            .bind(&job.payload)
            .bind(&job.needs)
            .bind(&job.runs_on)
            .bind(job.status.as_str())
            .bind(now)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| {
                crate::pg::unique_violation(e, format!("job '{}' of run {}", job.job_id, run.id))
            })?;
            inserted.push(record.try_into()?);
        }
        Ok(inserted)
    }

    async fn get_job(&mut self, id: JobId) -> DbResult<RunJob> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM run_jobs WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?
            .try_into()
    }

    async fn jobs_of_run(&mut self, run_id: RunId) -> DbResult<Vec<RunJob>> {
        let records =
            sqlx::query_as::<_, JobRecord>("SELECT * FROM run_jobs WHERE run_id = $1 ORDER BY id")
                .bind(run_id.get())
                .fetch_all(&mut *self.tx)
                .await?;
        records.into_iter().map(RunJob::try_from).collect()
    }

    async fn find_jobs(&mut self, filter: &JobFilter) -> DbResult<Vec<RunJob>> {
        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM run_jobs
            WHERE ($1::bigint IS NULL OR run_id = $1)
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
              AND ($3::timestamptz IS NULL OR updated < $3)
            ORDER BY id
            "#,
        )
        .bind(filter.run_id.map(RunId::get))
        .bind(statuses)
        .bind(filter.updated_before)
        .fetch_all(&mut *self.tx)
        .await?;
        records.into_iter().map(RunJob::try_from).collect()
    }

    async fn waiting_jobs(&mut self, scope: RunnerScope) -> DbResult<Vec<RunJob>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM run_jobs
            WHERE status = 'waiting' AND task_id IS NULL
              AND ($1::bigint IS NULL OR owner_id = $1)
              AND ($2::bigint IS NULL OR repo_id = $2)
            ORDER BY created, id
            "#,
        )
        .bind(scope.owner_id().map(OwnerId::get))
        .bind(scope.repo_id().map(RepoId::get))
        .fetch_all(&mut *self.tx)
        .await?;
        records.into_iter().map(RunJob::try_from).collect()
    }

    async fn update_job(&mut self, job: &RunJob, guard: JobGuard) -> DbResult<u64> {
        let (status, unassigned, task) = guard.conditions();
        let result = sqlx::query(
            r#"
            UPDATE run_jobs
            SET task_id = $2, runner_id = $3, attempt = $4, status = $5, started = $6,
                stopped = $7, updated = $8
            WHERE id = $1
              AND ($9::text IS NULL OR status = $9)
              AND (NOT $10 OR task_id IS NULL)
              AND ($11::bigint IS NULL OR task_id = $11)
            "#,
        )
        .bind(job.id.get())
        .bind(job.task_id.map(TaskId::get))
        .bind(job.runner_id.map(RunnerId::get))
        .bind(job.attempt)
        .bind(job.status.as_str())
        .bind(job.started)
        .bind(job.stopped)
        .bind(job.updated)
        .bind(status.map(Status::as_str))
        .bind(unassigned)
        .bind(task.map(TaskId::get))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }
}
