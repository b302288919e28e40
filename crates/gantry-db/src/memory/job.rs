use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::run::{NewRunJob, Run, RunJob};
use gantry_core::runner::RunnerScope;
use gantry_core::{JobId, RunId, Status};

use super::MemoryTransaction;
use crate::{DbError, DbResult, JobFilter, JobGuard, JobRepo};

#[async_trait]
impl JobRepo for MemoryTransaction {
    async fn insert_jobs(
        &mut self,
        run: &Run,
        jobs: &[NewRunJob],
        now: DateTime<Utc>,
    ) -> DbResult<Vec<RunJob>> {
        let tables = &mut self.staged;
        let mut inserted = Vec::with_capacity(jobs.len());
        for job in jobs {
            if tables
                .jobs
                .values()
                .any(|j| j.run_id == run.id && j.job_id == job.job_id)
            {
                return Err(DbError::Duplicate(format!(
                    "job '{}' of run {}",
                    job.job_id, run.id
                )));
            }
            let stored = RunJob {
                id: JobId::new(tables.next_id()),
                run_id: run.id,
                repo_id: run.repo_id,
                owner_id: run.owner_id,
                commit_sha: run.commit_sha.clone(),
                job_id: job.job_id.clone(),
                name: job.name.clone(),
                payload: job.payload.clone(),
                needs: job.needs.clone(),
                runs_on: job.runs_on.clone(),
                task_id: None,
                runner_id: None,
                attempt: 0,
                status: job.status,
                started: None,
                stopped: None,
                created: now,
                updated: now,
            };
            tables.jobs.insert(stored.id, stored.clone());
            inserted.push(stored);
        }
        Ok(inserted)
    }

    async fn get_job(&mut self, id: JobId) -> DbResult<RunJob> {
        self.staged
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn jobs_of_run(&mut self, run_id: RunId) -> DbResult<Vec<RunJob>> {
        Ok(self
            .staged
            .jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn find_jobs(&mut self, filter: &JobFilter) -> DbResult<Vec<RunJob>> {
        Ok(self
            .staged
            .jobs
            .values()
            .filter(|j| {
                filter.run_id.is_none_or(|id| j.run_id == id)
                    && (filter.statuses.is_empty() || filter.statuses.contains(&j.status))
                    && filter.updated_before.is_none_or(|t| j.updated < t)
            })
            .cloned()
            .collect())
    }

    async fn waiting_jobs(&mut self, scope: RunnerScope) -> DbResult<Vec<RunJob>> {
        let mut jobs: Vec<RunJob> = self
            .staged
            .jobs
            .values()
            .filter(|j| {
                j.status == Status::Waiting
                    && j.task_id.is_none()
                    && scope.can_see(j.repo_id, j.owner_id)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created, j.id));
        Ok(jobs)
    }

    async fn update_job(&mut self, job: &RunJob, guard: JobGuard) -> DbResult<u64> {
        let Some(stored) = self.staged.jobs.get_mut(&job.id) else {
            return Ok(0);
        };
        if !guard.admits(stored) {
            return Ok(0);
        }
        stored.task_id = job.task_id;
        stored.runner_id = job.runner_id;
        stored.attempt = job.attempt;
        stored.status = job.status;
        stored.started = job.started;
        stored.stopped = job.stopped;
        stored.updated = job.updated;
        Ok(1)
    }
}
