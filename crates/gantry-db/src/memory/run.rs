use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::repository::RunCounters;
use gantry_core::run::{NewRun, Run};
use gantry_core::{RepoId, RunId, Status, TriggerEvent};

use super::MemoryTransaction;
use crate::repo::run::CLOSED;
use crate::{DbError, DbResult, RunFilter, RunRepo};

#[async_trait]
impl RunRepo for MemoryTransaction {
    async fn next_run_index(&mut self, repo_id: RepoId) -> DbResult<i64> {
        let index = self.staged.run_indexes.entry(repo_id).or_insert(0);
        *index += 1;
        Ok(*index)
    }

    async fn insert_run(
        &mut self,
        run: &NewRun,
        index: i64,
        status: Status,
        now: DateTime<Utc>,
    ) -> DbResult<Run> {
        let tables = &mut self.staged;
        if tables
            .runs
            .values()
            .any(|r| r.repo_id == run.repo_id && r.index == index)
        {
            return Err(DbError::Duplicate(format!(
                "run {} of repo {}",
                index, run.repo_id
            )));
        }
        let stored = Run {
            id: RunId::new(tables.next_id()),
            repo_id: run.repo_id,
            owner_id: run.owner_id,
            workflow_id: run.workflow_id.clone(),
            index,
            trigger_user_id: run.trigger_user_id,
            git_ref: run.git_ref.clone(),
            commit_sha: run.commit_sha.clone(),
            event: run.event,
            trigger_event: run.trigger_event,
            event_payload: run.event_payload.clone(),
            needs_approval: run.needs_approval,
            approved_by: None,
            status,
            version: 0,
            started: None,
            stopped: None,
            previous_duration_secs: 0,
            created: now,
            updated: now,
        };
        tables.runs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_run(&mut self, id: RunId) -> DbResult<Run> {
        self.staged
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("run {}", id)))
    }

    async fn get_run_by_index(&mut self, repo_id: RepoId, index: i64) -> DbResult<Run> {
        self.staged
            .runs
            .values()
            .find(|r| r.repo_id == repo_id && r.index == index)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("run {} of repo {}", index, repo_id)))
    }

    async fn latest_run(&mut self, repo_id: RepoId) -> DbResult<Run> {
        self.staged
            .runs
            .values()
            .rev()
            .find(|r| r.repo_id == repo_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("latest run of repo {}", repo_id)))
    }

    async fn run_before(&mut self, repo_id: RepoId, before: DateTime<Utc>) -> DbResult<Run> {
        self.staged
            .runs
            .values()
            .filter(|r| r.repo_id == repo_id && r.stopped.is_some_and(|s| s < before))
            .max_by_key(|r| r.stopped)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("run of repo {} before {}", repo_id, before)))
    }

    async fn latest_run_for(
        &mut self,
        repo_id: RepoId,
        git_ref: Option<&str>,
        workflow_id: &str,
        event: Option<TriggerEvent>,
    ) -> DbResult<Run> {
        self.staged
            .runs
            .values()
            .rev()
            .find(|r| {
                r.repo_id == repo_id
                    && r.workflow_id == workflow_id
                    && git_ref.is_none_or(|g| r.git_ref == g)
                    && event.is_none_or(|e| r.event == e)
            })
            .cloned()
            .ok_or_else(|| {
                DbError::NotFound(format!(
                    "run with repo_id {}, ref {}, workflow_id {}",
                    repo_id,
                    git_ref.unwrap_or(""),
                    workflow_id
                ))
            })
    }

    async fn find_runs(&mut self, filter: &RunFilter) -> DbResult<Vec<Run>> {
        Ok(self
            .staged
            .runs
            .values()
            .filter(|r| {
                filter.repo_id.is_none_or(|id| r.repo_id == id)
                    && filter.git_ref.as_deref().is_none_or(|g| r.git_ref == g)
                    && filter
                        .workflow_id
                        .as_deref()
                        .is_none_or(|w| r.workflow_id == w)
                    && filter.trigger_event.is_none_or(|e| r.trigger_event == e)
                    && (filter.statuses.is_empty() || filter.statuses.contains(&r.status))
            })
            .cloned()
            .collect())
    }

    async fn update_run(&mut self, run: &Run, expected_version: i32) -> DbResult<Run> {
        let stored = self
            .staged
            .runs
            .get_mut(&run.id)
            .filter(|stored| stored.version == expected_version)
            .ok_or_else(|| DbError::Conflict(format!("run {} has changed", run.id)))?;
        stored.status = run.status;
        stored.needs_approval = run.needs_approval;
        stored.approved_by = run.approved_by;
        stored.started = run.started;
        stored.stopped = run.stopped;
        stored.previous_duration_secs = run.previous_duration_secs;
        stored.updated = run.updated;
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn recompute_run_counters(&mut self, repo_id: RepoId) -> DbResult<RunCounters> {
        let tables = &mut self.staged;
        let (num_runs, num_closed_runs) = tables
            .runs
            .values()
            .filter(|r| r.repo_id == repo_id)
            .fold((0, 0), |(all, closed), r| {
                (all + 1, closed + i64::from(CLOSED.contains(&r.status)))
            });
        let repo = tables
            .repositories
            .get_mut(&repo_id)
            .ok_or_else(|| DbError::NotFound(format!("repository {}", repo_id)))?;
        repo.counters = RunCounters {
            num_runs,
            num_closed_runs,
        };
        Ok(repo.counters)
    }
}
