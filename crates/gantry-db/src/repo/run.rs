//! Run repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::repository::RunCounters;
use gantry_core::run::{NewRun, Run};
use gantry_core::{OwnerId, RepoId, RunId, Status, TriggerEvent, UserId};

use crate::pg::{PgTransaction, decode};
use crate::{DbError, DbResult};

/// Criteria for [`RunRepo::find_runs`]. Unset fields match everything; an
/// empty status list matches every status.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub repo_id: Option<RepoId>,
    pub git_ref: Option<String>,
    pub workflow_id: Option<String>,
    pub trigger_event: Option<TriggerEvent>,
    pub statuses: Vec<Status>,
}

#[async_trait]
pub trait RunRepo: Send {
    /// Reserve the next index of `repo_id`. Concurrent callers serialise on
    /// the repository's index row until their transaction ends.
    async fn next_run_index(&mut self, repo_id: RepoId) -> DbResult<i64>;
    async fn insert_run(
        &mut self,
        run: &NewRun,
        index: i64,
        status: Status,
        now: DateTime<Utc>,
    ) -> DbResult<Run>;
    async fn get_run(&mut self, id: RunId) -> DbResult<Run>;
    async fn get_run_by_index(&mut self, repo_id: RepoId, index: i64) -> DbResult<Run>;
    async fn latest_run(&mut self, repo_id: RepoId) -> DbResult<Run>;
    /// The run that stopped most recently, strictly before `before`.
    async fn run_before(&mut self, repo_id: RepoId, before: DateTime<Utc>) -> DbResult<Run>;
    async fn latest_run_for(
        &mut self,
        repo_id: RepoId,
        git_ref: Option<&str>,
        workflow_id: &str,
        event: Option<TriggerEvent>,
    ) -> DbResult<Run>;
    async fn find_runs(&mut self, filter: &RunFilter) -> DbResult<Vec<Run>>;
    /// Write `run` if its stored version still equals `expected_version`.
    /// Returns the stored run with its version advanced by one.
    async fn update_run(&mut self, run: &Run, expected_version: i32) -> DbResult<Run>;
    /// Recount the runs of `repo_id` and store the counters on the repository.
    async fn recompute_run_counters(&mut self, repo_id: RepoId) -> DbResult<RunCounters>;
}

/// A run row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub workflow_id: String,
    pub index: i64,
    pub trigger_user_id: i64,
    pub git_ref: String,
    pub commit_sha: String,
    pub event: String,
    pub trigger_event: String,
    pub event_payload: String,
    pub needs_approval: bool,
    pub approved_by: Option<i64>,
    pub status: String,
    pub version: i32,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub previous_duration_secs: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl TryFrom<RunRecord> for Run {
    type Error = DbError;

    fn try_from(r: RunRecord) -> DbResult<Self> {
        Ok(Run {
            id: RunId::new(r.id),
            repo_id: RepoId::new(r.repo_id),
            owner_id: OwnerId::new(r.owner_id),
            workflow_id: r.workflow_id,
            index: r.index,
            trigger_user_id: UserId::new(r.trigger_user_id),
            git_ref: r.git_ref,
            commit_sha: r.commit_sha,
            event: decode("runs.event", &r.event)?,
            trigger_event: decode("runs.trigger_event", &r.trigger_event)?,
            event_payload: r.event_payload,
            needs_approval: r.needs_approval,
            approved_by: r.approved_by.map(UserId::new),
            status: decode("runs.status", &r.status)?,
            version: r.version,
            started: r.started,
            stopped: r.stopped,
            previous_duration_secs: r.previous_duration_secs,
            created: r.created,
            updated: r.updated,
        })
    }
}

fn statuses(list: &[Status]) -> Vec<String> {
    list.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl RunRepo for PgTransaction {
    async fn next_run_index(&mut self, repo_id: RepoId) -> DbResult<i64> {
        let index: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO run_indexes (repo_id, max_index)
            VALUES ($1, 1)
            ON CONFLICT (repo_id) DO UPDATE SET max_index = run_indexes.max_index + 1
            RETURNING max_index
            "#,
        )
        .bind(repo_id.get())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(index)
    }

    async fn insert_run(
        &mut self,
        run: &NewRun,
        index: i64,
        status: Status,
        now: DateTime<Utc>,
    ) -> DbResult<Run> {
        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            INSERT INTO runs (repo_id, owner_id, workflow_id, index, trigger_user_id, git_ref,
                              commit_sha, event, trigger_event, event_payload, needs_approval,
                              status, version, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, $13, $13)
            RETURNING *
            "#,
        )
        .bind(run.repo_id.get())
        .bind(run.owner_id.get())
        .bind(&run.workflow_id)
        .bind(index)
        .bind(run.trigger_user_id.get())
        .bind(&run.git_ref)
        .bind(&run.commit_sha)
        .bind(run.event.as_str())
        .bind(run.trigger_event.as_str())
        .bind(&run.event_payload)
        .bind(run.needs_approval)
        .bind(status.as_str())
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            crate::pg::unique_violation(e, format!("run {} of repo {}", index, run.repo_id))
        })?;
        record.try_into()
    }

    async fn get_run(&mut self, id: RunId) -> DbResult<Run> {
        sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("run {}", id)))?
            .try_into()
    }

    async fn get_run_by_index(&mut self, repo_id: RepoId, index: i64) -> DbResult<Run> {
        sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE repo_id = $1 AND index = $2")
            .bind(repo_id.get())
            .bind(index)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("run {} of repo {}", index, repo_id)))?
            .try_into()
    }

    async fn latest_run(&mut self, repo_id: RepoId) -> DbResult<Run> {
        sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM runs WHERE repo_id = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(repo_id.get())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("latest run of repo {}", repo_id)))?
        .try_into()
    }

    async fn run_before(&mut self, repo_id: RepoId, before: DateTime<Utc>) -> DbResult<Run> {
        sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT * FROM runs
            WHERE repo_id = $1 AND stopped IS NOT NULL AND stopped < $2
            ORDER BY stopped DESC
            LIMIT 1
            "#,
        )
        .bind(repo_id.get())
        .bind(before)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("run of repo {} before {}", repo_id, before)))?
        .try_into()
    }

    async fn latest_run_for(
        &mut self,
        repo_id: RepoId,
        git_ref: Option<&str>,
        workflow_id: &str,
        event: Option<TriggerEvent>,
    ) -> DbResult<Run> {
        sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT * FROM runs
            WHERE repo_id = $1 AND workflow_id = $2
              AND ($3::text IS NULL OR git_ref = $3)
              AND ($4::text IS NULL OR event = $4)
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(repo_id.get())
        .bind(workflow_id)
        .bind(git_ref)
        .bind(event.map(|e| e.as_str()))
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| {
            DbError::NotFound(format!(
                "run with repo_id {}, ref {}, workflow_id {}",
                repo_id,
                git_ref.unwrap_or(""),
                workflow_id
            ))
        })?
        .try_into()
    }

    async fn find_runs(&mut self, filter: &RunFilter) -> DbResult<Vec<Run>> {
        let records = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT * FROM runs
            WHERE ($1::bigint IS NULL OR repo_id = $1)
              AND ($2::text IS NULL OR git_ref = $2)
              AND ($3::text IS NULL OR workflow_id = $3)
              AND ($4::text IS NULL OR trigger_event = $4)
              AND (cardinality($5::text[]) = 0 OR status = ANY($5))
            ORDER BY id
            "#,
        )
        .bind(filter.repo_id.map(RepoId::get))
        .bind(filter.git_ref.as_deref())
        .bind(filter.workflow_id.as_deref())
        .bind(filter.trigger_event.map(|e| e.as_str()))
        .bind(statuses(&filter.statuses))
        .fetch_all(&mut *self.tx)
        .await?;
        records.into_iter().map(Run::try_from).collect()
    }

    async fn update_run(&mut self, run: &Run, expected_version: i32) -> DbResult<Run> {
        sqlx::query_as::<_, RunRecord>(
            r#"
            UPDATE runs
            SET status = $3, needs_approval = $4, approved_by = $5, started = $6, stopped = $7,
                previous_duration_secs = $8, version = version + 1, updated = $9
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(run.id.get())
        .bind(expected_version)
        .bind(run.status.as_str())
        .bind(run.needs_approval)
        .bind(run.approved_by.map(UserId::get))
        .bind(run.started)
        .bind(run.stopped)
        .bind(run.previous_duration_secs)
        .bind(run.updated)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::Conflict(format!("run {} has changed", run.id)))?
        .try_into()
    }

    async fn recompute_run_counters(&mut self, repo_id: RepoId) -> DbResult<RunCounters> {
        let (num_runs, num_closed_runs): (i64, i64) = sqlx::query_as(
            r#"
            UPDATE repositories SET
                num_runs = (SELECT COUNT(*) FROM runs WHERE repo_id = $1),
                num_closed_runs = (SELECT COUNT(*) FROM runs WHERE repo_id = $1 AND status = ANY($2))
            WHERE id = $1
            RETURNING num_runs, num_closed_runs
            "#,
        )
        .bind(repo_id.get())
        .bind(statuses(&CLOSED))
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repository {}", repo_id)))?;
        Ok(RunCounters {
            num_runs,
            num_closed_runs,
        })
    }
}

/// Statuses counted as closed by the repository counters.
pub const CLOSED: [Status; 4] = [
    Status::Success,
    Status::Failure,
    Status::Cancelled,
    Status::Skipped,
];
