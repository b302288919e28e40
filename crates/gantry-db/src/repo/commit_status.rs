//! Commit status repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::RepoId;
use gantry_core::commit_status::CommitStatus;

use crate::DbResult;
use crate::pg::{PgTransaction, decode};

#[async_trait]
pub trait CommitStatusRepo: Send {
    /// The most recent status for `(repo, sha, context)`.
    async fn latest_commit_status(
        &mut self,
        repo_id: RepoId,
        sha: &str,
        context: &str,
    ) -> DbResult<Option<CommitStatus>>;
    async fn insert_commit_status(&mut self, status: &CommitStatus) -> DbResult<()>;
    /// All statuses of a commit, oldest first.
    async fn commit_statuses(&mut self, repo_id: RepoId, sha: &str) -> DbResult<Vec<CommitStatus>>;
}

/// A commit status row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommitStatusRecord {
    pub repo_id: i64,
    pub sha: String,
    pub context: String,
    pub state: String,
    pub description: String,
    pub target_url: String,
    pub created: DateTime<Utc>,
}

impl TryFrom<CommitStatusRecord> for CommitStatus {
    type Error = crate::DbError;

    fn try_from(r: CommitStatusRecord) -> DbResult<Self> {
        Ok(CommitStatus {
            repo_id: RepoId::new(r.repo_id),
            sha: r.sha,
            context: r.context,
            state: decode("commit_statuses.state", &r.state)?,
            description: r.description,
            target_url: r.target_url,
            created: r.created,
        })
    }
}

const COLUMNS: &str = "repo_id, sha, context, state, description, target_url, created";

#[async_trait]
impl CommitStatusRepo for PgTransaction {
    async fn latest_commit_status(
        &mut self,
        repo_id: RepoId,
        sha: &str,
        context: &str,
    ) -> DbResult<Option<CommitStatus>> {
        let sql = format!(
            "SELECT {} FROM commit_statuses WHERE repo_id = $1 AND sha = $2 AND context = $3 ORDER BY id DESC LIMIT 1",
            COLUMNS
        );
        sqlx::query_as::<_, CommitStatusRecord>(&sql)
            .bind(repo_id.get())
            .bind(sha)
            .bind(context)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(CommitStatus::try_from)
            .transpose()
    }

    async fn insert_commit_status(&mut self, status: &CommitStatus) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO commit_statuses (repo_id, sha, context, state, description, target_url, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(status.repo_id.get())
        .bind(&status.sha)
        .bind(&status.context)
        .bind(status.state.as_str())
        .bind(&status.description)
        .bind(&status.target_url)
        .bind(status.created)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit_statuses(&mut self, repo_id: RepoId, sha: &str) -> DbResult<Vec<CommitStatus>> {
        let sql = format!(
            "SELECT {} FROM commit_statuses WHERE repo_id = $1 AND sha = $2 ORDER BY id",
            COLUMNS
        );
        let records = sqlx::query_as::<_, CommitStatusRecord>(&sql)
            .bind(repo_id.get())
            .bind(sha)
            .fetch_all(&mut *self.tx)
            .await?;
        records.into_iter().map(CommitStatus::try_from).collect()
    }
}
