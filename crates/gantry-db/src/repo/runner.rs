//! Runner repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::runner::{NewRunner, Runner, RunnerScope, deleted_runner_uuid};
use gantry_core::{OwnerId, RepoId, RunnerId};
use uuid::Uuid;

use crate::pg::{PgTransaction, unique_violation};
use crate::{DbError, DbResult};

#[async_trait]
pub trait RunnerRepo: Send {
    async fn insert_runner(&mut self, runner: &NewRunner, now: DateTime<Utc>) -> DbResult<Runner>;
    async fn get_runner(&mut self, id: RunnerId) -> DbResult<Runner>;
    /// Look up a live (not deleted) runner by UUID.
    async fn get_runner_by_uuid(&mut self, uuid: Uuid) -> DbResult<Runner>;
    /// Bump heartbeats. Timestamps never move backwards.
    async fn touch_runner(
        &mut self,
        id: RunnerId,
        online: DateTime<Utc>,
        active: Option<DateTime<Utc>>,
    ) -> DbResult<()>;
    async fn update_runner_labels(&mut self, id: RunnerId, labels: &[String]) -> DbResult<()>;
    /// Mark deleted and replace the UUID with the id-derived sentinel.
    async fn soft_delete_runner(&mut self, id: RunnerId, now: DateTime<Utc>) -> DbResult<()>;
    /// Live runners never seen and created before `cutoff`, or last seen
    /// before `cutoff`. With `global_only` owner and repository runners are
    /// left out.
    async fn offline_runners(
        &mut self,
        cutoff: DateTime<Utc>,
        global_only: bool,
    ) -> DbResult<Vec<Runner>>;
}

/// A runner row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunnerRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub owner_id: Option<i64>,
    pub repo_id: Option<i64>,
    pub labels: Vec<String>,
    pub token_hash: String,
    pub token_salt: String,
    pub last_online: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl From<RunnerRecord> for Runner {
    fn from(r: RunnerRecord) -> Self {
        Runner {
            id: RunnerId::new(r.id),
            uuid: r.uuid,
            name: r.name,
            scope: RunnerScope::from_ids(r.owner_id.map(OwnerId::new), r.repo_id.map(RepoId::new)),
            labels: r.labels,
            token_hash: r.token_hash,
            token_salt: r.token_salt,
            last_online: r.last_online,
            last_active: r.last_active,
            created: r.created,
            deleted: r.deleted,
        }
    }
}

#[async_trait]
impl RunnerRepo for PgTransaction {
    async fn insert_runner(&mut self, runner: &NewRunner, now: DateTime<Utc>) -> DbResult<Runner> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            r#"
            INSERT INTO runners (uuid, name, owner_id, repo_id, labels, token_hash, token_salt, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(runner.uuid)
        .bind(&runner.name)
        .bind(runner.scope.owner_id().map(OwnerId::get))
        .bind(runner.scope.repo_id().map(RepoId::get))
        .bind(&runner.labels)
        .bind(&runner.token_hash)
        .bind(&runner.token_salt)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| unique_violation(e, format!("runner {}", runner.uuid)))?;
        Ok(record.into())
    }

    async fn get_runner(&mut self, id: RunnerId) -> DbResult<Runner> {
        let record = sqlx::query_as::<_, RunnerRecord>("SELECT * FROM runners WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;
        Ok(record.into())
    }

    async fn get_runner_by_uuid(&mut self, uuid: Uuid) -> DbResult<Runner> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            "SELECT * FROM runners WHERE uuid = $1 AND deleted IS NULL",
        )
        .bind(uuid)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("runner {}", uuid)))?;
        Ok(record.into())
    }

    async fn touch_runner(
        &mut self,
        id: RunnerId,
        online: DateTime<Utc>,
        active: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE runners
            SET last_online = GREATEST(COALESCE(last_online, $2), $2),
                last_active = CASE WHEN $3::timestamptz IS NULL THEN last_active
                                   ELSE GREATEST(COALESCE(last_active, $3), $3) END
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(online)
        .bind(active)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_runner_labels(&mut self, id: RunnerId, labels: &[String]) -> DbResult<()> {
        let result = sqlx::query("UPDATE runners SET labels = $2 WHERE id = $1")
            .bind(id.get())
            .bind(labels)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("runner {}", id)));
        }
        Ok(())
    }

    async fn soft_delete_runner(&mut self, id: RunnerId, now: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE runners SET uuid = $2, deleted = $3 WHERE id = $1 AND deleted IS NULL",
        )
        .bind(id.get())
        .bind(deleted_runner_uuid(id))
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("runner {}", id)));
        }
        Ok(())
    }

    async fn offline_runners(
        &mut self,
        cutoff: DateTime<Utc>,
        global_only: bool,
    ) -> DbResult<Vec<Runner>> {
        let records = sqlx::query_as::<_, RunnerRecord>(
            r#"
            SELECT * FROM runners
            WHERE deleted IS NULL
              AND ((last_online IS NULL AND created < $1) OR last_online < $1)
              AND (NOT $2 OR (owner_id IS NULL AND repo_id IS NULL))
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .bind(global_only)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(records.into_iter().map(Runner::from).collect())
    }
}
