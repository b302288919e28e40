//! Repository, secret and variable storage.

use async_trait::async_trait;
use gantry_core::repository::{NewRepository, Repository, RunCounters};
use gantry_core::secret::{Level, Secret, Variable};
use gantry_core::{OwnerId, RepoId};

use crate::pg::{PgTransaction, unique_violation};
use crate::{DbError, DbResult};

#[async_trait]
pub trait RepositoryRepo: Send {
    async fn insert_repository(&mut self, repo: &NewRepository) -> DbResult<Repository>;
    async fn get_repository(&mut self, id: RepoId) -> DbResult<Repository>;
    /// Store the archived flag and disabled workflows.
    async fn update_repository(&mut self, repo: &Repository) -> DbResult<()>;

    async fn insert_secret(&mut self, secret: &Secret) -> DbResult<()>;
    async fn insert_variable(&mut self, variable: &Variable) -> DbResult<()>;
    /// Secrets of the repository and of its owner.
    async fn secrets_for(&mut self, repo_id: RepoId, owner_id: OwnerId) -> DbResult<Vec<Secret>>;
    /// Variables of the repository and of its owner.
    async fn variables_for(&mut self, repo_id: RepoId, owner_id: OwnerId)
    -> DbResult<Vec<Variable>>;
}

/// A repository row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepositoryRecord {
    pub id: i64,
    pub owner_id: i64,
    pub owner_name: String,
    pub name: String,
    pub archived: bool,
    pub disabled_workflows: Vec<String>,
    pub num_runs: i64,
    pub num_closed_runs: i64,
}

impl From<RepositoryRecord> for Repository {
    fn from(r: RepositoryRecord) -> Self {
        Repository {
            id: RepoId::new(r.id),
            owner_id: OwnerId::new(r.owner_id),
            owner_name: r.owner_name,
            name: r.name,
            archived: r.archived,
            disabled_workflows: r.disabled_workflows,
            counters: RunCounters {
                num_runs: r.num_runs,
                num_closed_runs: r.num_closed_runs,
            },
        }
    }
}

/// A secret or variable row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScopedValueRecord {
    pub owner_id: Option<i64>,
    pub repo_id: Option<i64>,
    pub name: String,
    pub value: String,
}

impl ScopedValueRecord {
    fn level(&self) -> DbResult<Level> {
        match (self.owner_id, self.repo_id) {
            (None, Some(repo)) => Ok(Level::Repository(RepoId::new(repo))),
            (Some(owner), None) => Ok(Level::Owner(OwnerId::new(owner))),
            _ => Err(DbError::Corrupt(format!(
                "'{}' must belong to exactly one owner or repository",
                self.name
            ))),
        }
    }
}

fn level_ids(level: Level) -> (Option<i64>, Option<i64>) {
    match level {
        Level::Owner(owner) => (Some(owner.get()), None),
        Level::Repository(repo) => (None, Some(repo.get())),
    }
}

impl PgTransaction {
    async fn scoped_values(
        &mut self,
        table: &str,
        repo_id: RepoId,
        owner_id: OwnerId,
    ) -> DbResult<Vec<ScopedValueRecord>> {
        let sql = format!(
            "SELECT owner_id, repo_id, name, value FROM {} WHERE repo_id = $1 OR owner_id = $2 ORDER BY name",
            table
        );
        let records = sqlx::query_as::<_, ScopedValueRecord>(&sql)
            .bind(repo_id.get())
            .bind(owner_id.get())
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(records)
    }

    async fn insert_scoped_value(
        &mut self,
        table: &str,
        level: Level,
        name: &str,
        value: &str,
    ) -> DbResult<()> {
        let (owner_id, repo_id) = level_ids(level);
        let sql = format!(
            "INSERT INTO {} (owner_id, repo_id, name, value) VALUES ($1, $2, $3, $4)",
            table
        );
        sqlx::query(&sql)
            .bind(owner_id)
            .bind(repo_id)
            .bind(name)
            .bind(value)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| unique_violation(e, format!("{} '{}'", table, name)))?;
        Ok(())
    }
}

#[async_trait]
impl RepositoryRepo for PgTransaction {
    async fn insert_repository(&mut self, repo: &NewRepository) -> DbResult<Repository> {
        let record = sqlx::query_as::<_, RepositoryRecord>(
            r#"
            INSERT INTO repositories (owner_id, owner_name, name)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(repo.owner_id.get())
        .bind(&repo.owner_name)
        .bind(&repo.name)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| unique_violation(e, format!("repository {}/{}", repo.owner_name, repo.name)))?;
        Ok(record.into())
    }

    async fn get_repository(&mut self, id: RepoId) -> DbResult<Repository> {
        let record =
            sqlx::query_as::<_, RepositoryRecord>("SELECT * FROM repositories WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&mut *self.tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))?;
        Ok(record.into())
    }

    async fn update_repository(&mut self, repo: &Repository) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE repositories SET archived = $2, disabled_workflows = $3 WHERE id = $1",
        )
        .bind(repo.id.get())
        .bind(repo.archived)
        .bind(&repo.disabled_workflows)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("repository {}", repo.id)));
        }
        Ok(())
    }

    async fn insert_secret(&mut self, secret: &Secret) -> DbResult<()> {
        self.insert_scoped_value("secrets", secret.level, &secret.name, &secret.value)
            .await
    }

    async fn insert_variable(&mut self, variable: &Variable) -> DbResult<()> {
        self.insert_scoped_value("variables", variable.level, &variable.name, &variable.value)
            .await
    }

    async fn secrets_for(&mut self, repo_id: RepoId, owner_id: OwnerId) -> DbResult<Vec<Secret>> {
        self.scoped_values("secrets", repo_id, owner_id)
            .await?
            .into_iter()
            .map(|r| {
                Ok(Secret {
                    level: r.level()?,
                    name: r.name,
                    value: r.value,
                })
            })
            .collect()
    }

    async fn variables_for(
        &mut self,
        repo_id: RepoId,
        owner_id: OwnerId,
    ) -> DbResult<Vec<Variable>> {
        self.scoped_values("variables", repo_id, owner_id)
            .await?
            .into_iter()
            .map(|r| {
                Ok(Variable {
                    level: r.level()?,
                    name: r.name,
                    value: r.value,
                })
            })
            .collect()
    }
}
