use async_trait::async_trait;
use gantry_core::repository::{NewRepository, Repository, RunCounters};
use gantry_core::secret::{Level, Secret, Variable};
use gantry_core::{OwnerId, RepoId};

use super::MemoryTransaction;
use crate::{DbError, DbResult, RepositoryRepo};

fn visible(level: Level, repo_id: RepoId, owner_id: OwnerId) -> bool {
    match level {
        Level::Owner(owner) => owner == owner_id,
        Level::Repository(repo) => repo == repo_id,
    }
}

#[async_trait]
impl RepositoryRepo for MemoryTransaction {
    async fn insert_repository(&mut self, repo: &NewRepository) -> DbResult<Repository> {
        let tables = &mut self.staged;
        if tables
            .repositories
            .values()
            .any(|r| r.owner_id == repo.owner_id && r.name == repo.name)
        {
            return Err(DbError::Duplicate(format!(
                "repository {}/{}",
                repo.owner_name, repo.name
            )));
        }
        let stored = Repository {
            id: RepoId::new(tables.next_id()),
            owner_id: repo.owner_id,
            owner_name: repo.owner_name.clone(),
            name: repo.name.clone(),
            archived: false,
            disabled_workflows: Vec::new(),
            counters: RunCounters::default(),
        };
        tables.repositories.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_repository(&mut self, id: RepoId) -> DbResult<Repository> {
        self.staged
            .repositories
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))
    }

    async fn update_repository(&mut self, repo: &Repository) -> DbResult<()> {
        let stored = self
            .staged
            .repositories
            .get_mut(&repo.id)
            .ok_or_else(|| DbError::NotFound(format!("repository {}", repo.id)))?;
        stored.archived = repo.archived;
        stored.disabled_workflows = repo.disabled_workflows.clone();
        Ok(())
    }

    async fn insert_secret(&mut self, secret: &Secret) -> DbResult<()> {
        let secrets = &mut self.staged.secrets;
        if secrets
            .iter()
            .any(|s| s.level == secret.level && s.name == secret.name)
        {
            return Err(DbError::Duplicate(format!("secrets '{}'", secret.name)));
        }
        secrets.push(secret.clone());
        Ok(())
    }

    async fn insert_variable(&mut self, variable: &Variable) -> DbResult<()> {
        let variables = &mut self.staged.variables;
        if variables
            .iter()
            .any(|v| v.level == variable.level && v.name == variable.name)
        {
            return Err(DbError::Duplicate(format!("variables '{}'", variable.name)));
        }
        variables.push(variable.clone());
        Ok(())
    }

    async fn secrets_for(&mut self, repo_id: RepoId, owner_id: OwnerId) -> DbResult<Vec<Secret>> {
        Ok(self
            .staged
            .secrets
            .iter()
            .filter(|s| visible(s.level, repo_id, owner_id))
            .cloned()
            .collect())
    }

    async fn variables_for(
        &mut self,
        repo_id: RepoId,
        owner_id: OwnerId,
    ) -> DbResult<Vec<Variable>> {
        Ok(self
            .staged
            .variables
            .iter()
            .filter(|v| visible(v.level, repo_id, owner_id))
            .cloned()
            .collect())
    }
}
