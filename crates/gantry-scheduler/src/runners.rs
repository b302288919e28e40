//! Runner registration, authentication and heartbeats.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gantry_core::credential::{IssuedToken, verify_token};
use gantry_core::runner::{NewRunner, Runner, RunnerScope, RunnerStatus, RunnerThresholds};
use gantry_core::{Error, OwnerId, RepoId, Result, RunnerId};
use gantry_db::{Database, DbError};
use tracing::{info, warn};
use uuid::Uuid;

/// A newly registered runner and its plaintext token. The token is not
/// stored and cannot be recovered later.
#[derive(Debug, Clone)]
pub struct Registration {
    pub runner: Runner,
    pub token: String,
}

#[derive(Clone)]
pub struct RunnerRegistry {
    db: Arc<dyn Database>,
    thresholds: RunnerThresholds,
}

impl RunnerRegistry {
    pub fn new(db: Arc<dyn Database>, thresholds: RunnerThresholds) -> Self {
        Self { db, thresholds }
    }

    /// Register a runner. A repository scope wins over an owner scope.
    pub async fn register(
        &self,
        name: &str,
        owner_id: Option<OwnerId>,
        repo_id: Option<RepoId>,
        labels: Vec<String>,
    ) -> Result<Registration> {
        let issued = IssuedToken::generate();
        let mut tx = self.db.begin().await?;
        let runner = tx
            .insert_runner(
                &NewRunner {
                    uuid: Uuid::new_v4(),
                    name: name.to_string(),
                    scope: RunnerScope::from_ids(owner_id, repo_id),
                    labels,
                    token_hash: issued.hash,
                    token_salt: issued.salt,
                },
                Utc::now(),
            )
            .await?;
        tx.commit().await?;

        info!(runner_id = %runner.id, uuid = %runner.uuid, name = %runner.name, "Registered runner");
        Ok(Registration {
            runner,
            token: issued.token,
        })
    }

    /// Look a runner up by UUID and check its token.
    pub async fn authenticate(&self, uuid: Uuid, token: &str) -> Result<Runner> {
        let mut tx = self.db.begin().await?;
        let runner = match tx.get_runner_by_uuid(uuid).await {
            Ok(runner) => runner,
            Err(DbError::NotFound(_)) => {
                warn!(uuid = %uuid, "Unknown runner");
                return Err(Error::Unauthorized("runner not found".to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !verify_token(token, &runner.token_salt, &runner.token_hash) {
            warn!(runner_id = %runner.id, "Invalid runner token");
            return Err(Error::Unauthorized("invalid runner token".to_string()));
        }
        Ok(runner)
    }

    /// Record that a runner called in; `active` also marks it busy.
    pub async fn heartbeat(&self, runner_id: RunnerId, active: bool) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        tx.touch_runner(runner_id, now, active.then_some(now)).await?;
        tx.commit().await?;
        Ok(())
    }

    pub fn status(&self, runner: &Runner, now: DateTime<Utc>) -> RunnerStatus {
        runner.status(now, &self.thresholds)
    }

    pub async fn get_runner(&self, runner_id: RunnerId) -> Result<Runner> {
        let mut tx = self.db.begin().await?;
        Ok(tx.get_runner(runner_id).await?)
    }

    /// Replace the labels a runner declares.
    pub async fn update_labels(&self, runner_id: RunnerId, labels: &[String]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        tx.update_runner_labels(runner_id, labels).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Soft-delete a runner; its UUID is replaced so it can never
    /// authenticate again.
    pub async fn delete_runner(&self, runner_id: RunnerId) -> Result<()> {
        let mut tx = self.db.begin().await?;
        tx.soft_delete_runner(runner_id, Utc::now()).await?;
        tx.commit().await?;
        info!(runner_id = %runner_id, "Deleted runner");
        Ok(())
    }

    /// Soft-delete runners offline since before `cutoff`. The cutoff must lie
    /// at least one offline threshold in the past.
    pub async fn cleanup_offline_runners(
        &self,
        cutoff: DateTime<Utc>,
        global_only: bool,
    ) -> Result<usize> {
        let now = Utc::now();
        let latest = now
            .checked_sub_signed(self.thresholds.offline_after)
            .ok_or_else(|| Error::InvalidInput("runner offline threshold is out of range".to_string()))?;
        if cutoff > latest {
            return Err(Error::InvalidInput(
                "cutoff must be older than the runner offline threshold".to_string(),
            ));
        }

        let mut tx = self.db.begin().await?;
        let runners = tx.offline_runners(cutoff, global_only).await?;
        for runner in &runners {
            tx.soft_delete_runner(runner.id, now).await?;
        }
        tx.commit().await?;

        if !runners.is_empty() {
            info!(count = runners.len(), cutoff = %cutoff, "Deleted offline runners");
        }
        Ok(runners.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use gantry_db::MemoryDatabase;

    fn registry() -> RunnerRegistry {
        RunnerRegistry::new(Arc::new(MemoryDatabase::new()), RunnerThresholds::default())
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let registry = registry();
        let reg = registry
            .register(
                "builder",
                Some(OwnerId::new(1)),
                Some(RepoId::new(2)),
                vec!["ubuntu".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(reg.token.len(), 40);
        assert_eq!(reg.runner.scope, RunnerScope::Repository(RepoId::new(2)));

        let runner = registry.authenticate(reg.runner.uuid, &reg.token).await.unwrap();
        assert_eq!(runner.id, reg.runner.id);

        let err = registry.authenticate(reg.runner.uuid, "wrong").await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        let err = registry.authenticate(Uuid::new_v4(), &reg.token).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_drives_status() {
        let registry = registry();
        let reg = registry.register("builder", None, None, vec![]).await.unwrap();
        let now = Utc::now();
        assert_eq!(registry.status(&reg.runner, now), RunnerStatus::Offline);

        registry.heartbeat(reg.runner.id, false).await.unwrap();
        let runner = registry.get_runner(reg.runner.id).await.unwrap();
        assert_eq!(registry.status(&runner, Utc::now()), RunnerStatus::Idle);

        registry.heartbeat(reg.runner.id, true).await.unwrap();
        let runner = registry.get_runner(reg.runner.id).await.unwrap();
        assert_eq!(registry.status(&runner, Utc::now()), RunnerStatus::Active);
        assert_eq!(
            registry.status(&runner, Utc::now() + TimeDelta::minutes(5)),
            RunnerStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_deleted_runner_cannot_authenticate() {
        let registry = registry();
        let reg = registry.register("builder", None, None, vec![]).await.unwrap();

        registry.delete_runner(reg.runner.id).await.unwrap();

        assert!(registry.authenticate(reg.runner.uuid, &reg.token).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_rejects_recent_cutoff() {
        let registry = registry();
        let err = registry
            .cleanup_offline_runners(Utc::now(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_stale_runners() {
        let db = Arc::new(MemoryDatabase::new());
        let registry = RunnerRegistry::new(db.clone(), RunnerThresholds::default());
        let long_ago = Utc::now() - TimeDelta::days(3);
        let mut tx = db.begin().await.unwrap();
        let mut stale = Vec::new();
        for (name, scope) in [
            ("global", RunnerScope::Global),
            ("owned", RunnerScope::Owner(OwnerId::new(1))),
        ] {
            let issued = IssuedToken::generate();
            let runner = tx
                .insert_runner(
                    &NewRunner {
                        uuid: Uuid::new_v4(),
                        name: name.to_string(),
                        scope,
                        labels: vec![],
                        token_hash: issued.hash,
                        token_salt: issued.salt,
                    },
                    long_ago,
                )
                .await
                .unwrap();
            stale.push(runner);
        }
        tx.commit().await.unwrap();
        let fresh = registry.register("fresh", None, None, vec![]).await.unwrap();

        let cutoff = Utc::now() - TimeDelta::days(1);
        assert_eq!(registry.cleanup_offline_runners(cutoff, true).await.unwrap(), 1);
        assert!(registry.get_runner(stale[0].id).await.unwrap().deleted.is_some());
        assert!(registry.get_runner(stale[1].id).await.unwrap().deleted.is_none());

        assert_eq!(registry.cleanup_offline_runners(cutoff, false).await.unwrap(), 1);
        assert!(registry.get_runner(stale[1].id).await.unwrap().deleted.is_some());
        assert!(registry.get_runner(fresh.runner.id).await.unwrap().deleted.is_none());
    }
}
