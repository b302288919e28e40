use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::RunnerId;
use gantry_core::runner::{NewRunner, Runner, RunnerScope, deleted_runner_uuid};
use uuid::Uuid;

use super::MemoryTransaction;
use crate::{DbError, DbResult, RunnerRepo};

#[async_trait]
impl RunnerRepo for MemoryTransaction {
    async fn insert_runner(&mut self, runner: &NewRunner, now: DateTime<Utc>) -> DbResult<Runner> {
        let tables = &mut self.staged;
        if tables.runners.values().any(|r| r.uuid == runner.uuid) {
            return Err(DbError::Duplicate(format!("runner {}", runner.uuid)));
        }
        let stored = Runner {
            id: RunnerId::new(tables.next_id()),
            uuid: runner.uuid,
            name: runner.name.clone(),
            scope: runner.scope,
            labels: runner.labels.clone(),
            token_hash: runner.token_hash.clone(),
            token_salt: runner.token_salt.clone(),
            last_online: None,
            last_active: None,
            created: now,
            deleted: None,
        };
        tables.runners.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_runner(&mut self, id: RunnerId) -> DbResult<Runner> {
        self.staged
            .runners
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))
    }

    async fn get_runner_by_uuid(&mut self, uuid: Uuid) -> DbResult<Runner> {
        self.staged
            .runners
            .values()
            .find(|r| r.uuid == uuid && r.deleted.is_none())
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("runner {}", uuid)))
    }

    async fn touch_runner(
        &mut self,
        id: RunnerId,
        online: DateTime<Utc>,
        active: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let Some(runner) = self.staged.runners.get_mut(&id) else {
            return Ok(());
        };
        runner.last_online = runner.last_online.max(Some(online));
        if active.is_some() {
            runner.last_active = runner.last_active.max(active);
        }
        Ok(())
    }

    async fn update_runner_labels(&mut self, id: RunnerId, labels: &[String]) -> DbResult<()> {
        let runner = self
            .staged
            .runners
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;
        runner.labels = labels.to_vec();
        Ok(())
    }

    async fn soft_delete_runner(&mut self, id: RunnerId, now: DateTime<Utc>) -> DbResult<()> {
        let runner = self
            .staged
            .runners
            .get_mut(&id)
            .filter(|r| r.deleted.is_none())
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;
        runner.uuid = deleted_runner_uuid(id);
        runner.deleted = Some(now);
        Ok(())
    }

    async fn offline_runners(
        &mut self,
        cutoff: DateTime<Utc>,
        global_only: bool,
    ) -> DbResult<Vec<Runner>> {
        Ok(self
            .staged
            .runners
            .values()
            .filter(|r| {
                let stale = match r.last_online {
                    Some(seen) => seen < cutoff,
                    None => r.created < cutoff,
                };
                r.deleted.is_none()
                    && stale
                    && (!global_only || r.scope == RunnerScope::Global)
            })
            .cloned()
            .collect())
    }
}
