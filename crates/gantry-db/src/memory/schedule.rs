use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::schedule::{NewSchedule, Schedule, ScheduleSpec};
use gantry_core::{RepoId, ScheduleId, SpecId};

use super::MemoryTransaction;
use crate::{DbError, DbResult, DueSpec, ScheduleRepo};

#[async_trait]
impl ScheduleRepo for MemoryTransaction {
    async fn insert_schedule(
        &mut self,
        schedule: &NewSchedule,
        specs: &[(String, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> DbResult<(Schedule, Vec<ScheduleSpec>)> {
        let tables = &mut self.staged;
        let stored = Schedule {
            id: ScheduleId::new(tables.next_id()),
            repo_id: schedule.repo_id,
            owner_id: schedule.owner_id,
            workflow_id: schedule.workflow_id.clone(),
            trigger_user_id: schedule.trigger_user_id,
            git_ref: schedule.git_ref.clone(),
            commit_sha: schedule.commit_sha.clone(),
            event: schedule.event,
            event_payload: schedule.event_payload.clone(),
            content: schedule.content.clone(),
            created: now,
        };
        tables.schedules.insert(stored.id, stored.clone());

        let mut inserted = Vec::with_capacity(specs.len());
        for (expr, next) in specs {
            let spec = ScheduleSpec {
                id: SpecId::new(tables.next_id()),
                schedule_id: stored.id,
                repo_id: stored.repo_id,
                spec: expr.clone(),
                next: *next,
                prev: None,
            };
            tables.specs.insert(spec.id, spec.clone());
            inserted.push(spec);
        }
        Ok((stored, inserted))
    }

    async fn delete_schedules(&mut self, repo_id: RepoId, workflow_id: &str) -> DbResult<u64> {
        let tables = &mut self.staged;
        let doomed: Vec<ScheduleId> = tables
            .schedules
            .values()
            .filter(|s| s.repo_id == repo_id && s.workflow_id == workflow_id)
            .map(|s| s.id)
            .collect();
        for id in &doomed {
            tables.schedules.remove(id);
        }
        tables
            .specs
            .retain(|_, spec| !doomed.contains(&spec.schedule_id));
        Ok(doomed.len() as u64)
    }

    async fn due_specs(
        &mut self,
        now: DateTime<Utc>,
        after: Option<SpecId>,
        limit: usize,
    ) -> DbResult<Vec<DueSpec>> {
        let tables = &self.staged;
        tables
            .specs
            .values()
            .filter(|spec| spec.next <= now && after.is_none_or(|a| spec.id > a))
            .take(limit)
            .map(|spec| {
                let schedule = tables
                    .schedules
                    .get(&spec.schedule_id)
                    .cloned()
                    .ok_or_else(|| DbError::NotFound(format!("schedule {}", spec.schedule_id)))?;
                Ok(DueSpec {
                    spec: spec.clone(),
                    schedule,
                })
            })
            .collect()
    }

    async fn update_spec(&mut self, spec: &ScheduleSpec) -> DbResult<()> {
        let stored = self
            .staged
            .specs
            .get_mut(&spec.id)
            .ok_or_else(|| DbError::NotFound(format!("schedule spec {}", spec.id)))?;
        stored.next = spec.next;
        stored.prev = spec.prev;
        Ok(())
    }
}
