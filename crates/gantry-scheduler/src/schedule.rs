//! Cron-triggered runs.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use gantry_config::{interpolate_vars, parse_workflow};
use gantry_core::run::NewRun;
use gantry_core::schedule::{NewSchedule, Schedule, ScheduleSpec, next_fire_time};
use gantry_core::secret::merge_scoped;
use gantry_core::{RepoId, Result, SpecId, TriggerEvent};
use gantry_db::{Database, DueSpec};
use tracing::{debug, error, info};

use crate::cancellation::cancel_previous_jobs_in;
use crate::commit_status::CommitStatusProjector;
use crate::notifier::TaskNotifier;
use crate::run_store::{insert_run_in, job_ids};

/// Outcome of one pass over the due specs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub fired: usize,
    /// Archived repository or disabled workflow; the cron spec stays due.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ScheduleTrigger {
    db: Arc<dyn Database>,
    notifier: TaskNotifier,
    statuses: CommitStatusProjector,
    page_size: usize,
    lookahead: TimeDelta,
}

impl ScheduleTrigger {
    pub fn new(
        db: Arc<dyn Database>,
        notifier: TaskNotifier,
        statuses: CommitStatusProjector,
        page_size: usize,
        lookahead: TimeDelta,
    ) -> Self {
        Self {
            db,
            notifier,
            statuses,
            page_size: page_size.max(1),
            lookahead,
        }
    }

    /// Replace the schedules of a workflow with the cron specs its content
    /// declares. Returns `None` when the workflow declares no schedule.
    pub async fn sync_schedules(
        &self,
        schedule: &NewSchedule,
    ) -> Result<Option<(Schedule, Vec<ScheduleSpec>)>> {
        let now = Utc::now();
        let workflow = parse_workflow(&schedule.content)?;
        let specs = workflow
            .schedules
            .iter()
            .map(|expr| Ok((expr.clone(), next_fire_time(expr, now)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.db.begin().await?;
        tx.delete_schedules(schedule.repo_id, &schedule.workflow_id)
            .await?;
        if specs.is_empty() {
            tx.commit().await?;
            return Ok(None);
        }
        let stored = tx.insert_schedule(schedule, &specs, now).await?;
        tx.commit().await?;

        info!(
            schedule_id = %stored.0.id,
            workflow = %schedule.workflow_id,
            specs = stored.1.len(),
            "Synced schedule"
        );
        Ok(Some(stored))
    }

    pub async fn delete_schedules(&self, repo_id: RepoId, workflow_id: &str) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let deleted = tx.delete_schedules(repo_id, workflow_id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Fire every spec due at `now`, one page at a time. A spec that fails is
    /// logged and left due; the pass carries on with the next one.
    pub async fn start_schedule_tasks(&self, now: DateTime<Utc>) -> Result<ScheduleReport> {
        let mut report = ScheduleReport::default();
        let mut after: Option<SpecId> = None;

        loop {
            let page = {
                let mut tx = self.db.begin().await?;
                tx.due_specs(now, after, self.page_size).await?
            };
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.spec.id);
            let full = page.len() == self.page_size;

            for due in page {
                let spec_id = due.spec.id;
                match self.fire(due, now).await {
                    Ok(true) => report.fired += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        error!(spec_id = %spec_id, error = %e, "Failed to fire schedule");
                        report.failed += 1;
                    }
                }
            }
            if !full {
                break;
            }
        }

        if report != ScheduleReport::default() {
            info!(
                fired = report.fired,
                skipped = report.skipped,
                failed = report.failed,
                "Processed due schedules"
            );
        }
        Ok(report)
    }

    /// Create the run of one due cron spec and advance it in the same
    /// transaction. Returns `false` when it was skipped.
    async fn fire(&self, due: DueSpec, now: DateTime<Utc>) -> Result<bool> {
        let DueSpec { mut spec, schedule } = due;
        let mut tx = self.db.begin().await?;

        let repo = tx.get_repository(schedule.repo_id).await?;
        if repo.archived || repo.is_workflow_disabled(&schedule.workflow_id) {
            debug!(spec_id = %spec.id, repo = %repo.full_name(), "Skipping schedule");
            return Ok(false);
        }

        let cancelled = if schedule.event.supersedes_schedules() {
            cancel_previous_jobs_in(
                tx.as_mut(),
                schedule.repo_id,
                &schedule.git_ref,
                &schedule.workflow_id,
                TriggerEvent::Schedule,
                now,
            )
            .await?
        } else {
            Default::default()
        };

        let vars = merge_scoped(
            tx.variables_for(schedule.repo_id, schedule.owner_id)
                .await?
                .into_iter()
                .map(|v| (v.level, v.name, v.value)),
        );
        let workflow = parse_workflow(&interpolate_vars(&schedule.content, &vars))?;
        let run = NewRun {
            repo_id: schedule.repo_id,
            owner_id: schedule.owner_id,
            workflow_id: schedule.workflow_id.clone(),
            trigger_user_id: schedule.trigger_user_id,
            git_ref: schedule.git_ref.clone(),
            commit_sha: schedule.commit_sha.clone(),
            event: schedule.event,
            trigger_event: TriggerEvent::Schedule,
            event_payload: schedule.event_payload.clone(),
            needs_approval: false,
        };
        let inserted = insert_run_in(tx.as_mut(), &run, &workflow.jobs, now).await?;

        spec.advance(now, self.lookahead)?;
        tx.update_spec(&spec).await?;
        tx.commit().await?;

        if inserted.has_waiting || cancelled.woke {
            self.notifier.notify();
        }
        info!(
            spec_id = %spec.id,
            run_id = %inserted.run.id,
            next = %spec.next,
            "Fired schedule"
        );
        let mut changed = cancelled.changed;
        changed.extend(job_ids(&inserted.jobs));
        self.statuses.project(&changed).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::repository::NewRepository;
    use gantry_core::{OwnerId, UserId};
    use gantry_db::MemoryDatabase;

    const NIGHTLY: &str = r#"
workflow "nightly"
on "schedule" cron="0 3 * * *"
job "build" runs-on="ubuntu" {
    step "make" run="make"
}
"#;

    async fn trigger(db: Arc<MemoryDatabase>) -> (ScheduleTrigger, RepoId) {
        let mut tx = db.begin().await.unwrap();
        let repo = tx
            .insert_repository(&NewRepository {
                owner_id: OwnerId::new(1),
                owner_name: "acme".to_string(),
                name: "widgets".to_string(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let statuses = CommitStatusProjector::new(db.clone(), "http://ci.test".to_string());
        let trigger = ScheduleTrigger::new(
            db,
            TaskNotifier::new(),
            statuses,
            2,
            TimeDelta::minutes(1),
        );
        (trigger, repo.id)
    }

    fn new_schedule(repo_id: RepoId, content: &str) -> NewSchedule {
        NewSchedule {
            repo_id,
            owner_id: OwnerId::new(1),
            workflow_id: "nightly.kdl".to_string(),
            trigger_user_id: UserId::new(1),
            git_ref: "refs/heads/main".to_string(),
            commit_sha: "abc123".to_string(),
            event: TriggerEvent::Push,
            event_payload: "{}".to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sync_replaces_specs() {
        let db = Arc::new(MemoryDatabase::new());
        let (trigger, repo_id) = trigger(db).await;

        let (_, specs) = trigger
            .sync_schedules(&new_schedule(repo_id, NIGHTLY))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].next > Utc::now());

        let unscheduled = NIGHTLY.replace(r#"on "schedule" cron="0 3 * * *""#, r#"on "push""#);
        assert!(
            trigger
                .sync_schedules(&new_schedule(repo_id, &unscheduled))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(trigger.delete_schedules(repo_id, "nightly.kdl").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let db = Arc::new(MemoryDatabase::new());
        let (trigger, repo_id) = trigger(db).await;
        let content = NIGHTLY.replace("0 3 * * *", "not a cron");

        assert!(trigger.sync_schedules(&new_schedule(repo_id, &content)).await.is_err());
    }

    #[tokio::test]
    async fn test_due_specs_fire_and_advance() {
        let db = Arc::new(MemoryDatabase::new());
        let (trigger, repo_id) = trigger(db.clone()).await;
        for _ in 0..3 {
            trigger
                .sync_schedules(&NewSchedule {
                    workflow_id: format!("nightly-{}.kdl", uuid::Uuid::new_v4()),
                    ..new_schedule(repo_id, NIGHTLY)
                })
                .await
                .unwrap();
        }

        let later = Utc::now() + TimeDelta::days(2);
        let report = trigger.start_schedule_tasks(later).await.unwrap();
        assert_eq!(report.fired, 3);

        let mut tx = db.begin().await.unwrap();
        assert!(tx.due_specs(later, None, 10).await.unwrap().is_empty());
        let run = tx.latest_run(repo_id).await.unwrap();
        assert_eq!(run.trigger_event, TriggerEvent::Schedule);
        assert_eq!(run.event, TriggerEvent::Push);
    }

    #[tokio::test]
    async fn test_archived_repository_is_skipped_without_advancing() {
        let db = Arc::new(MemoryDatabase::new());
        let (trigger, repo_id) = trigger(db.clone()).await;
        trigger
            .sync_schedules(&new_schedule(repo_id, NIGHTLY))
            .await
            .unwrap();

        let mut tx = db.begin().await.unwrap();
        let mut repo = tx.get_repository(repo_id).await.unwrap();
        repo.archived = true;
        tx.update_repository(&repo).await.unwrap();
        tx.commit().await.unwrap();

        let later = Utc::now() + TimeDelta::days(2);
        let report = trigger.start_schedule_tasks(later).await.unwrap();
        assert_eq!(report.skipped, 1);

        let mut tx = db.begin().await.unwrap();
        assert_eq!(tx.due_specs(later, None, 10).await.unwrap().len(), 1);
    }
}
