//! Runner state reports and forced stops.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gantry_core::runner::Runner;
use gantry_core::task::{Task, TaskStateReport};
use gantry_core::{Error, Result, Status, TaskId};
use gantry_db::{Database, JobGuard, Transaction};
use tracing::{info, warn};

use crate::commit_status::CommitStatusProjector;
use crate::jobs::{JobUpdate, Propagation, update_run_job};
use crate::notifier::TaskNotifier;

#[derive(Clone)]
pub struct TaskStateMachine {
    db: Arc<dyn Database>,
    notifier: TaskNotifier,
    statuses: CommitStatusProjector,
}

impl TaskStateMachine {
    pub fn new(
        db: Arc<dyn Database>,
        notifier: TaskNotifier,
        statuses: CommitStatusProjector,
    ) -> Self {
        Self {
            db,
            notifier,
            statuses,
        }
    }

    /// Apply a runner's report on a task it owns.
    ///
    /// A report with a result finishes the task and its job. A report without
    /// one refreshes the task heartbeat. Reports on finished tasks change
    /// nothing and return the stored task.
    pub async fn update_task_by_state(
        &self,
        runner: &Runner,
        report: &TaskStateReport,
    ) -> Result<Task> {
        if let Some(result) = report.result {
            if !result.is_done() {
                return Err(Error::InvalidInput(format!(
                    "task result must be final, got {}",
                    result
                )));
            }
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let mut task = tx.get_task(report.id).await?;
        if task.runner_id != runner.id {
            warn!(task_id = %task.id, runner_id = %runner.id, "Rejected report from foreign runner");
            return Err(Error::Unauthorized("invalid runner for task".to_string()));
        }
        if task.status.is_done() {
            return Ok(task);
        }

        task.updated = now;
        if let Some(result) = report.result {
            task.status = result;
            task.stopped = Some(report.stopped_at.unwrap_or(now));
        }
        if !tx.update_task(&task).await? {
            // Finished concurrently, e.g. by a forced stop.
            return Ok(tx.get_task(task.id).await?);
        }

        if !report.outputs.is_empty() {
            tx.insert_task_outputs(task.id, &report.outputs).await?;
        }

        for mut step in tx.steps_of_task(task.id).await? {
            let state = report.steps.iter().find(|s| s.index == step.index);
            let before = step.clone();
            step.apply_state(state, report.result);
            if step != before {
                tx.update_step(&step).await?;
            }
        }

        let mut update = JobUpdate::default();
        if report.result.is_some() {
            let mut job = tx.get_job(task.job_id).await?;
            if job.task_id == Some(task.id) && !job.status.is_done() {
                job.status = task.status;
                job.stopped = task.stopped;
                job.updated = now;
                update = update_run_job(
                    tx.as_mut(),
                    &job,
                    JobGuard::AssignedTo(task.id),
                    Propagation::Resolve,
                    now,
                )
                .await?;
            }
        }
        tx.commit().await?;

        if update.woke {
            self.notifier.notify();
        }
        if task.status.is_done() {
            info!(task_id = %task.id, status = %task.status, "Task finished");
        }
        self.statuses.project(&update.changed).await;
        Ok(task)
    }

    /// Force a task to a final status. Returns `false` when the task had
    /// already finished, in which case nothing changes.
    pub async fn stop_task(&self, task_id: TaskId, status: Status) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let update = stop_task_in(tx.as_mut(), task_id, status, now, Propagation::Resolve).await?;
        tx.commit().await?;

        let Some(update) = update else {
            return Ok(false);
        };
        if update.woke {
            self.notifier.notify();
        }
        info!(task_id = %task_id, status = %status, "Stopped task");
        self.statuses.project(&update.changed).await;
        Ok(true)
    }
}

/// Stop a task, its unfinished steps and its job inside `tx`. Returns `None`
/// when the task had already finished.
pub(crate) async fn stop_task_in(
    tx: &mut dyn Transaction,
    task_id: TaskId,
    status: Status,
    now: DateTime<Utc>,
    propagation: Propagation,
) -> Result<Option<JobUpdate>> {
    if !status.is_done() {
        return Err(Error::InvalidInput(format!(
            "cannot stop task {} with unfinished status {}",
            task_id, status
        )));
    }

    let mut task = tx.get_task(task_id).await?;
    if task.status.is_done() {
        return Ok(None);
    }
    task.status = status;
    task.stopped = Some(now);
    task.updated = now;
    if !tx.update_task(&task).await? {
        return Ok(None);
    }

    for mut step in tx.steps_of_task(task_id).await? {
        if step.stop(status, now) {
            tx.update_step(&step).await?;
        }
    }

    let mut job = tx.get_job(task.job_id).await?;
    if job.task_id != Some(task_id) || job.status.is_done() {
        return Ok(Some(JobUpdate::default()));
    }
    job.status = status;
    job.stopped = Some(now);
    job.updated = now;
    let update = update_run_job(tx, &job, JobGuard::AssignedTo(task_id), propagation, now).await?;
    Ok(Some(update))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use gantry_core::credential::IssuedToken;
    use gantry_core::repository::NewRepository;
    use gantry_core::run::{JobDescriptor, NewRun};
    use gantry_core::runner::{NewRunner, RunnerScope};
    use gantry_core::task::StepState;
    use gantry_core::{OwnerId, TriggerEvent, UserId};
    use gantry_db::MemoryDatabase;

    use crate::dispatcher::TaskDispatcher;
    use crate::run_store::insert_run_in;
    use crate::token::TokenSigner;

    struct Fixture {
        db: Arc<MemoryDatabase>,
        machine: TaskStateMachine,
        dispatcher: TaskDispatcher,
        runner: Runner,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(MemoryDatabase::new());
        let mut tx = db.begin().await.unwrap();
        let repo = tx
            .insert_repository(&NewRepository {
                owner_id: OwnerId::new(1),
                owner_name: "acme".to_string(),
                name: "widgets".to_string(),
            })
            .await
            .unwrap();
        let payload = r#"{"workflow":"CI","job":"a","name":"a","runs_on":["ubuntu"],
            "steps":[{"name":"one","run":"true"},{"name":"two","run":"true"}]}"#;
        let descriptor = |id: &str, needs: &[&str]| JobDescriptor {
            job_id: id.to_string(),
            name: id.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            runs_on: vec!["ubuntu".to_string()],
            payload: payload.to_string(),
        };
        insert_run_in(
            tx.as_mut(),
            &NewRun {
                repo_id: repo.id,
                owner_id: repo.owner_id,
                workflow_id: "ci.kdl".to_string(),
                trigger_user_id: UserId::new(1),
                git_ref: "refs/heads/main".to_string(),
                commit_sha: "abc123".to_string(),
                event: TriggerEvent::Push,
                trigger_event: TriggerEvent::Push,
                event_payload: "{}".to_string(),
                needs_approval: false,
            },
            &[descriptor("a", &[]), descriptor("b", &["a"])],
            Utc::now(),
        )
        .await
        .unwrap();
        let issued = IssuedToken::generate();
        let runner = tx
            .insert_runner(
                &NewRunner {
                    uuid: uuid::Uuid::new_v4(),
                    name: "r".to_string(),
                    scope: RunnerScope::Global,
                    labels: vec!["ubuntu".to_string()],
                    token_hash: issued.hash,
                    token_salt: issued.salt,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let notifier = TaskNotifier::new();
        let statuses = CommitStatusProjector::new(db.clone(), "http://ci.test".to_string());
        Fixture {
            machine: TaskStateMachine::new(db.clone(), notifier.clone(), statuses.clone()),
            dispatcher: TaskDispatcher::new(
                db.clone(),
                notifier,
                statuses,
                TokenSigner::new(b"key", TimeDelta::hours(1)),
            ),
            db,
            runner,
        }
    }

    fn report(id: TaskId, result: Option<Status>) -> TaskStateReport {
        TaskStateReport {
            id,
            result,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_final_report_finishes_task_and_releases_dependents() {
        let f = fixture().await;
        let picked = f.dispatcher.pick_task(&f.runner).await.unwrap().unwrap();

        let mut rep = report(picked.id, Some(Status::Success));
        rep.steps = vec![StepState {
            index: 0,
            result: Some(Status::Success),
            started_at: Some(Utc::now()),
            ..Default::default()
        }];
        rep.outputs.insert("version".to_string(), "1.2.3".to_string());
        let task = f.machine.update_task_by_state(&f.runner, &rep).await.unwrap();
        assert_eq!(task.status, Status::Success);
        assert!(task.stopped.is_some());

        let next = f.dispatcher.pick_task(&f.runner).await.unwrap().unwrap();
        assert_eq!(next.needs["a"].result, Status::Success);
        assert_eq!(next.needs["a"].outputs["version"], "1.2.3");

        let mut tx = f.db.begin().await.unwrap();
        let steps = tx.steps_of_task(picked.id).await.unwrap();
        assert_eq!(steps[0].status, Status::Success);
        assert_eq!(steps[1].status, Status::Waiting);
    }

    #[tokio::test]
    async fn test_heartbeat_report_keeps_task_running() {
        let f = fixture().await;
        let picked = f.dispatcher.pick_task(&f.runner).await.unwrap().unwrap();

        let task = f
            .machine
            .update_task_by_state(&f.runner, &report(picked.id, None))
            .await
            .unwrap();
        assert_eq!(task.status, Status::Running);
    }

    #[tokio::test]
    async fn test_reports_are_validated() {
        let f = fixture().await;
        let picked = f.dispatcher.pick_task(&f.runner).await.unwrap().unwrap();

        let err = f
            .machine
            .update_task_by_state(&f.runner, &report(picked.id, Some(Status::Running)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let mut stranger = f.runner.clone();
        stranger.id = gantry_core::RunnerId::new(4242);
        let err = f
            .machine
            .update_task_by_state(&stranger, &report(picked.id, Some(Status::Success)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_reports_on_finished_tasks_are_ignored() {
        let f = fixture().await;
        let picked = f.dispatcher.pick_task(&f.runner).await.unwrap().unwrap();

        f.machine
            .update_task_by_state(&f.runner, &report(picked.id, Some(Status::Failure)))
            .await
            .unwrap();
        let task = f
            .machine
            .update_task_by_state(&f.runner, &report(picked.id, Some(Status::Success)))
            .await
            .unwrap();
        assert_eq!(task.status, Status::Failure);
    }

    #[tokio::test]
    async fn test_stop_task_closes_steps_and_job() {
        let f = fixture().await;
        let picked = f.dispatcher.pick_task(&f.runner).await.unwrap().unwrap();

        assert!(f.machine.stop_task(picked.id, Status::Waiting).await.is_err());
        assert!(f.machine.stop_task(picked.id, Status::Cancelled).await.unwrap());
        assert!(!f.machine.stop_task(picked.id, Status::Failure).await.unwrap());

        let mut tx = f.db.begin().await.unwrap();
        let task = tx.get_task(picked.id).await.unwrap();
        assert_eq!(task.status, Status::Cancelled);
        let steps = tx.steps_of_task(picked.id).await.unwrap();
        assert!(steps.iter().all(|s| s.status == Status::Cancelled && s.started.is_some()));
        let jobs = tx.jobs_of_run(picked.run_id).await.unwrap();
        assert_eq!(jobs[0].status, Status::Cancelled);
        assert_eq!(jobs[1].status, Status::Skipped);
        assert_eq!(tx.get_run(picked.run_id).await.unwrap().status, Status::Cancelled);
    }
}
