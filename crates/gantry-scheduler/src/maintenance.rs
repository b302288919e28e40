//! Periodic maintenance: firing schedules and sweeping stale work.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use gantry_core::{Error, Result, Status};
use gantry_db::{Database, JobFilter, TaskFilter};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::SchedulerConfig;
use crate::cancellation::CancellationEngine;
use crate::schedule::ScheduleTrigger;
use crate::task_state::TaskStateMachine;

/// What one sweep stopped or cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Running tasks whose heartbeat went stale.
    pub zombies: usize,
    /// Running tasks that exceeded the maximum run time.
    pub endless: usize,
    /// Waiting or blocked jobs nobody picked up.
    pub abandoned: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct Sweeper {
    db: Arc<dyn Database>,
    tasks: TaskStateMachine,
    cancellation: CancellationEngine,
    zombie_after: TimeDelta,
    endless_after: TimeDelta,
    abandoned_after: TimeDelta,
}

impl Sweeper {
    pub fn new(
        db: Arc<dyn Database>,
        tasks: TaskStateMachine,
        cancellation: CancellationEngine,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            db,
            tasks,
            cancellation,
            zombie_after: config.zombie_after,
            endless_after: config.endless_after,
            abandoned_after: config.abandoned_after,
        }
    }

    /// Run every sweep once, measuring staleness against `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let report = MaintenanceReport {
            zombies: self.stop_zombie_tasks(now).await?,
            endless: self.stop_endless_tasks(now).await?,
            abandoned: self.cancel_abandoned_jobs(now).await?,
        };
        if !report.is_empty() {
            info!(
                zombies = report.zombies,
                endless = report.endless,
                abandoned = report.abandoned,
                "Swept stale work"
            );
        }
        Ok(report)
    }

    /// Fail running tasks whose runner stopped reporting.
    pub async fn stop_zombie_tasks(&self, now: DateTime<Utc>) -> Result<usize> {
        self.stop_tasks(
            TaskFilter {
                status: Some(Status::Running),
                updated_before: Some(cutoff(now, self.zombie_after)?),
                ..Default::default()
            },
            "zombie",
        )
        .await
    }

    /// Fail running tasks that have been running for too long.
    pub async fn stop_endless_tasks(&self, now: DateTime<Utc>) -> Result<usize> {
        self.stop_tasks(
            TaskFilter {
                status: Some(Status::Running),
                started_before: Some(cutoff(now, self.endless_after)?),
                ..Default::default()
            },
            "endless",
        )
        .await
    }

    async fn stop_tasks(&self, filter: TaskFilter, kind: &str) -> Result<usize> {
        let tasks = {
            let mut tx = self.db.begin().await?;
            tx.find_tasks(&filter).await?
        };

        let mut stopped = 0;
        for task in tasks {
            match self.tasks.stop_task(task.id, Status::Failure).await {
                Ok(true) => {
                    debug!(task_id = %task.id, kind, "Stopped stale task");
                    stopped += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(task_id = %task.id, kind, error = %e, "Failed to stop stale task"),
            }
        }
        Ok(stopped)
    }

    /// Cancel jobs that sat waiting or blocked for too long. A job dispatched
    /// in the meantime is left to its task.
    pub async fn cancel_abandoned_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let jobs = {
            let mut tx = self.db.begin().await?;
            tx.find_jobs(&JobFilter {
                statuses: vec![Status::Waiting, Status::Blocked],
                updated_before: Some(cutoff(now, self.abandoned_after)?),
                ..Default::default()
            })
            .await?
        };

        let mut cancelled = 0;
        for job in jobs {
            match self.cancellation.cancel_job(job.id).await {
                Ok(_) => cancelled += 1,
                Err(e) if e.is_concurrent_modification() => {
                    debug!(job_id = %job.id, "Abandoned job was picked up concurrently");
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to cancel abandoned job"),
            }
        }
        Ok(cancelled)
    }
}

/// `now - age`, or an error when the age reaches past the representable range.
fn cutoff(now: DateTime<Utc>, age: TimeDelta) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(age)
        .ok_or_else(|| Error::InvalidInput(format!("staleness threshold {} is out of range", age)))
}

/// Shortest period the worker ticks at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Background loop driving [`ScheduleTrigger`] and [`Sweeper`] on their
/// intervals.
pub struct MaintenanceWorker {
    schedules: ScheduleTrigger,
    sweeper: Sweeper,
    schedule_interval: Duration,
    maintenance_interval: Duration,
}

impl MaintenanceWorker {
    pub fn new(
        schedules: ScheduleTrigger,
        sweeper: Sweeper,
        schedule_interval: Duration,
        maintenance_interval: Duration,
    ) -> Self {
        Self {
            schedules,
            sweeper,
            schedule_interval: clamp_interval("schedule", schedule_interval),
            maintenance_interval: clamp_interval("maintenance", maintenance_interval),
        }
    }

    /// Run the maintenance loop. Never returns; abort the task to stop it.
    pub async fn run(&self) {
        info!(
            schedule_interval = ?self.schedule_interval,
            maintenance_interval = ?self.maintenance_interval,
            "Starting maintenance worker"
        );

        let mut schedule_tick = interval(self.schedule_interval);
        schedule_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = interval(self.maintenance_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = schedule_tick.tick() => {
                    if let Err(e) = self.schedules.start_schedule_tasks(Utc::now()).await {
                        error!(error = %e, "Failed to process schedules");
                    }
                }
                _ = sweep_tick.tick() => {
                    if let Err(e) = self.sweeper.sweep(Utc::now()).await {
                        error!(error = %e, "Failed to sweep stale work");
                    }
                }
            }
        }
    }
}

fn clamp_interval(name: &str, period: Duration) -> Duration {
    if period < MIN_INTERVAL {
        warn!(interval = name, requested = ?period, "Interval too short, using the minimum");
        return MIN_INTERVAL;
    }
    period
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::repository::NewRepository;
    use gantry_core::run::{JobDescriptor, NewRun};
    use gantry_core::runner::Runner;
    use gantry_core::{OwnerId, RunId, TriggerEvent, UserId};
    use gantry_db::MemoryDatabase;

    use crate::Scheduler;

    struct Fixture {
        db: Arc<MemoryDatabase>,
        scheduler: Scheduler,
        runner: Runner,
        run_id: RunId,
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
        tx.commit().await.unwrap();

        let scheduler = Scheduler::new(db.clone(), SchedulerConfig::default());
        let descriptor = |id: &str, needs: &[&str]| JobDescriptor {
            job_id: id.to_string(),
            name: id.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            runs_on: vec!["ubuntu".to_string()],
            payload: "{}".to_string(),
        };
        let inserted = scheduler
            .runs
            .insert_run(
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
            )
            .await
            .unwrap();
        let runner = scheduler
            .runners
            .register("builder", None, None, vec!["ubuntu".to_string()])
            .await
            .unwrap()
            .runner;

        Fixture {
            db,
            scheduler,
            runner,
            run_id: inserted.run.id,
        }
    }

    #[tokio::test]
    async fn test_zombie_task_fails_once() {
        let f = fixture().await;
        let picked = f.scheduler.dispatcher.pick_task(&f.runner).await.unwrap().unwrap();
        let sweeper = &f.scheduler.sweeper;

        let now = Utc::now();
        assert!(sweeper.sweep(now).await.unwrap().is_empty());

        let later = now + TimeDelta::minutes(20);
        let report = sweeper.sweep(later).await.unwrap();
        assert_eq!(report.zombies, 1);
        assert_eq!(report.endless, 0);
        assert!(sweeper.sweep(later).await.unwrap().is_empty());

        let mut tx = f.db.begin().await.unwrap();
        assert_eq!(tx.get_task(picked.id).await.unwrap().status, Status::Failure);
        let jobs = tx.jobs_of_run(f.run_id).await.unwrap();
        assert_eq!(jobs[0].status, Status::Failure);
        assert_eq!(jobs[1].status, Status::Skipped);
        assert_eq!(tx.get_run(f.run_id).await.unwrap().status, Status::Failure);
    }

    #[tokio::test]
    async fn test_endless_task_fails_despite_heartbeats() {
        let f = fixture().await;
        let picked = f.scheduler.dispatcher.pick_task(&f.runner).await.unwrap().unwrap();
        let later = Utc::now() + TimeDelta::hours(4);

        let mut tx = f.db.begin().await.unwrap();
        let mut task = tx.get_task(picked.id).await.unwrap();
        task.updated = later;
        assert!(tx.update_task(&task).await.unwrap());
        tx.commit().await.unwrap();

        let report = f.scheduler.sweeper.sweep(later).await.unwrap();
        assert_eq!(report.zombies, 0);
        assert_eq!(report.endless, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_threshold_is_an_error() {
        let f = fixture().await;
        let config = SchedulerConfig {
            abandoned_after: TimeDelta::MAX,
            ..SchedulerConfig::default()
        };
        let sweeper = Sweeper::new(
            f.db.clone(),
            f.scheduler.tasks.clone(),
            f.scheduler.cancellation.clone(),
            &config,
        );

        let err = sweeper.sweep(Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let mut tx = f.db.begin().await.unwrap();
        let jobs = tx.jobs_of_run(f.run_id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status != Status::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_worker_keeps_running() {
        let f = fixture().await;
        let worker = MaintenanceWorker::new(
            f.scheduler.schedules.clone(),
            f.scheduler.sweeper.clone(),
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(worker.schedule_interval, MIN_INTERVAL);
        assert_eq!(worker.maintenance_interval, MIN_INTERVAL);

        let handle = tokio::spawn(async move { worker.run().await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_abandoned_jobs_are_cancelled() {
        let f = fixture().await;
        let sweeper = &f.scheduler.sweeper;

        let report = sweeper.sweep(Utc::now() + TimeDelta::days(2)).await.unwrap();
        assert_eq!(report.abandoned, 2);

        let mut tx = f.db.begin().await.unwrap();
        let jobs = tx.jobs_of_run(f.run_id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == Status::Cancelled));
        assert_eq!(tx.get_run(f.run_id).await.unwrap().status, Status::Cancelled);
    }
}
