//! Run scheduling and task dispatch for Gantry.
//!
//! Every operation runs in one [`gantry_db::Transaction`]. Correctness under
//! concurrent callers rests on the conditional job claim and the run version
//! check, never on in-process locks. The only shared in-process state is the
//! [`TaskNotifier`] that wakes long-polling runners.

pub mod cancellation;
pub mod commit_status;
pub mod context;
pub mod dispatcher;
mod jobs;
pub mod maintenance;
pub mod materializer;
pub mod notifier;
pub mod run_store;
pub mod runners;
pub mod schedule;
pub mod task_state;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use gantry_config::SystemConfig;
use gantry_config::system::to_delta;
use gantry_core::runner::RunnerThresholds;
use gantry_db::Database;

pub use cancellation::CancellationEngine;
pub use commit_status::CommitStatusProjector;
pub use dispatcher::TaskDispatcher;
pub use maintenance::{MaintenanceReport, MaintenanceWorker, Sweeper};
pub use materializer::{Materialized, materialize};
pub use notifier::TaskNotifier;
pub use run_store::{InsertedRun, RunStore};
pub use runners::RunnerRegistry;
pub use schedule::{ScheduleReport, ScheduleTrigger};
pub use task_state::TaskStateMachine;
pub use token::{RuntimeClaims, TokenError, TokenSigner};

/// Tunables of the scheduler, usually taken from the system configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base of commit status target URLs.
    pub public_url: String,
    pub thresholds: RunnerThresholds,
    pub zombie_after: TimeDelta,
    pub endless_after: TimeDelta,
    pub abandoned_after: TimeDelta,
    pub poll_timeout: Duration,
    pub schedule_interval: Duration,
    pub schedule_page_size: usize,
    pub schedule_lookahead: TimeDelta,
    pub maintenance_interval: Duration,
    pub token_secret: String,
    pub token_ttl: TimeDelta,
}

impl SchedulerConfig {
    pub fn from_system(config: &SystemConfig) -> Self {
        Self {
            public_url: config.server.public_url.clone(),
            thresholds: config.runner.thresholds(),
            zombie_after: to_delta(config.tasks.zombie_after),
            endless_after: to_delta(config.tasks.endless_after),
            abandoned_after: to_delta(config.tasks.abandoned_after),
            poll_timeout: config.poll.timeout,
            schedule_interval: config.schedule.interval,
            schedule_page_size: config.schedule.page_size,
            schedule_lookahead: to_delta(config.schedule.lookahead),
            maintenance_interval: config.maintenance.interval,
            token_secret: config.token.secret.clone(),
            token_ttl: to_delta(config.token.ttl),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_system(&SystemConfig::default())
    }
}

/// All scheduler components wired to one database and one notifier.
#[derive(Clone)]
pub struct Scheduler {
    pub runs: RunStore,
    pub runners: RunnerRegistry,
    pub dispatcher: TaskDispatcher,
    pub tasks: TaskStateMachine,
    pub cancellation: CancellationEngine,
    pub schedules: ScheduleTrigger,
    pub statuses: CommitStatusProjector,
    pub sweeper: Sweeper,
    pub notifier: TaskNotifier,
    config: Arc<SchedulerConfig>,
}

impl Scheduler {
    pub fn new(db: Arc<dyn Database>, config: SchedulerConfig) -> Self {
        let config = Arc::new(config);
        let notifier = TaskNotifier::new();
        let statuses = CommitStatusProjector::new(db.clone(), config.public_url.clone());
        let signer = TokenSigner::new(config.token_secret.as_bytes(), config.token_ttl);
        let tasks = TaskStateMachine::new(db.clone(), notifier.clone(), statuses.clone());
        let cancellation =
            CancellationEngine::new(db.clone(), notifier.clone(), statuses.clone());

        Self {
            runs: RunStore::new(db.clone(), notifier.clone(), statuses.clone()),
            runners: RunnerRegistry::new(db.clone(), config.thresholds),
            dispatcher: TaskDispatcher::new(
                db.clone(),
                notifier.clone(),
                statuses.clone(),
                signer,
            ),
            schedules: ScheduleTrigger::new(
                db.clone(),
                notifier.clone(),
                statuses.clone(),
                config.schedule_page_size,
                config.schedule_lookahead,
            ),
            sweeper: Sweeper::new(db, tasks.clone(), cancellation.clone(), &config),
            tasks,
            cancellation,
            statuses,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Long-running worker that fires due schedules and sweeps stale tasks
    /// and jobs.
    pub fn maintenance_worker(&self) -> MaintenanceWorker {
        MaintenanceWorker::new(
            self.schedules.clone(),
            self.sweeper.clone(),
            self.config.schedule_interval,
            self.config.maintenance_interval,
        )
    }
}
