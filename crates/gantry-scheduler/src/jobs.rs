//! Writing a job and carrying the change to its siblings and its run.

use chrono::{DateTime, Utc};
use gantry_core::run::{Run, RunJob, resolve_blocked_jobs};
use gantry_core::{Error, JobId, Result, Status};
use gantry_db::{JobGuard, Transaction};

use crate::run_store::update_run_in;

/// What happens after a job write besides re-aggregating the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Propagation {
    /// Release or skip Blocked siblings when the job finished.
    Resolve,
    /// Only re-aggregate the run. Used when every open job of the run is
    /// being closed anyway.
    AggregateOnly,
}

/// Effects of a job write.
#[derive(Debug, Default)]
pub(crate) struct JobUpdate {
    /// Rows written for the job itself; zero when its guard did not hold.
    pub rows: u64,
    /// Every job written, the job itself first.
    pub changed: Vec<JobId>,
    /// Some job became Waiting.
    pub woke: bool,
}

impl JobUpdate {
    pub(crate) fn absorb(&mut self, other: JobUpdate) {
        self.changed.extend(other.changed);
        self.woke |= other.woke;
    }
}

/// Write `job` if the stored row satisfies `guard`, then resolve Blocked
/// siblings and re-aggregate the run in the same transaction.
pub(crate) async fn update_run_job(
    tx: &mut dyn Transaction,
    job: &RunJob,
    guard: JobGuard,
    propagation: Propagation,
    now: DateTime<Utc>,
) -> Result<JobUpdate> {
    let rows = tx.update_job(job, guard).await?;
    if rows == 0 {
        return Ok(JobUpdate::default());
    }

    let mut update = JobUpdate {
        rows,
        changed: vec![job.id],
        woke: job.status == Status::Waiting,
    };

    let mut run = tx.get_run(job.run_id).await?;
    let mut jobs = tx.jobs_of_run(job.run_id).await?;
    if propagation == Propagation::Resolve && job.status.is_done() {
        update.absorb(resolve_run_jobs(tx, &run, &mut jobs, now).await?);
    }
    sync_run_status(tx, &mut run, &jobs, now).await?;

    Ok(update)
}

/// Move Blocked jobs whose needs have all finished to Waiting or Skipped.
/// `jobs` is updated in place.
pub(crate) async fn resolve_run_jobs(
    tx: &mut dyn Transaction,
    run: &Run,
    jobs: &mut [RunJob],
    now: DateTime<Utc>,
) -> Result<JobUpdate> {
    let mut update = JobUpdate::default();
    for (id, status) in resolve_blocked_jobs(jobs, run.approval_pending()) {
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            continue;
        };
        job.status = status;
        job.updated = now;
        if status == Status::Skipped {
            job.stopped = Some(now);
        }
        if tx.update_job(job, JobGuard::StatusIs(Status::Blocked)).await? == 0 {
            return Err(Error::ConcurrentModification(format!(
                "job {} has changed",
                id
            )));
        }
        update.rows += 1;
        update.changed.push(id);
        update.woke |= status == Status::Waiting;
    }
    Ok(update)
}

/// Store the run's aggregate status and timing if they changed.
pub(crate) async fn sync_run_status(
    tx: &mut dyn Transaction,
    run: &mut Run,
    jobs: &[RunJob],
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut next = run.clone();
    next.status = Status::aggregate(jobs.iter().map(|j| j.status));
    if next.status == Status::Running && next.started.is_none() {
        next.started = Some(now);
    }
    if next.status.is_done() && next.stopped.is_none() {
        next.stopped = Some(now);
    }
    if next == *run {
        return Ok(false);
    }

    next.updated = now;
    *run = update_run_in(tx, &next, run.version).await?;
    Ok(true)
}
