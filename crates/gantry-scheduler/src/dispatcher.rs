//! Claiming waiting jobs for polling runners.
//!
//! A claim is one transaction: pick the oldest Waiting job the runner can see
//! and serve, create its task, and flip the job to Running with a write that
//! only succeeds while the job is still Waiting and unassigned. When two
//! runners race for the same job exactly one write matches; the loser sees
//! "no eligible job" and polls again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gantry_core::credential::IssuedToken;
use gantry_core::run::{JobPayload, RunJob};
use gantry_core::runner::{Runner, labels_match};
use gantry_core::secret::merge_scoped;
use gantry_core::task::{NewTask, TaskDescriptor, TaskNeed};
use gantry_core::{Result, Status};
use gantry_db::{Database, JobGuard, Transaction};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::commit_status::CommitStatusProjector;
use crate::context::{TaskCredentials, build_context};
use crate::jobs::{Propagation, update_run_job};
use crate::notifier::TaskNotifier;
use crate::token::TokenSigner;

#[derive(Clone)]
pub struct TaskDispatcher {
    db: Arc<dyn Database>,
    notifier: TaskNotifier,
    statuses: CommitStatusProjector,
    signer: TokenSigner,
}

impl TaskDispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        notifier: TaskNotifier,
        statuses: CommitStatusProjector,
        signer: TokenSigner,
    ) -> Self {
        Self {
            db,
            notifier,
            statuses,
            signer,
        }
    }

    /// Claim one eligible job for `runner`. `Ok(None)` means there was no
    /// eligible job, including when another runner won the claim.
    pub async fn pick_task(&self, runner: &Runner) -> Result<Option<TaskDescriptor>> {
        match self.try_pick(runner, Utc::now()).await {
            Ok(Some((descriptor, job))) => {
                info!(
                    task_id = %descriptor.id,
                    job_id = %job.id,
                    runner_id = %runner.id,
                    attempt = job.attempt,
                    "Picked task"
                );
                self.statuses.project(&[job.id]).await;
                Ok(Some(descriptor))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_concurrent_modification() => {
                debug!(runner_id = %runner.id, error = %e, "Lost claim race");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait up to `timeout` for a task, re-trying whenever a job becomes
    /// Waiting.
    pub async fn poll_for_task(
        &self,
        runner: &Runner,
        timeout: Duration,
    ) -> Result<Option<TaskDescriptor>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Subscribe before reading so a wake between the read and the
            // wait is not lost.
            let mut wake = self.notifier.subscribe();
            if let Some(task) = self.pick_task(runner).await? {
                return Ok(Some(task));
            }
            match tokio::time::timeout_at(deadline, wake.recv()).await {
                Err(_) | Ok(Err(RecvError::Closed)) => return Ok(None),
                Ok(Ok(())) | Ok(Err(RecvError::Lagged(_))) => continue,
            }
        }
    }

    async fn try_pick(
        &self,
        runner: &Runner,
        now: DateTime<Utc>,
    ) -> Result<Option<(TaskDescriptor, RunJob)>> {
        let mut tx = self.db.begin().await?;

        let Some(mut job) = tx
            .waiting_jobs(runner.scope)
            .await?
            .into_iter()
            .find(|job| labels_match(&job.runs_on, &runner.labels))
        else {
            return Ok(None);
        };
        let run = tx.get_run(job.run_id).await?;
        let repo = tx.get_repository(job.repo_id).await?;

        let issued = IssuedToken::generate();
        let task = tx
            .insert_task(&NewTask {
                job_id: job.id,
                run_id: job.run_id,
                repo_id: job.repo_id,
                owner_id: job.owner_id,
                runner_id: runner.id,
                attempt: job.attempt + 1,
                token_hash: issued.hash,
                token_salt: issued.salt,
                now,
            })
            .await?;

        job.task_id = Some(task.id);
        job.runner_id = Some(runner.id);
        job.attempt = task.attempt;
        job.status = Status::Running;
        job.started = Some(now);
        job.updated = now;
        let claimed = update_run_job(
            tx.as_mut(),
            &job,
            JobGuard::Claimable,
            Propagation::AggregateOnly,
            now,
        )
        .await?;
        if claimed.rows == 0 {
            return Ok(None);
        }

        tx.insert_steps(task.id, &step_names(&job)).await?;
        let needs = task_needs(tx.as_mut(), &job).await?;
        let secrets = merge_scoped(
            tx.secrets_for(job.repo_id, job.owner_id)
                .await?
                .into_iter()
                .map(|s| (s.level, s.name, s.value)),
        );
        let vars = merge_scoped(
            tx.variables_for(job.repo_id, job.owner_id)
                .await?
                .into_iter()
                .map(|v| (v.level, v.name, v.value)),
        );
        let runtime_token = self.signer.mint(task.id, job.id, run.id, now)?;
        tx.commit().await?;

        let context = build_context(
            &repo,
            &run,
            &job,
            TaskCredentials {
                token: &issued.token,
                runtime_token: &runtime_token,
            },
        );

        let descriptor = TaskDescriptor {
            id: task.id,
            job_id: job.id,
            run_id: run.id,
            payload: job.payload.clone(),
            context,
            secrets,
            vars,
            needs,
        };
        Ok(Some((descriptor, job)))
    }
}

/// Step names of a job payload. Payloads from other parsers carry no steps.
fn step_names(job: &RunJob) -> Vec<String> {
    serde_json::from_str::<JobPayload>(&job.payload)
        .map(|p| p.steps.into_iter().map(|s| s.name).collect())
        .unwrap_or_default()
}

/// Outputs and results of the jobs `job` needs, keyed by job id.
async fn task_needs(
    tx: &mut dyn Transaction,
    job: &RunJob,
) -> Result<BTreeMap<String, TaskNeed>> {
    let mut needs = BTreeMap::new();
    if job.needs.is_empty() {
        return Ok(needs);
    }
    for sibling in tx.jobs_of_run(job.run_id).await? {
        if !job.needs.contains(&sibling.job_id) {
            continue;
        }
        let outputs = match sibling.task_id {
            Some(task_id) => tx.task_outputs(task_id).await?,
            None => BTreeMap::new(),
        };
        needs.insert(
            sibling.job_id,
            TaskNeed {
                outputs,
                result: sibling.status,
            },
        );
    }
    Ok(needs)
}
