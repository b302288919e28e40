//! Projects job status onto commit statuses of the triggering commit.
//!
//! Projection is a side effect of scheduling. Failures are logged and
//! swallowed; they never fail the operation that caused them.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use gantry_core::commit_status::{CommitStatus, describe};
use gantry_core::run::{JobPayload, Run, RunJob};
use gantry_core::{JobId, Result, TriggerEvent};
use gantry_db::Database;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct CommitStatusProjector {
    db: Arc<dyn Database>,
    public_url: String,
}

impl CommitStatusProjector {
    pub fn new(db: Arc<dyn Database>, public_url: String) -> Self {
        Self {
            db,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Report the current status of each job. Errors are logged per job.
    pub async fn project(&self, jobs: &[JobId]) {
        for &job_id in jobs {
            if let Err(e) = self.project_job(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to create commit status");
            }
        }
    }

    /// Report the status of one job. Returns whether a status was written:
    /// nothing is written for events without a status label, or when the
    /// latest status of the same context already has the same state.
    pub async fn project_job(&self, job_id: JobId) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let job = tx.get_job(job_id).await?;
        let run = tx.get_run(job.run_id).await?;

        let Some(label) = run.event.commit_status_label(run.trigger_event) else {
            return Ok(false);
        };
        let repo = tx.get_repository(run.repo_id).await?;
        let sha = status_sha(&run);
        let context = format!("{} / {} ({})", workflow_name(&run, &job), job.name, label);
        let (state, description) = describe(job.status, job.duration(now));

        if let Some(latest) = tx.latest_commit_status(run.repo_id, &sha, &context).await? {
            if latest.state == state {
                debug!(job_id = %job_id, context = %context, "Commit status unchanged");
                return Ok(false);
            }
        }

        let position = tx
            .jobs_of_run(run.id)
            .await?
            .iter()
            .position(|j| j.id == job.id)
            .unwrap_or(0);
        let target_url = format!(
            "{}/{}/actions/runs/{}/jobs/{}",
            self.public_url,
            repo.full_name(),
            run.index,
            position
        );

        tx.insert_commit_status(&CommitStatus {
            repo_id: run.repo_id,
            sha,
            context,
            state,
            description,
            target_url,
            created: now,
        })
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

/// Display name of the workflow: the name in the job payload, else the file
/// name of the workflow.
fn workflow_name(run: &Run, job: &RunJob) -> String {
    serde_json::from_str::<JobPayload>(&job.payload)
        .ok()
        .map(|p| p.workflow)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            Path::new(&run.workflow_id)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| run.workflow_id.clone())
        })
}

/// The commit a status belongs to: the pushed head commit or the pull
/// request head when the event payload names one, else the run's commit.
fn status_sha(run: &Run) -> String {
    let payload: serde_json::Value = serde_json::from_str(&run.event_payload).unwrap_or_default();
    let pointer = match run.event {
        TriggerEvent::Push => "/head_commit/id",
        TriggerEvent::Release => return run.commit_sha.clone(),
        _ => "/pull_request/head/sha",
    };
    payload
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| run.commit_sha.clone())
}
