//! Runs and the jobs of their dependency graph.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, OwnerId, RepoId, RunId, RunnerId, Status, TaskId, TriggerEvent, UserId};

/// One invocation of a workflow file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    /// Workflow file name, e.g. `ci.kdl`.
    pub workflow_id: String,
    /// Per-repository sequence number, starting at 1.
    pub index: i64,
    pub trigger_user_id: UserId,
    pub git_ref: String,
    pub commit_sha: String,
    /// The event the workflow declared it responds to.
    pub event: TriggerEvent,
    /// The event that actually created this run (differs for scheduled runs).
    pub trigger_event: TriggerEvent,
    pub event_payload: String,
    pub needs_approval: bool,
    pub approved_by: Option<UserId>,
    pub status: Status,
    /// Optimistic-lock counter, bumped on every update.
    pub version: i32,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    /// Elapsed seconds of earlier attempts, accumulated when a run is re-run.
    pub previous_duration_secs: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Run {
    /// Total run time across attempts.
    pub fn duration(&self, now: DateTime<Utc>) -> TimeDelta {
        elapsed(self.started, self.stopped, self.status, now)
            + TimeDelta::seconds(self.previous_duration_secs)
    }

    /// A run whose approval has been requested but not yet granted.
    pub fn approval_pending(&self) -> bool {
        self.needs_approval && self.approved_by.is_none()
    }
}

/// Fields of a run supplied by the caller at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub workflow_id: String,
    pub trigger_user_id: UserId,
    pub git_ref: String,
    pub commit_sha: String,
    pub event: TriggerEvent,
    pub trigger_event: TriggerEvent,
    pub event_payload: String,
    pub needs_approval: bool,
}

/// One job within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub id: JobId,
    pub run_id: RunId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub commit_sha: String,
    /// Key of the job in the workflow file.
    pub job_id: String,
    pub name: String,
    /// Serialized job definition without its `needs` list.
    pub payload: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub task_id: Option<TaskId>,
    pub runner_id: Option<RunnerId>,
    pub attempt: i64,
    pub status: Status,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl RunJob {
    pub fn duration(&self, now: DateTime<Utc>) -> TimeDelta {
        elapsed(self.started, self.stopped, self.status, now)
    }
}

/// A job ready to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunJob {
    pub job_id: String,
    pub name: String,
    pub payload: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub status: Status,
}

/// A job as produced by the workflow parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub name: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    /// Serialized job definition handed to the runner.
    pub payload: String,
}

/// The executable part of a job, as serialized into [`RunJob::payload`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub workflow: String,
    pub job: String,
    pub name: String,
    pub runs_on: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<StepPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPayload {
    pub name: String,
    pub run: String,
}

/// Status a freshly materialized job starts in.
pub fn initial_job_status(needs: &[String], needs_approval: bool) -> Status {
    if needs_approval || !needs.is_empty() {
        Status::Blocked
    } else {
        Status::Waiting
    }
}

/// Re-evaluate every Blocked job of a run against its dependencies.
///
/// A Blocked job becomes Waiting once every job it needs has finished with
/// Success or Skipped, and Skipped once every need has finished and at least
/// one did not succeed. Skips cascade until nothing changes. Nothing is
/// released while the run's approval is pending. Needs naming a job that does
/// not exist in the run count as failed.
///
/// Returns the jobs whose status changed with their new status.
pub fn resolve_blocked_jobs(jobs: &[RunJob], approval_pending: bool) -> Vec<(JobId, Status)> {
    if approval_pending {
        return Vec::new();
    }

    let mut current: HashMap<&str, Status> =
        jobs.iter().map(|j| (j.job_id.as_str(), j.status)).collect();
    let mut changed: Vec<(JobId, Status)> = Vec::new();

    loop {
        let mut progressed = false;
        for job in jobs {
            if current.get(job.job_id.as_str()) != Some(&Status::Blocked) {
                continue;
            }
            let Some(next) = dependency_outcome(&job.needs, &current) else {
                continue;
            };
            current.insert(job.job_id.as_str(), next);
            changed.push((job.id, next));
            progressed = true;
        }
        if !progressed {
            return changed;
        }
    }
}

fn dependency_outcome(needs: &[String], current: &HashMap<&str, Status>) -> Option<Status> {
    let mut all_passed = true;
    for need in needs {
        match current.get(need.as_str()) {
            Some(status) if !status.is_done() => return None,
            Some(status) => all_passed &= status.satisfies_dependency(),
            None => all_passed = false,
        }
    }
    Some(if all_passed {
        Status::Waiting
    } else {
        Status::Skipped
    })
}

/// Plan the job resets of a re-run.
///
/// With no target every job is reset: jobs with needs (or all jobs when the run
/// awaits approval) go to Blocked, the rest to Waiting. With a target job only
/// that job and everything that transitively needs it are reset: the target to
/// Waiting, its dependents to Blocked.
pub fn plan_rerun(
    jobs: &[RunJob],
    target: Option<&str>,
    approval_pending: bool,
) -> Vec<(JobId, Status)> {
    let Some(target) = target else {
        return jobs
            .iter()
            .map(|job| (job.id, initial_job_status(&job.needs, approval_pending)))
            .collect();
    };

    let mut affected: HashSet<&str> = HashSet::from([target]);
    loop {
        let before = affected.len();
        for job in jobs {
            if job.needs.iter().any(|n| affected.contains(n.as_str())) {
                affected.insert(job.job_id.as_str());
            }
        }
        if affected.len() == before {
            break;
        }
    }

    jobs.iter()
        .filter(|job| affected.contains(job.job_id.as_str()))
        .map(|job| {
            let status = if job.job_id == target && !approval_pending {
                Status::Waiting
            } else {
                Status::Blocked
            };
            (job.id, status)
        })
        .collect()
}

fn elapsed(
    started: Option<DateTime<Utc>>,
    stopped: Option<DateTime<Utc>>,
    status: Status,
    now: DateTime<Utc>,
) -> TimeDelta {
    let Some(started) = started else {
        return TimeDelta::zero();
    };
    let end = match stopped {
        Some(stopped) if status.is_done() => stopped,
        _ => now,
    };
    (end - started).max(TimeDelta::zero())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn job(id: i64, key: &str, needs: &[&str], status: Status) -> RunJob {
        let now = Utc::now();
        RunJob {
            id: JobId::new(id),
            run_id: RunId::new(1),
            repo_id: RepoId::new(1),
            owner_id: OwnerId::new(1),
            commit_sha: "abc".into(),
            job_id: key.into(),
            name: key.into(),
            payload: String::new(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            runs_on: vec!["ubuntu".into()],
            task_id: None,
            runner_id: None,
            attempt: 0,
            status,
            started: None,
            stopped: None,
            created: now,
            updated: now,
        }
    }

    #[test]
    fn test_initial_status() {
        assert_eq!(initial_job_status(&[], false), Status::Waiting);
        assert_eq!(initial_job_status(&["a".into()], false), Status::Blocked);
        assert_eq!(initial_job_status(&[], true), Status::Blocked);
    }

    #[test]
    fn test_release_when_needs_succeed() {
        let jobs = vec![
            job(1, "a", &[], Status::Success),
            job(2, "b", &["a"], Status::Blocked),
        ];
        assert_eq!(resolve_blocked_jobs(&jobs, false), vec![(JobId::new(2), Status::Waiting)]);
    }

    #[test]
    fn test_stay_blocked_while_a_need_runs() {
        let jobs = vec![
            job(1, "a", &[], Status::Success),
            job(2, "b", &[], Status::Running),
            job(3, "c", &["a", "b"], Status::Blocked),
        ];
        assert!(resolve_blocked_jobs(&jobs, false).is_empty());
    }

    #[test]
    fn test_failure_skips_dependents_transitively() {
        let jobs = vec![
            job(1, "a", &[], Status::Failure),
            job(2, "b", &["a"], Status::Blocked),
            job(3, "c", &["b"], Status::Blocked),
        ];
        let changed = resolve_blocked_jobs(&jobs, false);
        assert_eq!(
            changed,
            vec![(JobId::new(2), Status::Skipped), (JobId::new(3), Status::Skipped)]
        );
    }

    #[test]
    fn test_skipped_need_counts_as_success() {
        let jobs = vec![
            job(1, "a", &[], Status::Skipped),
            job(2, "b", &["a"], Status::Blocked),
        ];
        assert_eq!(resolve_blocked_jobs(&jobs, false), vec![(JobId::new(2), Status::Waiting)]);
    }

    #[test]
    fn test_approval_holds_everything() {
        let jobs = vec![job(1, "a", &[], Status::Blocked)];
        assert!(resolve_blocked_jobs(&jobs, true).is_empty());
        assert_eq!(resolve_blocked_jobs(&jobs, false), vec![(JobId::new(1), Status::Waiting)]);
    }

    #[test]
    fn test_plan_rerun_single_job_and_dependents() {
        let jobs = vec![
            job(1, "a", &[], Status::Success),
            job(2, "b", &["a"], Status::Failure),
            job(3, "c", &["b"], Status::Skipped),
            job(4, "d", &[], Status::Success),
        ];
        let plan = plan_rerun(&jobs, Some("b"), false);
        assert_eq!(
            plan,
            vec![(JobId::new(2), Status::Waiting), (JobId::new(3), Status::Blocked)]
        );
    }

    #[test]
    fn test_plan_rerun_all() {
        let jobs = vec![
            job(1, "a", &[], Status::Success),
            job(2, "b", &["a"], Status::Failure),
        ];
        assert_eq!(
            plan_rerun(&jobs, None, false),
            vec![(JobId::new(1), Status::Waiting), (JobId::new(2), Status::Blocked)]
        );
    }

    #[test]
    fn test_duration_includes_previous_attempts() {
        let start = Utc::now();
        let mut j = job(1, "a", &[], Status::Success);
        j.started = Some(start);
        j.stopped = Some(start + TimeDelta::seconds(30));
        assert_eq!(j.duration(start + TimeDelta::hours(1)), TimeDelta::seconds(30));

        j.status = Status::Running;
        j.stopped = None;
        assert_eq!(j.duration(start + TimeDelta::seconds(5)), TimeDelta::seconds(5));

        j.started = None;
        assert_eq!(j.duration(start), TimeDelta::zero());
    }
}
