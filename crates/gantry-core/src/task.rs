//! Tasks: execution attempts of a job on a runner.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, OwnerId, RepoId, RunId, RunnerId, Status, StepId, TaskId};

/// One execution attempt of a job by a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub run_id: RunId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub runner_id: RunnerId,
    pub attempt: i64,
    pub status: Status,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub token_salt: String,
    /// Heartbeat, bumped on every report from the runner.
    pub updated: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// Fields of a task supplied at claim time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub job_id: JobId,
    pub run_id: RunId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub runner_id: RunnerId,
    pub attempt: i64,
    pub token_hash: String,
    pub token_salt: String,
    pub now: DateTime<Utc>,
}

/// Progress record of one step of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: StepId,
    pub task_id: TaskId,
    pub index: i64,
    pub name: String,
    pub status: Status,
    pub log_index: i64,
    pub log_length: i64,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
}

impl TaskStep {
    /// Fold a runner report into this step.
    ///
    /// An explicit step result wins. A started step without one takes the
    /// task's final result, or Running when the task has none.
    pub fn apply_state(&mut self, state: Option<&StepState>, task_result: Option<Status>) {
        let mut result = None;
        if let Some(state) = state {
            result = state.result;
            self.log_index = state.log_index;
            self.log_length = state.log_length;
            self.started = state.started_at.or(self.started);
            self.stopped = state.stopped_at.or(self.stopped);
        }
        if self.status.is_done() {
            return;
        }
        if result.is_none() && self.started.is_some() {
            result = task_result;
        }
        match result {
            Some(status) => self.status = status,
            None if self.started.is_some() => self.status = Status::Running,
            None => {}
        }
    }

    /// Force an unfinished step to `status`.
    pub fn stop(&mut self, status: Status, now: DateTime<Utc>) -> bool {
        if self.status.is_done() {
            return false;
        }
        self.status = status;
        self.started.get_or_insert(now);
        self.stopped = Some(now);
        true
    }
}

/// A runner's report on the state of one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStateReport {
    pub id: TaskId,
    /// Final result; absent while the task is still running.
    #[serde(default)]
    pub result: Option<Status>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepState>,
    /// Job outputs declared by the task.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub index: i64,
    #[serde(default)]
    pub result: Option<Status>,
    #[serde(default)]
    pub log_index: i64,
    #[serde(default)]
    pub log_length: i64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Outputs and result of a finished dependency, as seen by a dependent job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNeed {
    pub outputs: BTreeMap<String, String>,
    pub result: Status,
}

/// Everything a runner needs to execute a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub job_id: JobId,
    pub run_id: RunId,
    pub payload: String,
    pub context: BTreeMap<String, serde_json::Value>,
    pub secrets: BTreeMap<String, String>,
    pub vars: BTreeMap<String, String>,
    pub needs: BTreeMap<String, TaskNeed>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn step(status: Status, started: Option<DateTime<Utc>>) -> TaskStep {
        TaskStep {
            id: StepId::new(1),
            task_id: TaskId::new(1),
            index: 0,
            name: "build".into(),
            status,
            log_index: 0,
            log_length: 0,
            started,
            stopped: None,
        }
    }

    #[test]
    fn test_explicit_step_result_wins() {
        let now = Utc::now();
        let mut s = step(Status::Running, Some(now));
        let state = StepState {
            index: 0,
            result: Some(Status::Success),
            log_length: 12,
            ..Default::default()
        };
        s.apply_state(Some(&state), Some(Status::Failure));
        assert_eq!(s.status, Status::Success);
        assert_eq!(s.log_length, 12);
        assert_eq!(s.started, Some(now));
    }

    #[test]
    fn test_started_step_inherits_task_result() {
        let mut s = step(Status::Running, Some(Utc::now()));
        s.apply_state(None, Some(Status::Failure));
        assert_eq!(s.status, Status::Failure);
    }

    #[test]
    fn test_unstarted_step_is_left_alone() {
        let mut s = step(Status::Waiting, None);
        s.apply_state(None, Some(Status::Failure));
        assert_eq!(s.status, Status::Waiting);
    }

    #[test]
    fn test_started_step_without_result_runs() {
        let mut s = step(Status::Waiting, None);
        let state = StepState {
            index: 0,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        s.apply_state(Some(&state), None);
        assert_eq!(s.status, Status::Running);
    }

    #[test]
    fn test_stop_defaults_start_time() {
        let now = Utc::now();
        let mut s = step(Status::Waiting, None);
        assert!(s.stop(Status::Cancelled, now));
        assert_eq!(s.started, Some(now));
        assert_eq!(s.stopped, Some(now));

        let mut done = step(Status::Success, Some(now - TimeDelta::seconds(3)));
        assert!(!done.stop(Status::Cancelled, now));
        assert_eq!(done.status, Status::Success);
    }

    #[test]
    fn test_report_deserializes_with_defaults() {
        let report: TaskStateReport = serde_json::from_str(r#"{"id": 5}"#).unwrap();
        assert_eq!(report.id, TaskId::new(5));
        assert!(report.result.is_none());
        assert!(report.steps.is_empty());
    }
}
