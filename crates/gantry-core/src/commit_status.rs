//! Commit statuses reported against triggering commits.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{RepoId, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

impl CommitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
        }
    }
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommitState::Pending),
            "success" => Ok(CommitState::Success),
            "failure" => Ok(CommitState::Failure),
            _ => Err(format!("Unknown commit state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub repo_id: RepoId,
    pub sha: String,
    pub context: String,
    pub state: CommitState,
    pub description: String,
    pub target_url: String,
    pub created: DateTime<Utc>,
}

/// State and description shown for a job in `status` that ran for `duration`.
pub fn describe(status: Status, duration: TimeDelta) -> (CommitState, String) {
    match status {
        Status::Success => (
            CommitState::Success,
            format!("Successful in {}", format_duration(duration)),
        ),
        Status::Failure => (
            CommitState::Failure,
            format!("Failing after {}", format_duration(duration)),
        ),
        Status::Cancelled => (CommitState::Failure, "Has been cancelled".to_string()),
        Status::Skipped => (CommitState::Success, "Has been skipped".to_string()),
        Status::Running => (CommitState::Pending, "Has started running".to_string()),
        Status::Waiting => (CommitState::Pending, "Waiting to run".to_string()),
        Status::Blocked => (
            CommitState::Pending,
            "Blocked by required conditions".to_string(),
        ),
    }
}

/// Compact `1h2m3s` rendering; zero renders as `0s`.
pub fn format_duration(duration: TimeDelta) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(TimeDelta::zero()), "0s");
        assert_eq!(format_duration(TimeDelta::seconds(42)), "42s");
        assert_eq!(format_duration(TimeDelta::seconds(90)), "1m30s");
        assert_eq!(format_duration(TimeDelta::seconds(3605)), "1h0m5s");
    }

    #[test]
    fn test_describe_maps_states() {
        assert_eq!(
            describe(Status::Success, TimeDelta::seconds(5)),
            (CommitState::Success, "Successful in 5s".to_string())
        );
        assert_eq!(describe(Status::Cancelled, TimeDelta::zero()).0, CommitState::Failure);
        assert_eq!(describe(Status::Skipped, TimeDelta::zero()).0, CommitState::Success);
        assert_eq!(describe(Status::Blocked, TimeDelta::zero()).0, CommitState::Pending);
    }
}
