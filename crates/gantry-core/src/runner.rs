//! Runner agents: scope, labels and heartbeat-derived status.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{OwnerId, RepoId, RunnerId};

/// Which jobs a runner may pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RunnerScope {
    /// Any repository.
    Global,
    /// Repositories of one owner.
    Owner(OwnerId),
    /// A single repository.
    Repository(RepoId),
}

impl RunnerScope {
    /// Build a scope from optional owner and repository ids. A repository id
    /// takes precedence and the owner is dropped.
    pub fn from_ids(owner_id: Option<OwnerId>, repo_id: Option<RepoId>) -> Self {
        match (owner_id, repo_id) {
            (_, Some(repo)) => RunnerScope::Repository(repo),
            (Some(owner), None) => RunnerScope::Owner(owner),
            (None, None) => RunnerScope::Global,
        }
    }

    pub fn owner_id(&self) -> Option<OwnerId> {
        match self {
            RunnerScope::Owner(owner) => Some(*owner),
            _ => None,
        }
    }

    pub fn repo_id(&self) -> Option<RepoId> {
        match self {
            RunnerScope::Repository(repo) => Some(*repo),
            _ => None,
        }
    }

    /// Whether a job in `repo_id` owned by `owner_id` is visible.
    pub fn can_see(&self, repo_id: RepoId, owner_id: OwnerId) -> bool {
        match self {
            RunnerScope::Global => true,
            RunnerScope::Owner(owner) => *owner == owner_id,
            RunnerScope::Repository(repo) => *repo == repo_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub uuid: Uuid,
    pub name: String,
    pub scope: RunnerScope,
    pub labels: Vec<String>,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub token_salt: String,
    pub last_online: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl Runner {
    pub fn status(&self, now: DateTime<Utc>, thresholds: &RunnerThresholds) -> RunnerStatus {
        RunnerStatus::derive(self.last_online, self.last_active, now, thresholds)
    }

    pub fn is_online(&self, now: DateTime<Utc>, thresholds: &RunnerThresholds) -> bool {
        self.status(now, thresholds) != RunnerStatus::Offline
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRunner {
    pub uuid: Uuid,
    pub name: String,
    pub scope: RunnerScope,
    pub labels: Vec<String>,
    pub token_hash: String,
    pub token_salt: String,
}

/// Heartbeat ages beyond which a runner counts as offline or idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerThresholds {
    pub offline_after: TimeDelta,
    pub idle_after: TimeDelta,
}

impl Default for RunnerThresholds {
    fn default() -> Self {
        Self {
            offline_after: TimeDelta::minutes(1),
            idle_after: TimeDelta::seconds(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Offline,
    Idle,
    Active,
}

impl RunnerStatus {
    pub fn derive(
        last_online: Option<DateTime<Utc>>,
        last_active: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        thresholds: &RunnerThresholds,
    ) -> Self {
        let stale = |seen: Option<DateTime<Utc>>, limit: TimeDelta| match seen {
            Some(seen) => now - seen > limit,
            None => true,
        };
        if stale(last_online, thresholds.offline_after) {
            RunnerStatus::Offline
        } else if stale(last_active, thresholds.idle_after) {
            RunnerStatus::Idle
        } else {
            RunnerStatus::Active
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunnerStatus::Offline => "offline",
            RunnerStatus::Idle => "idle",
            RunnerStatus::Active => "active",
        }
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runner may take a job only if the job's labels are a non-empty subset of
/// the runner's labels.
pub fn labels_match(job_labels: &[String], runner_labels: &[String]) -> bool {
    !job_labels.is_empty() && job_labels.iter().all(|label| runner_labels.contains(label))
}

/// The UUID a runner is given on soft delete: eight `0xff` bytes followed by
/// the little-endian id, so it can never collide with a generated UUID or with
/// another deleted runner.
pub fn deleted_runner_uuid(id: RunnerId) -> Uuid {
    let mut bytes = [0xffu8; 16];
    bytes[8..].copy_from_slice(&id.get().to_le_bytes());
    Uuid::from_bytes(bytes)
}
