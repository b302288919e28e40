//! Repositories that own runs.

use serde::{Deserialize, Serialize};

use crate::{OwnerId, RepoId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepoId,
    pub owner_id: OwnerId,
    pub owner_name: String,
    pub name: String,
    pub archived: bool,
    /// Workflow ids that administrators switched off.
    pub disabled_workflows: Vec<String>,
    pub counters: RunCounters,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner_name, self.name)
    }

    pub fn is_workflow_disabled(&self, workflow_id: &str) -> bool {
        self.disabled_workflows.iter().any(|w| w == workflow_id)
    }
}

/// Aggregate run counts of a repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub num_runs: i64,
    pub num_closed_runs: i64,
}

impl RunCounters {
    pub fn num_open_runs(&self) -> i64 {
        self.num_runs - self.num_closed_runs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRepository {
    pub owner_id: OwnerId,
    pub owner_name: String,
    pub name: String,
}
