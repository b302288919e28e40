//! Execution context handed to a runner with each task.

use std::collections::BTreeMap;

use gantry_core::repository::Repository;
use gantry_core::run::{Run, RunJob};
use serde_json::{Value, json};

/// Credentials minted for one task.
#[derive(Debug, Clone, Copy)]
pub struct TaskCredentials<'a> {
    /// Random per-task token, stored hashed.
    pub token: &'a str,
    /// Signed token scoped to the task, job and run.
    pub runtime_token: &'a str,
}

/// Build the context map of `job`, which is about to run as attempt
/// `job.attempt`.
pub fn build_context(
    repo: &Repository,
    run: &Run,
    job: &RunJob,
    credentials: TaskCredentials<'_>,
) -> BTreeMap<String, Value> {
    let event: Value = serde_json::from_str(&run.event_payload).unwrap_or_else(|_| json!({}));
    let (ref_type, ref_name) = split_ref(&run.git_ref);

    BTreeMap::from([
        ("repository".to_string(), json!(repo.full_name())),
        ("repository_owner".to_string(), json!(repo.owner_name)),
        ("run_id".to_string(), json!(run.id.to_string())),
        ("run_number".to_string(), json!(run.index.to_string())),
        ("run_attempt".to_string(), json!(job.attempt.to_string())),
        ("job".to_string(), json!(job.job_id)),
        ("workflow".to_string(), json!(run.workflow_id)),
        ("ref".to_string(), json!(run.git_ref)),
        ("ref_name".to_string(), json!(ref_name)),
        ("ref_type".to_string(), json!(ref_type)),
        ("sha".to_string(), json!(run.commit_sha)),
        ("event_name".to_string(), json!(run.trigger_event.as_str())),
        ("event".to_string(), event),
        ("actor".to_string(), json!(run.trigger_user_id.to_string())),
        ("token".to_string(), json!(credentials.token)),
        ("runtime_token".to_string(), json!(credentials.runtime_token)),
    ])
}

fn split_ref(git_ref: &str) -> (&'static str, &str) {
    if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        ("branch", branch)
    } else if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        ("tag", tag)
    } else {
        ("", git_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ref() {
        assert_eq!(split_ref("refs/heads/main"), ("branch", "main"));
        assert_eq!(split_ref("refs/tags/v1.0"), ("tag", "v1.0"));
        assert_eq!(split_ref("abc123"), ("", "abc123"));
    }
}
