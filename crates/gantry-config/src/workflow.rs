//! Workflow file parsing.
//!
//! ```kdl
//! workflow "CI"
//! on "push"
//! on "schedule" cron="0 3 * * *"
//!
//! job "test" runs-on="ubuntu" {
//!     step "unit" run="cargo test"
//! }
//!
//! job "release" runs-on="ubuntu" runs-on="docker" needs="test" {
//!     name "Publish release"
//!     env {
//!         PROFILE "release"
//!     }
//!     step "build" run="cargo build --release"
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use gantry_core::TriggerEvent;
use gantry_core::run::{JobDescriptor, JobPayload, StepPayload};
use kdl::{KdlDocument, KdlNode};

use crate::kdl_util::{get_first_string_arg, get_string_list_prop, get_string_prop};
use crate::{ConfigError, ConfigResult};

/// A parsed workflow file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub name: String,
    pub events: Vec<TriggerEvent>,
    /// Cron expressions of `on "schedule"` triggers.
    pub schedules: Vec<String>,
    /// Jobs in file order.
    pub jobs: Vec<JobDescriptor>,
}

/// Parse a workflow from KDL text.
pub fn parse_workflow(kdl: &str) -> ConfigResult<Workflow> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut events = Vec::new();
    let mut schedules = Vec::new();
    let mut env = BTreeMap::new();
    let mut job_nodes = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "workflow" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workflow name".to_string()))?;
            }
            "on" => {
                let raw = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("trigger event".to_string()))?;
                let event: TriggerEvent =
                    raw.parse().map_err(|message| ConfigError::InvalidValue {
                        field: "on".to_string(),
                        message,
                    })?;
                if event == TriggerEvent::Schedule {
                    let cron = get_string_prop(node, "cron")
                        .ok_or_else(|| ConfigError::MissingField("schedule cron".to_string()))?;
                    schedules.push(cron);
                }
                if !events.contains(&event) {
                    events.push(event);
                }
            }
            "env" => env.extend(parse_env(node)),
            "job" => job_nodes.push(node),
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("workflow name".to_string()));
    }

    let mut jobs = Vec::with_capacity(job_nodes.len());
    let mut seen = HashSet::new();
    for node in job_nodes {
        let job = parse_job(node, &name, &env)?;
        if !seen.insert(job.job_id.clone()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.job_id)));
        }
        jobs.push(job);
    }

    if jobs.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "jobs in workflow '{}'",
            name
        )));
    }

    for job in &jobs {
        for dep in &job.needs {
            if !seen.contains(dep) {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' needs unknown job '{}'",
                    job.job_id, dep
                )));
            }
        }
    }

    if let Err(cycle) = detect_cycle(&jobs) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(Workflow {
        name,
        events,
        schedules,
        jobs,
    })
}

fn parse_job(
    node: &KdlNode,
    workflow: &str,
    workflow_env: &BTreeMap<String, String>,
) -> ConfigResult<JobDescriptor> {
    let job_id = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job id".to_string()))?;

    let needs = get_string_list_prop(node, "needs");
    let runs_on = get_string_list_prop(node, "runs-on");

    let mut name = job_id.clone();
    let mut env = workflow_env.clone();
    let mut steps = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "name" => {
                    if let Some(n) = get_first_string_arg(child) {
                        name = n;
                    }
                }
                "env" => env.extend(parse_env(child)),
                "step" => {
                    let step_name = get_first_string_arg(child).unwrap_or_default();
                    let run = get_string_prop(child, "run").ok_or_else(|| {
                        ConfigError::MissingField(format!(
                            "run for step '{}' of job '{}'",
                            step_name, job_id
                        ))
                    })?;
                    steps.push(StepPayload {
                        name: step_name,
                        run,
                    });
                }
                _ => {}
            }
        }
    }

    let payload = JobPayload {
        workflow: workflow.to_string(),
        job: job_id.clone(),
        name: name.clone(),
        runs_on: runs_on.clone(),
        env,
        steps,
    };
    let payload = serde_json::to_string(&payload).map_err(|e| ConfigError::InvalidValue {
        field: format!("job '{}'", job_id),
        message: e.to_string(),
    })?;

    Ok(JobDescriptor {
        job_id,
        name,
        needs,
        runs_on,
        payload,
    })
}

fn parse_env(node: &KdlNode) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

/// Detect cycles in the job dependency graph using DFS.
fn detect_cycle(jobs: &[JobDescriptor]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let job_map: HashMap<&str, &JobDescriptor> =
        jobs.iter().map(|j| (j.job_id.as_str(), j)).collect();

    for job in jobs {
        if !visited.contains_key(job.job_id.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&job.job_id, &job_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    job_map: &'a HashMap<&'a str, &'a JobDescriptor>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(job) = job_map.get(node) {
        for dep in &job.needs {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, job_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
