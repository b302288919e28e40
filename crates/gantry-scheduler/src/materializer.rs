//! Turns parsed job descriptors into the initial jobs of a run.

use std::collections::HashSet;

use gantry_core::run::{JobDescriptor, NewRunJob, initial_job_status};
use gantry_core::{Error, Result, Status};

/// Jobs ready to insert, plus whether any of them can be dispatched
/// immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    pub jobs: Vec<NewRunJob>,
    pub has_waiting: bool,
}

/// Build the jobs of a run.
///
/// Jobs with needs, and every job of a run awaiting approval, start Blocked;
/// the rest start Waiting. An empty job list, a duplicate job id or a need
/// naming a job that is not part of the run fails the whole run.
pub fn materialize(descriptors: &[JobDescriptor], needs_approval: bool) -> Result<Materialized> {
    if descriptors.is_empty() {
        return Err(Error::InvalidWorkflow("workflow defines no jobs".to_string()));
    }

    let mut ids = HashSet::with_capacity(descriptors.len());
    for descriptor in descriptors {
        if !ids.insert(descriptor.job_id.as_str()) {
            return Err(Error::InvalidWorkflow(format!(
                "duplicate job '{}'",
                descriptor.job_id
            )));
        }
    }

    for descriptor in descriptors {
        if let Some(missing) = descriptor.needs.iter().find(|n| !ids.contains(n.as_str())) {
            return Err(Error::InvalidWorkflow(format!(
                "job '{}' needs unknown job '{}'",
                descriptor.job_id, missing
            )));
        }
    }

    let jobs: Vec<NewRunJob> = descriptors
        .iter()
        .map(|d| NewRunJob {
            job_id: d.job_id.clone(),
            name: if d.name.is_empty() {
                d.job_id.clone()
            } else {
                d.name.clone()
            },
            payload: d.payload.clone(),
            needs: d.needs.clone(),
            runs_on: d.runs_on.clone(),
            status: initial_job_status(&d.needs, needs_approval),
        })
        .collect();
    let has_waiting = jobs.iter().any(|j| j.status == Status::Waiting);

    Ok(Materialized { jobs, has_waiting })
}
