//! The status machine shared by runs, jobs, tasks and steps.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run, job, task or step.
///
/// Jobs move `Blocked -> Waiting -> Running -> {Success, Failure, Cancelled, Skipped}`.
/// A run's status is derived from its jobs with [`Status::aggregate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
    /// Stopped before finishing.
    Cancelled,
    /// Never ran (a dependency did not succeed).
    Skipped,
    /// Eligible for dispatch.
    Waiting,
    /// Dispatched to a runner.
    Running,
    /// Waiting on dependencies or approval.
    Blocked,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Success,
        Status::Failure,
        Status::Cancelled,
        Status::Skipped,
        Status::Waiting,
        Status::Running,
        Status::Blocked,
    ];

    /// Terminal statuses are never left again.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Cancelled | Status::Skipped
        )
    }

    /// Whether a dependency in this status lets its dependents proceed.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Status::Success | Status::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Blocked => "blocked",
        }
    }

    /// Derive a run's status from the statuses of its jobs.
    ///
    /// Not every job done: Running if any job runs, else Waiting if any waits,
    /// else Blocked. Every job done: Success when all succeeded or were skipped
    /// (Skipped if all were skipped), else Cancelled if any was cancelled, else
    /// Failure. An empty job list is Waiting.
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut total = 0usize;
        let mut done = 0usize;
        let mut skipped = 0usize;
        let mut passed = 0usize;
        let mut cancelled = false;
        let mut running = false;
        let mut waiting = false;

        for status in statuses {
            total += 1;
            if status.is_done() {
                done += 1;
            }
            match status {
                Status::Success => passed += 1,
                Status::Skipped => {
                    passed += 1;
                    skipped += 1;
                }
                Status::Cancelled => cancelled = true,
                Status::Running => running = true,
                Status::Waiting => waiting = true,
                Status::Failure | Status::Blocked => {}
            }
        }

        if total == 0 {
            return Status::Waiting;
        }
        if done < total {
            return if running {
                Status::Running
            } else if waiting {
                Status::Waiting
            } else {
                Status::Blocked
            };
        }
        if passed == total {
            if skipped == total {
                Status::Skipped
            } else {
                Status::Success
            }
        } else if cancelled {
            Status::Cancelled
        } else {
            Status::Failure
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown status: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("queued".parse::<Status>().is_err());
    }

    #[test]
    fn test_done_statuses() {
        assert!(Status::Success.is_done());
        assert!(Status::Skipped.is_done());
        assert!(!Status::Running.is_done());
        assert!(!Status::Blocked.is_done());
    }

    #[test]
    fn test_aggregate_in_progress() {
        use Status::*;
        assert_eq!(Status::aggregate([Success, Running, Blocked]), Running);
        assert_eq!(Status::aggregate([Success, Waiting, Blocked]), Waiting);
        assert_eq!(Status::aggregate([Success, Blocked]), Blocked);
        assert_eq!(Status::aggregate([Failure, Blocked]), Blocked);
    }

    #[test]
    fn test_aggregate_finished() {
        use Status::*;
        assert_eq!(Status::aggregate([Success, Skipped]), Success);
        assert_eq!(Status::aggregate([Skipped, Skipped]), Skipped);
        assert_eq!(Status::aggregate([Success, Failure, Cancelled]), Cancelled);
        assert_eq!(Status::aggregate([Success, Failure, Skipped]), Failure);
    }

    #[test]
    fn test_aggregate_empty_is_waiting() {
        assert_eq!(Status::aggregate([]), Status::Waiting);
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Cancelled).unwrap(), "\"cancelled\"");
    }
}
