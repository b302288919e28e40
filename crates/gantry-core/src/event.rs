//! Trigger events.
//!
//! The set of events that can start a run is closed. Behaviour that depends on
//! the event (commit-status labelling, superseding scheduled runs) is read from
//! one table instead of being scattered across string comparisons.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Push,
    Create,
    Delete,
    PullRequest,
    PullRequestSync,
    PullRequestLabel,
    PullRequestAssign,
    PullRequestMilestone,
    PullRequestTarget,
    Release,
    Schedule,
    WorkflowDispatch,
}

/// How the commit-status projector labels runs of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLabel {
    /// No commit status is reported.
    None,
    /// A fixed label.
    Fixed(&'static str),
    /// Pull-request family: `pull_request`, or `pull_request_target` when the
    /// run itself was triggered by `pull_request_target`.
    PullRequest,
}

struct EventTraits {
    name: &'static str,
    label: StatusLabel,
    supersedes_schedules: bool,
}

const fn traits(event: TriggerEvent) -> EventTraits {
    use TriggerEvent::*;
    match event {
        Push => EventTraits {
            name: "push",
            label: StatusLabel::Fixed("push"),
            supersedes_schedules: true,
        },
        Create => EventTraits {
            name: "create",
            label: StatusLabel::None,
            supersedes_schedules: false,
        },
        Delete => EventTraits {
            name: "delete",
            label: StatusLabel::None,
            supersedes_schedules: false,
        },
        PullRequest => EventTraits {
            name: "pull_request",
            label: StatusLabel::PullRequest,
            supersedes_schedules: false,
        },
        PullRequestSync => EventTraits {
            name: "pull_request_sync",
            label: StatusLabel::PullRequest,
            supersedes_schedules: false,
        },
        PullRequestLabel => EventTraits {
            name: "pull_request_label",
            label: StatusLabel::PullRequest,
            supersedes_schedules: false,
        },
        PullRequestAssign => EventTraits {
            name: "pull_request_assign",
            label: StatusLabel::PullRequest,
            supersedes_schedules: false,
        },
        PullRequestMilestone => EventTraits {
            name: "pull_request_milestone",
            label: StatusLabel::PullRequest,
            supersedes_schedules: false,
        },
        PullRequestTarget => EventTraits {
            name: "pull_request_target",
            label: StatusLabel::PullRequest,
            supersedes_schedules: false,
        },
        Release => EventTraits {
            name: "release",
            label: StatusLabel::Fixed("release"),
            supersedes_schedules: false,
        },
        Schedule => EventTraits {
            name: "schedule",
            label: StatusLabel::None,
            supersedes_schedules: false,
        },
        WorkflowDispatch => EventTraits {
            name: "workflow_dispatch",
            label: StatusLabel::None,
            supersedes_schedules: false,
        },
    }
}

impl TriggerEvent {
    pub const ALL: [TriggerEvent; 12] = [
        TriggerEvent::Push,
        TriggerEvent::Create,
        TriggerEvent::Delete,
        TriggerEvent::PullRequest,
        TriggerEvent::PullRequestSync,
        TriggerEvent::PullRequestLabel,
        TriggerEvent::PullRequestAssign,
        TriggerEvent::PullRequestMilestone,
        TriggerEvent::PullRequestTarget,
        TriggerEvent::Release,
        TriggerEvent::Schedule,
        TriggerEvent::WorkflowDispatch,
    ];

    pub fn as_str(self) -> &'static str {
        traits(self).name
    }

    /// Whether a scheduled spec carrying this event cancels the still-running
    /// scheduled runs of the same workflow before firing.
    pub fn supersedes_schedules(self) -> bool {
        traits(self).supersedes_schedules
    }

    /// The commit-status event label for a run whose stored event is `self`
    /// and whose trigger event is `trigger`.
    pub fn commit_status_label(self, trigger: TriggerEvent) -> Option<&'static str> {
        match traits(self).label {
            StatusLabel::None => None,
            StatusLabel::Fixed(label) => Some(label),
            StatusLabel::PullRequest if trigger == TriggerEvent::PullRequestTarget => {
                Some("pull_request_target")
            }
            StatusLabel::PullRequest => Some("pull_request"),
        }
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("Unknown trigger event: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_round_trip() {
        for event in TriggerEvent::ALL {
            assert_eq!(event.as_str().parse::<TriggerEvent>().unwrap(), event);
        }
    }

    #[test]
    fn test_only_push_supersedes_schedules() {
        let superseding: Vec<_> = TriggerEvent::ALL
            .into_iter()
            .filter(|e| e.supersedes_schedules())
            .collect();
        assert_eq!(superseding, vec![TriggerEvent::Push]);
    }

    #[test]
    fn test_commit_status_labels() {
        use TriggerEvent::*;
        assert_eq!(Push.commit_status_label(Push), Some("push"));
        assert_eq!(PullRequestSync.commit_status_label(PullRequest), Some("pull_request"));
        assert_eq!(
            PullRequest.commit_status_label(PullRequestTarget),
            Some("pull_request_target")
        );
        assert_eq!(Release.commit_status_label(Release), Some("release"));
        assert_eq!(Schedule.commit_status_label(Schedule), None);
        assert_eq!(WorkflowDispatch.commit_status_label(WorkflowDispatch), None);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&TriggerEvent::PullRequestTarget).unwrap();
        assert_eq!(json, "\"pull_request_target\"");
    }
}
