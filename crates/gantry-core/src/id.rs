//! Resource identifiers.
//!
//! Every persisted entity is keyed by a database-assigned integer. The newtypes
//! keep a run id from being passed where a job id is expected.

use derive_more::Display;
use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        )]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_id!(
    /// Identifier of a workflow run.
    RunId
);
define_id!(
    /// Identifier of a job within a run.
    JobId
);
define_id!(
    /// Identifier of one execution attempt of a job.
    TaskId
);
define_id!(StepId);
define_id!(
    /// Identifier of a registered runner agent.
    RunnerId
);
define_id!(RepoId);
define_id!(
    /// Identifier of a user or organization owning repositories.
    OwnerId
);
define_id!(UserId);
define_id!(ScheduleId);
define_id!(
    /// Identifier of a single cron expression attached to a schedule.
    SpecId
);
