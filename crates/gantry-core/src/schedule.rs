//! Cron-triggered schedules.

use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, OwnerId, RepoId, Result, ScheduleId, SpecId, TriggerEvent, UserId};

/// A workflow bound to one or more cron specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub workflow_id: String,
    pub trigger_user_id: UserId,
    pub git_ref: String,
    pub commit_sha: String,
    /// Event the workflow was synced from.
    pub event: TriggerEvent,
    pub event_payload: String,
    /// Workflow file content, parsed when the schedule fires.
    pub content: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSchedule {
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub workflow_id: String,
    pub trigger_user_id: UserId,
    pub git_ref: String,
    pub commit_sha: String,
    pub event: TriggerEvent,
    pub event_payload: String,
    pub content: String,
}

/// One cron expression of a schedule and its fire times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub id: SpecId,
    pub schedule_id: ScheduleId,
    pub repo_id: RepoId,
    pub spec: String,
    pub next: DateTime<Utc>,
    pub prev: Option<DateTime<Utc>>,
}

impl ScheduleSpec {
    /// Record a firing: the old next time becomes the previous one and the new
    /// next time is the first tick after `now + lookahead`.
    pub fn advance(&mut self, now: DateTime<Utc>, lookahead: TimeDelta) -> Result<()> {
        let after = now.checked_add_signed(lookahead).ok_or_else(|| {
            Error::InvalidInput(format!("schedule lookahead {} is out of range", lookahead))
        })?;
        let next = next_fire_time(&self.spec, after)?;
        self.prev = Some(self.next);
        self.next = next;
        Ok(())
    }
}

/// Normalize a 5-field cron expression to the 6-field form the `cron` crate
/// expects by prepending a zero seconds field.
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron(expr))
        .map_err(|e| Error::InvalidInput(format!("invalid cron expression '{}': {}", expr, e)))
}

/// First tick of `expr` strictly after `after`.
pub fn next_fire_time(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_cron(expr)?
        .after(&after)
        .next()
        .ok_or_else(|| Error::InvalidInput(format!("cron expression '{}' never fires", expr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron(" 0 0 * * * * "), "0 0 * * * *");
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(matches!(parse_cron("bogus"), Err(Error::InvalidInput(_))));
        assert!(parse_cron("").is_err());
    }

    #[test]
    fn test_next_fire_time() {
        assert_eq!(next_fire_time("0 * * * *", at(10, 15)).unwrap(), at(11, 0));
        assert_eq!(next_fire_time("*/15 * * * *", at(10, 15)).unwrap(), at(10, 30));
    }

    #[test]
    fn test_advance_moves_next_to_prev() {
        let mut spec = ScheduleSpec {
            id: SpecId::new(1),
            schedule_id: ScheduleId::new(1),
            repo_id: RepoId::new(1),
            spec: "*/10 * * * *".into(),
            next: at(10, 0),
            prev: None,
        };
        spec.advance(at(10, 0), TimeDelta::minutes(1)).unwrap();
        assert_eq!(spec.prev, Some(at(10, 0)));
        assert_eq!(spec.next, at(10, 10));
    }

    #[test]
    fn test_advance_rejects_out_of_range_lookahead() {
        let mut spec = ScheduleSpec {
            id: SpecId::new(1),
            schedule_id: ScheduleId::new(1),
            repo_id: RepoId::new(1),
            spec: "*/10 * * * *".into(),
            next: at(10, 0),
            prev: None,
        };
        let err = spec.advance(at(10, 0), TimeDelta::MAX).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(spec.prev, None);
        assert_eq!(spec.next, at(10, 0));
    }
}
