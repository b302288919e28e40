//! Schedule repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::schedule::{NewSchedule, Schedule, ScheduleSpec};
use gantry_core::{OwnerId, RepoId, ScheduleId, SpecId, UserId};

use crate::pg::{PgTransaction, decode};
use crate::{DbError, DbResult};

/// A due spec together with the schedule it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct DueSpec {
    pub spec: ScheduleSpec,
    pub schedule: Schedule,
}

#[async_trait]
pub trait ScheduleRepo: Send {
    /// Insert a schedule and one spec per `(expression, first fire time)`.
    async fn insert_schedule(
        &mut self,
        schedule: &NewSchedule,
        specs: &[(String, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> DbResult<(Schedule, Vec<ScheduleSpec>)>;
    /// Remove the schedules (and their specs) of one workflow.
    async fn delete_schedules(&mut self, repo_id: RepoId, workflow_id: &str) -> DbResult<u64>;
    /// Specs with `next <= now` and an id greater than `after`, by id, at most
    /// `limit` of them.
    async fn due_specs(
        &mut self,
        now: DateTime<Utc>,
        after: Option<SpecId>,
        limit: usize,
    ) -> DbResult<Vec<DueSpec>>;
    async fn update_spec(&mut self, spec: &ScheduleSpec) -> DbResult<()>;
}

/// A schedule row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleRecord {
    pub id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub workflow_id: String,
    pub trigger_user_id: i64,
    pub git_ref: String,
    pub commit_sha: String,
    pub event: String,
    pub event_payload: String,
    pub content: String,
    pub created: DateTime<Utc>,
}

impl TryFrom<ScheduleRecord> for Schedule {
    type Error = DbError;

    fn try_from(r: ScheduleRecord) -> DbResult<Self> {
        Ok(Schedule {
            id: ScheduleId::new(r.id),
            repo_id: RepoId::new(r.repo_id),
            owner_id: OwnerId::new(r.owner_id),
            workflow_id: r.workflow_id,
            trigger_user_id: UserId::new(r.trigger_user_id),
            git_ref: r.git_ref,
            commit_sha: r.commit_sha,
            event: decode("schedules.event", &r.event)?,
            event_payload: r.event_payload,
            content: r.content,
            created: r.created,
        })
    }
}

/// A schedule spec row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SpecRecord {
    pub id: i64,
    pub schedule_id: i64,
    pub repo_id: i64,
    pub spec: String,
    pub next: DateTime<Utc>,
    pub prev: Option<DateTime<Utc>>,
}

impl From<SpecRecord> for ScheduleSpec {
    fn from(r: SpecRecord) -> Self {
        ScheduleSpec {
            id: SpecId::new(r.id),
            schedule_id: ScheduleId::new(r.schedule_id),
            repo_id: RepoId::new(r.repo_id),
            spec: r.spec,
            next: r.next,
            prev: r.prev,
        }
    }
}

#[async_trait]
impl ScheduleRepo for PgTransaction {
    async fn insert_schedule(
        &mut self,
        schedule: &NewSchedule,
        specs: &[(String, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> DbResult<(Schedule, Vec<ScheduleSpec>)> {
        let record = sqlx::query_as::<_, ScheduleRecord>(
            r#"
            INSERT INTO schedules (repo_id, owner_id, workflow_id, trigger_user_id, git_ref,
                                   commit_sha, event, event_payload, content, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(schedule.repo_id.get())
        .bind(schedule.owner_id.get())
        .bind(&schedule.workflow_id)
        .bind(schedule.trigger_user_id.get())
        .bind(&schedule.git_ref)
        .bind(&schedule.commit_sha)
        .bind(schedule.event.as_str())
        .bind(&schedule.event_payload)
        .bind(&schedule.content)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;
        let stored = Schedule::try_from(record)?;

        let mut inserted = Vec::with_capacity(specs.len());
        for (expr, next) in specs {
            let spec = sqlx::query_as::<_, SpecRecord>(
                r#"
                INSERT INTO schedule_specs (schedule_id, repo_id, spec, next)
                VALUES ($1, $2, $3, $4)
                RETURNING *
                "#,
            )
            .bind(stored.id.get())
            .bind(stored.repo_id.get())
            .bind(expr)
            .bind(next)
            .fetch_one(&mut *self.tx)
            .await?;
            inserted.push(spec.into());
        }
        Ok((stored, inserted))
    }

    async fn delete_schedules(&mut self, repo_id: RepoId, workflow_id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM schedules WHERE repo_id = $1 AND workflow_id = $2")
            .bind(repo_id.get())
            .bind(workflow_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn due_specs(
        &mut self,
        now: DateTime<Utc>,
        after: Option<SpecId>,
        limit: usize,
    ) -> DbResult<Vec<DueSpec>> {
        let specs = sqlx::query_as::<_, SpecRecord>(
            r#"
            SELECT * FROM schedule_specs
            WHERE next <= $1 AND ($2::bigint IS NULL OR id > $2)
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(after.map(SpecId::get))
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut due = Vec::with_capacity(specs.len());
        for spec in specs {
            let schedule = sqlx::query_as::<_, ScheduleRecord>("SELECT * FROM schedules WHERE id = $1")
                .bind(spec.schedule_id)
                .fetch_optional(&mut *self.tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("schedule {}", spec.schedule_id)))?;
            due.push(DueSpec {
                spec: spec.into(),
                schedule: schedule.try_into()?,
            });
        }
        Ok(due)
    }

    async fn update_spec(&mut self, spec: &ScheduleSpec) -> DbResult<()> {
        let result = sqlx::query("UPDATE schedule_specs SET next = $2, prev = $3 WHERE id = $1")
            .bind(spec.id.get())
            .bind(spec.next)
            .bind(spec.prev)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("schedule spec {}", spec.id)));
        }
        Ok(())
    }
}
