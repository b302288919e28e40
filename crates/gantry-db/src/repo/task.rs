//! Task repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::task::{NewTask, Task, TaskStep};
use gantry_core::{JobId, OwnerId, RepoId, RunId, RunnerId, Status, StepId, TaskId};

use crate::pg::{PgTransaction, decode};
use crate::{DbError, DbResult};

/// Criteria for [`TaskRepo::find_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub job_id: Option<JobId>,
    pub status: Option<Status>,
    /// Heartbeat older than this.
    pub updated_before: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TaskRepo: Send {
    /// Insert a Running task started at `task.now`.
    async fn insert_task(&mut self, task: &NewTask) -> DbResult<Task>;
    async fn get_task(&mut self, id: TaskId) -> DbResult<Task>;
    /// Write the mutable columns of `task` unless the stored task already
    /// finished. Returns whether the row was written.
    async fn update_task(&mut self, task: &Task) -> DbResult<bool>;
    async fn find_tasks(&mut self, filter: &TaskFilter) -> DbResult<Vec<Task>>;

    /// Insert Waiting steps named `names`, indexed from zero.
    async fn insert_steps(&mut self, task_id: TaskId, names: &[String]) -> DbResult<Vec<TaskStep>>;
    /// Steps of a task ordered by index.
    async fn steps_of_task(&mut self, task_id: TaskId) -> DbResult<Vec<TaskStep>>;
    async fn update_step(&mut self, step: &TaskStep) -> DbResult<()>;

    /// Store outputs of a task. Keys already stored keep their first value.
    async fn insert_task_outputs(
        &mut self,
        task_id: TaskId,
        outputs: &BTreeMap<String, String>,
    ) -> DbResult<()>;
    async fn task_outputs(&mut self, task_id: TaskId) -> DbResult<BTreeMap<String, String>>;
}

/// A task row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRecord {
    pub id: i64,
    pub job_id: i64,
    pub run_id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub runner_id: i64,
    pub attempt: i64,
    pub status: String,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub token_hash: String,
    pub token_salt: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl TryFrom<TaskRecord> for Task {
    type Error = DbError;

    fn try_from(r: TaskRecord) -> DbResult<Self> {
        Ok(Task {
            id: TaskId::new(r.id),
            job_id: JobId::new(r.job_id),
            run_id: RunId::new(r.run_id),
            repo_id: RepoId::new(r.repo_id),
            owner_id: OwnerId::new(r.owner_id),
            runner_id: RunnerId::new(r.runner_id),
            attempt: r.attempt,
            status: decode("tasks.status", &r.status)?,
            started: r.started,
            stopped: r.stopped,
            token_hash: r.token_hash,
            token_salt: r.token_salt,
            updated: r.updated,
            created: r.created,
        })
    }
}

/// A task step row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    pub id: i64,
    pub task_id: i64,
    pub index: i64,
    pub name: String,
    pub status: String,
    pub log_index: i64,
    pub log_length: i64,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
}

impl TryFrom<StepRecord> for TaskStep {
    type Error = DbError;

    fn try_from(r: StepRecord) -> DbResult<Self> {
        Ok(TaskStep {
            id: StepId::new(r.id),
            task_id: TaskId::new(r.task_id),
            index: r.index,
            name: r.name,
            status: decode("task_steps.status", &r.status)?,
            log_index: r.log_index,
            log_length: r.log_length,
            started: r.started,
            stopped: r.stopped,
        })
    }
}

#[async_trait]
impl TaskRepo for PgTransaction {
    async fn insert_task(&mut self, task: &NewTask) -> DbResult<Task> {
        sqlx::query_as::<_, TaskRecord>(
            r#"
            INSERT INTO tasks (job_id, run_id, repo_id, owner_id, runner_id, attempt, status,
                               started, token_hash, token_salt, created, updated)
            VALUES ($1, $2, $3, $4, $5, $6, 'running', $7, $8, $9, $7, $7)
            RETURNING *
            "#,
        )
        .bind(task.job_id.get())
        .bind(task.run_id.get())
        .bind(task.repo_id.get())
        .bind(task.owner_id.get())
        .bind(task.runner_id.get())
        .bind(task.attempt)
        .bind(task.now)
        .bind(&task.token_hash)
        .bind(&task.token_salt)
        .fetch_one(&mut *self.tx)
        .await?
        .try_into()
    }

    async fn get_task(&mut self, id: TaskId) -> DbResult<Task> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?
            .try_into()
    }

    async fn update_task(&mut self, task: &Task) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = $2, started = $3, stopped = $4, updated = $5
            WHERE id = $1 AND status IN ('waiting', 'running', 'blocked')
            "#,
        )
        .bind(task.id.get())
        .bind(task.status.as_str())
        .bind(task.started)
        .bind(task.stopped)
        .bind(task.updated)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_tasks(&mut self, filter: &TaskFilter) -> DbResult<Vec<Task>> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT * FROM tasks
            WHERE ($1::bigint IS NULL OR job_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR updated < $3)
              AND ($4::timestamptz IS NULL OR started < $4)
            ORDER BY id
            "#,
        )
        .bind(filter.job_id.map(JobId::get))
        .bind(filter.status.map(Status::as_str))
        .bind(filter.updated_before)
        .bind(filter.started_before)
        .fetch_all(&mut *self.tx)
        .await?;
        records.into_iter().map(Task::try_from).collect()
    }

    async fn insert_steps(&mut self, task_id: TaskId, names: &[String]) -> DbResult<Vec<TaskStep>> {
        let mut steps = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let record = sqlx::query_as::<_, StepRecord>(
                r#"
                INSERT INTO task_steps (task_id, index, name, status)
                VALUES ($1, $2, $3, 'waiting')
                RETURNING *
                "#,
            )
            .bind(task_id.get())
            .bind(index as i64)
            .bind(name)
            .fetch_one(&mut *self.tx)
            .await?;
            steps.push(record.try_into()?);
        }
        Ok(steps)
    }

    async fn steps_of_task(&mut self, task_id: TaskId) -> DbResult<Vec<TaskStep>> {
        let records = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM task_steps WHERE task_id = $1 ORDER BY index",
        )
        .bind(task_id.get())
        .fetch_all(&mut *self.tx)
        .await?;
        records.into_iter().map(TaskStep::try_from).collect()
    }

    async fn update_step(&mut self, step: &TaskStep) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE task_steps
            SET status = $2, log_index = $3, log_length = $4, started = $5, stopped = $6
            WHERE id = $1
            "#,
        )
        .bind(step.id.get())
        .bind(step.status.as_str())
        .bind(step.log_index)
        .bind(step.log_length)
        .bind(step.started)
        .bind(step.stopped)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_task_outputs(
        &mut self,
        task_id: TaskId,
        outputs: &BTreeMap<String, String>,
    ) -> DbResult<()> {
        for (key, value) in outputs {
            sqlx::query(
                r#"
                INSERT INTO task_outputs (task_id, key, value) VALUES ($1, $2, $3)
                ON CONFLICT (task_id, key) DO NOTHING
                "#,
            )
            .bind(task_id.get())
            .bind(key)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn task_outputs(&mut self, task_id: TaskId) -> DbResult<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM task_outputs WHERE task_id = $1")
                .bind(task_id.get())
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(rows.into_iter().collect())
    }
}
