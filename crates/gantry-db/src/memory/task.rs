use std::collections::BTreeMap;

use async_trait::async_trait;
use gantry_core::task::{NewTask, Task, TaskStep};
use gantry_core::{Status, StepId, TaskId};

use super::MemoryTransaction;
use crate::{DbError, DbResult, TaskFilter, TaskRepo};

#[async_trait]
impl TaskRepo for MemoryTransaction {
    async fn insert_task(&mut self, task: &NewTask) -> DbResult<Task> {
        let tables = &mut self.staged;
        let stored = Task {
            id: TaskId::new(tables.next_id()),
            job_id: task.job_id,
            run_id: task.run_id,
            repo_id: task.repo_id,
            owner_id: task.owner_id,
            runner_id: task.runner_id,
            attempt: task.attempt,
            status: Status::Running,
            started: Some(task.now),
            stopped: None,
            token_hash: task.token_hash.clone(),
            token_salt: task.token_salt.clone(),
            updated: task.now,
            created: task.now,
        };
        tables.tasks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_task(&mut self, id: TaskId) -> DbResult<Task> {
        self.staged
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))
    }

    async fn update_task(&mut self, task: &Task) -> DbResult<bool> {
        let Some(stored) = self.staged.tasks.get_mut(&task.id) else {
            return Ok(false);
        };
        if stored.status.is_done() {
            return Ok(false);
        }
        stored.status = task.status;
        stored.started = task.started;
        stored.stopped = task.stopped;
        stored.updated = task.updated;
        Ok(true)
    }

    async fn find_tasks(&mut self, filter: &TaskFilter) -> DbResult<Vec<Task>> {
        Ok(self
            .staged
            .tasks
            .values()
            .filter(|t| {
                filter.job_id.is_none_or(|id| t.job_id == id)
                    && filter.status.is_none_or(|s| t.status == s)
                    && filter.updated_before.is_none_or(|b| t.updated < b)
                    && filter
                        .started_before
                        .is_none_or(|b| t.started.is_some_and(|s| s < b))
            })
            .cloned()
            .collect())
    }

    async fn insert_steps(&mut self, task_id: TaskId, names: &[String]) -> DbResult<Vec<TaskStep>> {
        let tables = &mut self.staged;
        let mut steps = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let step = TaskStep {
                id: StepId::new(tables.next_id()),
                task_id,
                index: index as i64,
                name: name.clone(),
                status: Status::Waiting,
                log_index: 0,
                log_length: 0,
                started: None,
                stopped: None,
            };
            tables.steps.insert(step.id, step.clone());
            steps.push(step);
        }
        Ok(steps)
    }

    async fn steps_of_task(&mut self, task_id: TaskId) -> DbResult<Vec<TaskStep>> {
        let mut steps: Vec<TaskStep> = self
            .staged
            .steps
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.index);
        Ok(steps)
    }

    async fn update_step(&mut self, step: &TaskStep) -> DbResult<()> {
        let stored = self
            .staged
            .steps
            .get_mut(&step.id)
            .ok_or_else(|| DbError::NotFound(format!("step {}", step.id)))?;
        *stored = step.clone();
        Ok(())
    }

    async fn insert_task_outputs(
        &mut self,
        task_id: TaskId,
        outputs: &BTreeMap<String, String>,
    ) -> DbResult<()> {
        let stored = self.staged.outputs.entry(task_id).or_default();
        for (key, value) in outputs {
            stored.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(())
    }

    async fn task_outputs(&mut self, task_id: TaskId) -> DbResult<BTreeMap<String, String>> {
        Ok(self
            .staged
            .outputs
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }
}
