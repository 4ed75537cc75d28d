//! Write-stage definition and its execution state machine.
//!
//! A stage moves `Pending -> Running -> (Succeeded | Failed)`. It succeeds only when every
//! task's latest attempt succeeded and fails as soon as one task fails without recovery or
//! the stage is cancelled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use ctas_common::{CtasError, QueryId, Result, StageId, TaskId};
use ctas_partition::{PartitionKeyEvaluator, PartitionKeySpec, PartitionedSchema};
use serde::{Deserialize, Serialize};

use crate::plan::UpstreamPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Task lifecycle states tracked per stage.
pub enum TaskState {
    /// Not yet dispatched. A retry passes through here only between `mark_retrying` and
    /// the immediate `mark_running` of its next attempt.
    Pending,
    /// An attempt is dispatched; covers waiting for a worker slot and retry backoff.
    Running,
    Succeeded,
    /// Terminal failure; the stage cannot recover.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Latest attempt number, 1-based.
    pub attempt: u32,
    pub worker_id: Option<String>,
    pub message: String,
}

/// Per-stage bookkeeping owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    query_id: QueryId,
    stage_id: StageId,
    state: StageState,
    tasks: BTreeMap<TaskId, TaskStatus>,
    failure: Option<String>,
}

impl StageExecution {
    pub fn new(query_id: QueryId, stage_id: StageId, task_count: usize) -> Self {
        let tasks = (0..task_count as u64)
            .map(|t| {
                (
                    TaskId(t),
                    TaskStatus {
                        state: TaskState::Pending,
                        attempt: 1,
                        worker_id: None,
                        message: String::new(),
                    },
                )
            })
            .collect();
        Self {
            query_id,
            stage_id,
            state: StageState::Pending,
            tasks,
            failure: None,
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn stage_id(&self) -> StageId {
        self.stage_id
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn task(&self, task_id: TaskId) -> Option<&TaskStatus> {
        self.tasks.get(&task_id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state == state).count()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StageState::Succeeded | StageState::Failed)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != StageState::Pending {
            return Err(self.invalid("start", self.state));
        }
        self.state = StageState::Running;
        Ok(())
    }

    pub fn mark_running(&mut self, task_id: TaskId, attempt: u32, worker_id: &str) -> Result<()> {
        self.ensure_running()?;
        let task = self.task_mut(task_id)?;
        if task.state != TaskState::Pending {
            let from = task.state;
            return Err(invalid_task(task_id, from, TaskState::Running));
        }
        task.state = TaskState::Running;
        task.attempt = attempt;
        task.worker_id = Some(worker_id.to_string());
        task.message = "running".to_string();
        Ok(())
    }

    pub fn mark_succeeded(&mut self, task_id: TaskId) -> Result<()> {
        self.ensure_running()?;
        let task = self.task_mut(task_id)?;
        if task.state != TaskState::Running {
            let from = task.state;
            return Err(invalid_task(task_id, from, TaskState::Succeeded));
        }
        task.state = TaskState::Succeeded;
        task.message = "succeeded".to_string();
        Ok(())
    }

    /// Return a failed attempt to `Pending`; the scheduler re-dispatches it with
    /// [`Self::mark_running`] before the backoff starts.
    pub fn mark_retrying(&mut self, task_id: TaskId, next_attempt: u32, reason: &str) -> Result<()> {
        self.ensure_running()?;
        let task = self.task_mut(task_id)?;
        if task.state != TaskState::Running {
            let from = task.state;
            return Err(invalid_task(task_id, from, TaskState::Pending));
        }
        task.state = TaskState::Pending;
        task.attempt = next_attempt;
        task.message = format!("retry scheduled after failure: {reason}");
        Ok(())
    }

    pub fn mark_failed(&mut self, task_id: TaskId, reason: &str) -> Result<()> {
        let task = self.task_mut(task_id)?;
        if task.state == TaskState::Succeeded {
            return Err(invalid_task(task_id, TaskState::Succeeded, TaskState::Failed));
        }
        task.state = TaskState::Failed;
        task.message = reason.to_string();
        Ok(())
    }

    /// Fail the whole stage. The first recorded reason wins.
    pub fn fail(&mut self, reason: &str) {
        if self.state != StageState::Succeeded {
            self.state = StageState::Failed;
            if self.failure.is_none() {
                self.failure = Some(reason.to_string());
            }
        }
    }

    /// Close a running stage once no task is outstanding.
    pub fn finish(&mut self) -> StageState {
        if self.state == StageState::Running {
            if self.count_in(TaskState::Failed) > 0 {
                self.fail("task failed");
            } else if self.tasks.values().all(|t| t.state == TaskState::Succeeded) {
                self.state = StageState::Succeeded;
            }
        }
        self.state
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state != StageState::Running {
            return Err(self.invalid("update task of", self.state));
        }
        Ok(())
    }

    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut TaskStatus> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| CtasError::Execution(format!("unknown task {task_id}")))
    }

    fn invalid(&self, action: &str, state: StageState) -> CtasError {
        CtasError::Execution(format!(
            "cannot {action} stage {} of query {} in state {state:?}",
            self.stage_id, self.query_id
        ))
    }
}

fn invalid_task(task_id: TaskId, from: TaskState, to: TaskState) -> CtasError {
    CtasError::Execution(format!(
        "invalid transition for task {task_id}: {from:?} -> {to:?}"
    ))
}

/// Everything a writer task needs to run its share of the stage.
#[derive(Debug, Clone)]
pub struct WriteStage {
    pub query_id: QueryId,
    pub stage_id: StageId,
    pub plan: Arc<dyn UpstreamPlan>,
    pub key_spec: PartitionKeySpec,
    pub evaluator: PartitionKeyEvaluator,
    pub layout: PartitionedSchema,
    /// Base location of the new table.
    pub base_location: PathBuf,
}

impl WriteStage {
    pub fn try_new(
        query_id: QueryId,
        stage_id: StageId,
        plan: Arc<dyn UpstreamPlan>,
        key_spec: PartitionKeySpec,
        base_location: impl Into<PathBuf>,
    ) -> Result<Self> {
        let schema = plan.schema();
        let evaluator = PartitionKeyEvaluator::try_new(&schema, &key_spec)?;
        let layout = PartitionedSchema::try_new(&schema, &key_spec)?;
        Ok(Self {
            query_id,
            stage_id,
            plan,
            key_spec,
            evaluator,
            layout,
            base_location: base_location.into(),
        })
    }

    pub fn task_count(&self) -> usize {
        self.plan.partition_count()
    }

    pub fn data_schema(&self) -> SchemaRef {
        Arc::clone(&self.layout.data_schema)
    }
}
