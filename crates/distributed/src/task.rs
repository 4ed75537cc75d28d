//! Writer task execution.
//!
//! One task consumes one upstream partition: it evaluates the partition key of every row,
//! strips key columns from the row and hands it to a [`PartitionWriter`]. Cancellation is
//! observed between batches.

use std::sync::Arc;

use async_trait::async_trait;
use ctas_common::{CtasError, QueryId, Result, StageId, TaskId};
use ctas_partition::value::rows_from_batch;
use ctas_partition::{PartitionWriter, TaskWriteOutput, WriterConfig, WriterContext};
use ctas_storage::Storage;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stage::WriteStage;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One dispatched task attempt.
pub struct TaskAssignment {
    pub query_id: QueryId,
    pub stage_id: StageId,
    /// Also the upstream partition index the task consumes.
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Worker the attempt was placed on.
    pub worker_id: String,
}

#[async_trait]
/// Task execution contract used by the stage scheduler.
pub trait TaskExecutor: Send + Sync + std::fmt::Debug {
    /// Run one attempt to completion, or stop early once `cancel` fires.
    async fn execute(
        &self,
        assignment: &TaskAssignment,
        cancel: &CancellationToken,
    ) -> Result<TaskWriteOutput>;
}

/// Default executor: streams an upstream partition into a [`PartitionWriter`].
#[derive(Debug, Clone)]
pub struct WriterTaskExecutor {
    stage: Arc<WriteStage>,
    storage: Arc<dyn Storage>,
    writer_config: WriterConfig,
}

impl WriterTaskExecutor {
    pub fn new(stage: Arc<WriteStage>, storage: Arc<dyn Storage>, writer_config: WriterConfig) -> Self {
        Self {
            stage,
            storage,
            writer_config,
        }
    }

    async fn drive(
        &self,
        assignment: &TaskAssignment,
        writer: &mut PartitionWriter,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let partition = usize::try_from(assignment.task_id.0)
            .map_err(|_| CtasError::Execution(format!("task id {} too large", assignment.task_id)))?;
        let mut stream = self.stage.plan.execute_partition(partition)?;
        let mut rows_in = 0u64;
        while let Some(batch) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(CtasError::Cancelled(format!(
                    "task {} attempt {} cancelled",
                    assignment.task_id, assignment.attempt
                )));
            }
            let batch = batch?;
            for row in rows_from_batch(&batch)? {
                let key = self.stage.evaluator.evaluate(&row)?;
                writer.write(self.stage.layout.project(&row), key)?;
                rows_in += 1;
            }
            debug!(
                query_id = %assignment.query_id,
                stage_id = %assignment.stage_id,
                task_id = %assignment.task_id,
                attempt = assignment.attempt,
                batch_rows = batch.num_rows(),
                buffered_rows = writer.buffered_rows(),
                operator = "WriterTask",
                "batch routed"
            );
        }
        Ok(rows_in)
    }
}

#[async_trait]
impl TaskExecutor for WriterTaskExecutor {
    async fn execute(
        &self,
        assignment: &TaskAssignment,
        cancel: &CancellationToken,
    ) -> Result<TaskWriteOutput> {
        info!(
            query_id = %assignment.query_id,
            stage_id = %assignment.stage_id,
            task_id = %assignment.task_id,
            attempt = assignment.attempt,
            worker_id = %assignment.worker_id,
            operator = "WriterTask",
            "task execution started"
        );
        let mut writer = PartitionWriter::open(
            Arc::clone(&self.storage),
            self.stage.base_location.clone(),
            self.stage.data_schema(),
            WriterContext {
                query_id: assignment.query_id,
                stage_id: assignment.stage_id,
                task_id: assignment.task_id,
                attempt: assignment.attempt,
            },
            self.writer_config.clone(),
        )?;
        match self.drive(assignment, &mut writer, cancel).await {
            Ok(rows_in) => {
                let output = writer.close()?;
                info!(
                    query_id = %assignment.query_id,
                    stage_id = %assignment.stage_id,
                    task_id = %assignment.task_id,
                    attempt = assignment.attempt,
                    rows_in,
                    rows_written = output.stats.rows_written,
                    partitions = output.partitions.len(),
                    operator = "WriterTask",
                    "task execution completed"
                );
                Ok(output)
            }
            Err(e) => {
                warn!(
                    query_id = %assignment.query_id,
                    stage_id = %assignment.stage_id,
                    task_id = %assignment.task_id,
                    attempt = assignment.attempt,
                    error = %e,
                    operator = "WriterTask",
                    "task execution stopped"
                );
                writer.abort();
                Err(e)
            }
        }
    }
}
