//! CREATE TABLE AS SELECT driver.
//!
//! Wires the pieces together: early existence check, schema split, write stage, statistics
//! aggregation, partition reconciliation and the single catalog commit. A statement ends
//! with exactly one terminal error or a registered table.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ctas_common::metrics::global_metrics;
use ctas_common::{CtasError, EngineConfig, QueryId, Result, StageId};
use ctas_partition::{PartitionKeySpec, WriterConfig};
use ctas_storage::{Catalog, Storage, TableDescriptor, normalize_table_name};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::aggregate;
use crate::commit::{CommitCoordinator, CommitRequest};
use crate::plan::UpstreamPlan;
use crate::scheduler::{SchedulerConfig, StageScheduler, WorkerPool};
use crate::stage::{StageExecution, WriteStage};
use crate::task::{TaskExecutor, WriterTaskExecutor};

const WRITE_STAGE_ID: StageId = StageId(0);

/// A planned CTAS statement.
#[derive(Debug, Clone)]
pub struct CtasStatement {
    pub table_name: String,
    /// Finished SELECT plan whose rows become the table.
    pub plan: Arc<dyn UpstreamPlan>,
    pub partition_spec: PartitionKeySpec,
    /// Explicit base location; defaults to `<warehouse_dir>/<table>`.
    pub location: Option<PathBuf>,
}

impl CtasStatement {
    pub fn new(
        table_name: impl Into<String>,
        plan: Arc<dyn UpstreamPlan>,
        partition_spec: PartitionKeySpec,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            plan,
            partition_spec,
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CtasOutcome {
    pub query_id: QueryId,
    pub descriptor: TableDescriptor,
    pub execution: StageExecution,
}

#[derive(Debug)]
pub struct CtasExecutor {
    config: EngineConfig,
    catalog: Arc<dyn Catalog>,
    storage: Arc<dyn Storage>,
    scheduler: StageScheduler,
    next_query_id: AtomicU64,
}

impl CtasExecutor {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn Catalog>,
        storage: Arc<dyn Storage>,
        pool: WorkerPool,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = StageScheduler::new(SchedulerConfig::from(&config), pool);
        Ok(Self {
            config,
            catalog,
            storage,
            scheduler,
            next_query_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn execute(&self, stmt: CtasStatement) -> Result<CtasOutcome> {
        self.execute_with_cancel(stmt, CancellationToken::new())
            .await
    }

    /// Run the statement; cancelling `cancel` stops the write stage before commit.
    pub async fn execute_with_cancel(
        &self,
        stmt: CtasStatement,
        cancel: CancellationToken,
    ) -> Result<CtasOutcome> {
        let query_id = QueryId(self.next_query_id.fetch_add(1, Ordering::SeqCst));
        let name = normalize_table_name(&stmt.table_name);
        if name.is_empty() {
            return Err(CtasError::Planning("table name must not be empty".to_string()));
        }
        if self.catalog.exists_table(&name)? {
            global_metrics().inc_catalog_commits("already_exists");
            warn!(
                query_id = %query_id,
                table = %name,
                operator = "CtasExecutor",
                "target table already exists, nothing written"
            );
            return Err(CtasError::TableAlreadyExists(name));
        }

        let base = stmt
            .location
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.config.warehouse_dir).join(&name));
        let stage = Arc::new(WriteStage::try_new(
            query_id,
            WRITE_STAGE_ID,
            Arc::clone(&stmt.plan),
            stmt.partition_spec.clone(),
            base.clone(),
        )?);
        info!(
            query_id = %query_id,
            table = %name,
            location = %base.display(),
            partition_columns = ?stmt.partition_spec.names(),
            tasks = stage.task_count(),
            operator = "CtasExecutor",
            "CTAS started"
        );
        self.storage.create_dir_all(&base)?;

        let executor: Arc<dyn TaskExecutor> = Arc::new(WriterTaskExecutor::new(
            Arc::clone(&stage),
            Arc::clone(&self.storage),
            WriterConfig::from(&self.config),
        ));
        let outcome = match self
            .scheduler
            .run(
                query_id,
                WRITE_STAGE_ID,
                stage.task_count(),
                executor,
                cancel,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    query_id = %query_id,
                    table = %name,
                    error = %e,
                    operator = "CtasExecutor",
                    "CTAS write stage failed, table not registered"
                );
                self.discard_output(query_id, &base);
                return Err(e);
            }
        };

        let task_stats: Vec<_> = outcome.outputs.iter().map(|o| o.stats.clone()).collect();
        let stats = aggregate(&task_stats);
        let request = CommitRequest {
            name: name.clone(),
            schema: stage.layout.table_schema.clone(),
            path: base,
            partition_method: stmt.partition_spec.partition_method(),
            partitions: outcome
                .outputs
                .iter()
                .map(|o| o.partitions.clone())
                .collect(),
            stats,
        };
        let descriptor = CommitCoordinator::new(Arc::clone(&self.catalog), Arc::clone(&self.storage))
            .commit(request)?;
        info!(
            query_id = %query_id,
            table = %name,
            rows = descriptor.stats.num_rows,
            partitions = descriptor.stats.num_partitions,
            operator = "CtasExecutor",
            "CTAS completed"
        );
        Ok(CtasOutcome {
            query_id,
            descriptor,
            execution: outcome.execution,
        })
    }

    fn discard_output(&self, query_id: QueryId, base: &std::path::Path) {
        if !self.config.cleanup_failed_output {
            return;
        }
        match self.storage.remove_dir_all(base) {
            Ok(()) => info!(
                query_id = %query_id,
                location = %base.display(),
                operator = "CtasExecutor",
                "removed partial output"
            ),
            Err(e) => warn!(
                query_id = %query_id,
                location = %base.display(),
                error = %e,
                operator = "CtasExecutor",
                "failed to remove partial output"
            ),
        }
    }
}
