use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arrow_schema::SchemaRef;
use ctas_common::metrics::global_metrics;
use ctas_common::{CtasError, EngineConfig, QueryId, Result, StageId, TaskId};
use ctas_storage::Storage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::format::encode_rows;
use crate::key::PartitionKeyValue;
use crate::layout::{data_file_name, task_file_prefix};
use crate::stats::{TaskStats, TaskStatsCollector};
use crate::value::{Row, estimate_row_bytes};

/// Buffering limits of one writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_buffered_rows_per_partition: usize,
    pub max_buffered_bytes_per_partition: usize,
    /// Writer-wide row cap; exceeding it flushes the largest buffer.
    pub max_buffered_rows_total: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for WriterConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_buffered_rows_per_partition: cfg.writer_max_buffered_rows_per_partition.max(1),
            max_buffered_bytes_per_partition: cfg.writer_max_buffered_bytes_per_partition.max(1),
            max_buffered_rows_total: cfg.writer_max_buffered_rows_total.max(1),
        }
    }
}

/// Identity of the task attempt a writer belongs to; used for file naming, logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterContext {
    pub query_id: QueryId,
    pub stage_id: StageId,
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A partition location materialized by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInstance {
    pub key: PartitionKeyValue,
    pub location: PathBuf,
}

/// Result of a successfully closed writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskWriteOutput {
    pub stats: TaskStats,
    /// Sorted by key.
    pub partitions: Vec<PartitionInstance>,
}

#[derive(Debug, Default)]
struct PartitionBuffer {
    rows: Vec<Row>,
    estimated_bytes: usize,
    next_seq: u64,
}

/// Routes rows of one task into per-key buffers and flushes them as data files under
/// `base/<col>=<value>/...`.
///
/// Not shared between tasks; no internal locking.
#[derive(Debug)]
pub struct PartitionWriter {
    storage: Arc<dyn Storage>,
    base: PathBuf,
    data_schema: SchemaRef,
    ctx: WriterContext,
    config: WriterConfig,
    buffers: HashMap<PartitionKeyValue, PartitionBuffer>,
    locations: BTreeMap<PartitionKeyValue, PathBuf>,
    buffered_rows_total: usize,
    collector: TaskStatsCollector,
}

impl PartitionWriter {
    /// Open a writer. Attempts after the first remove this task's earlier data files so a
    /// retry never double counts.
    pub fn open(
        storage: Arc<dyn Storage>,
        base: impl Into<PathBuf>,
        data_schema: SchemaRef,
        ctx: WriterContext,
        config: WriterConfig,
    ) -> Result<Self> {
        let base = base.into();
        if ctx.attempt > 1 {
            let removed = remove_task_files(storage.as_ref(), &base, ctx.task_id.0)?;
            info!(
                query_id = %ctx.query_id,
                stage_id = %ctx.stage_id,
                task_id = %ctx.task_id,
                attempt = ctx.attempt,
                removed_files = removed,
                operator = "PartitionWriter",
                "cleaned previous attempt output"
            );
        }
        Ok(Self {
            storage,
            base,
            data_schema,
            collector: TaskStatsCollector::new(ctx.task_id.0, ctx.attempt),
            ctx,
            config,
            buffers: HashMap::new(),
            locations: BTreeMap::new(),
            buffered_rows_total: 0,
        })
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffered_rows_total
    }

    pub fn stats(&self) -> &TaskStats {
        self.collector.snapshot()
    }

    /// Buffer one data row (partition columns already projected out) under `key`.
    pub fn write(&mut self, row: Row, key: PartitionKeyValue) -> Result<()> {
        let width = self.data_schema.fields().len();
        if row.len() != width {
            return Err(CtasError::Execution(format!(
                "row has {} values, data schema has {width} columns",
                row.len()
            )));
        }
        let row_bytes = estimate_row_bytes(&row);
        let buffer = self.buffers.entry(key.clone()).or_default();
        buffer.rows.push(row);
        buffer.estimated_bytes += row_bytes;
        self.buffered_rows_total += 1;

        if buffer.rows.len() >= self.config.max_buffered_rows_per_partition
            || buffer.estimated_bytes >= self.config.max_buffered_bytes_per_partition
        {
            self.flush(&key)?;
        }
        if self.buffered_rows_total > self.config.max_buffered_rows_total
            && let Some(largest) = self.largest_buffer()
        {
            self.flush(&largest)?;
        }
        Ok(())
    }

    fn largest_buffer(&self) -> Option<PartitionKeyValue> {
        self.buffers
            .iter()
            .filter(|(_, b)| !b.rows.is_empty())
            .max_by(|(ka, a), (kb, b)| a.rows.len().cmp(&b.rows.len()).then(kb.cmp(ka)))
            .map(|(k, _)| k.clone())
    }

    /// Persist the buffer of `key` as one data file. Empty buffers are a no-op.
    pub fn flush(&mut self, key: &PartitionKeyValue) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(key) else {
            return Ok(());
        };
        if buffer.rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut buffer.rows);
        buffer.estimated_bytes = 0;
        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        self.buffered_rows_total -= rows.len();

        let started = Instant::now();
        let location = self.resolve_location(key)?;
        let image = encode_rows(&self.data_schema, &rows)?;
        let file = location.join(data_file_name(self.ctx.task_id.0, seq));
        self.storage.write_file(&file, &image)?;

        let row_count = rows.len() as u64;
        let bytes = image.len() as u64;
        self.collector
            .record_flush(&key.relative_name(), row_count, bytes);
        global_metrics().record_partition_flush(
            &self.ctx.query_id.to_string(),
            self.ctx.stage_id.0,
            self.ctx.task_id.0,
            row_count,
            bytes,
            started.elapsed().as_secs_f64(),
        );
        debug!(
            query_id = %self.ctx.query_id,
            stage_id = %self.ctx.stage_id,
            task_id = %self.ctx.task_id,
            attempt = self.ctx.attempt,
            partition = %key,
            rows = row_count,
            bytes,
            file = %file.display(),
            operator = "PartitionWriter",
            "flushed partition buffer"
        );
        Ok(())
    }

    /// Location of `key`, creating its directories on first use.
    fn resolve_location(&mut self, key: &PartitionKeyValue) -> Result<PathBuf> {
        let location = key.location(&self.base);
        if let Some(known) = self.locations.get(key) {
            if known != &location {
                return Err(CtasError::PartitionLocationConflict {
                    key: key.to_string(),
                    existing: known.display().to_string(),
                    conflicting: location.display().to_string(),
                });
            }
            return Ok(location);
        }
        if self.storage.exists(&location)? && !self.storage.is_dir(&location)? {
            return Err(CtasError::PartitionLocationConflict {
                key: key.to_string(),
                existing: format!("{} (not a directory)", location.display()),
                conflicting: location.display().to_string(),
            });
        }
        self.storage.create_dir_all(&location)?;
        global_metrics().inc_partitions_created(
            &self.ctx.query_id.to_string(),
            self.ctx.stage_id.0,
            self.ctx.task_id.0,
        );
        self.locations.insert(key.clone(), location.clone());
        Ok(location)
    }

    /// Flush every remaining buffer and report what this task wrote.
    pub fn close(mut self) -> Result<TaskWriteOutput> {
        let mut pending: Vec<PartitionKeyValue> = self
            .buffers
            .iter()
            .filter(|(_, b)| !b.rows.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        pending.sort();
        for key in &pending {
            self.flush(key)?;
        }
        let partitions = self
            .locations
            .iter()
            .map(|(key, location)| PartitionInstance {
                key: key.clone(),
                location: location.clone(),
            })
            .collect::<Vec<_>>();
        let stats = self.collector.finish();
        info!(
            query_id = %self.ctx.query_id,
            stage_id = %self.ctx.stage_id,
            task_id = %self.ctx.task_id,
            attempt = self.ctx.attempt,
            rows = stats.rows_written,
            files = stats.files_written,
            partitions = partitions.len(),
            operator = "PartitionWriter",
            "writer closed"
        );
        Ok(TaskWriteOutput { stats, partitions })
    }

    /// Discard unflushed rows. Files already flushed stay in place.
    pub fn abort(self) {
        warn!(
            query_id = %self.ctx.query_id,
            stage_id = %self.ctx.stage_id,
            task_id = %self.ctx.task_id,
            attempt = self.ctx.attempt,
            discarded_rows = self.buffered_rows_total,
            operator = "PartitionWriter",
            "writer aborted"
        );
    }
}

/// Remove every data file of `task_id` below `root`. Returns the number removed.
pub fn remove_task_files(storage: &dyn Storage, root: &Path, task_id: u64) -> Result<usize> {
    let prefix = task_file_prefix(task_id);
    let mut removed = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in storage.list_dir(&dir)? {
            if entry.is_dir {
                stack.push(entry.path);
            } else if entry.name.starts_with(&prefix) {
                storage.remove_file(&entry.path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}
