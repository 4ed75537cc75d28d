use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Counters for one partition location within one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionWriteStats {
    pub rows: u64,
    pub bytes: u64,
    pub files: u64,
}

/// What one writer task produced. Only flushed data is counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub task_id: u64,
    pub attempt: u32,
    pub rows_written: u64,
    pub bytes_written: u64,
    pub files_written: u64,
    /// Keyed by relative partition name; `""` for unpartitioned output.
    pub partitions: BTreeMap<String, PartitionWriteStats>,
}

/// Accumulates [`TaskStats`] as a writer flushes buffers.
#[derive(Debug)]
pub struct TaskStatsCollector {
    stats: TaskStats,
}

impl TaskStatsCollector {
    pub fn new(task_id: u64, attempt: u32) -> Self {
        Self {
            stats: TaskStats {
                task_id,
                attempt,
                ..TaskStats::default()
            },
        }
    }

    pub fn record_flush(&mut self, partition: &str, rows: u64, bytes: u64) {
        self.stats.rows_written = self.stats.rows_written.saturating_add(rows);
        self.stats.bytes_written = self.stats.bytes_written.saturating_add(bytes);
        self.stats.files_written = self.stats.files_written.saturating_add(1);
        let p = self
            .stats
            .partitions
            .entry(partition.to_string())
            .or_default();
        p.rows = p.rows.saturating_add(rows);
        p.bytes = p.bytes.saturating_add(bytes);
        p.files = p.files.saturating_add(1);
    }

    pub fn snapshot(&self) -> &TaskStats {
        &self.stats
    }

    pub fn finish(self) -> TaskStats {
        self.stats
    }
}
