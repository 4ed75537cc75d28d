use serde::{Deserialize, Serialize};

/// Table-level statistics attached to a descriptor at commit time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Total rows across all partitions.
    pub num_rows: u64,
    /// Total encoded bytes across all data files.
    pub num_bytes: u64,
    /// Number of data files.
    pub num_files: u64,
    /// Number of distinct partition locations (0 for unpartitioned tables).
    pub num_partitions: u64,
}

impl TableStats {
    /// Fold another partial statistic into this one.
    ///
    /// Saturating addition keeps the merge associative and commutative.
    pub fn merge(&mut self, other: &TableStats) {
        self.num_rows = self.num_rows.saturating_add(other.num_rows);
        self.num_bytes = self.num_bytes.saturating_add(other.num_bytes);
        self.num_files = self.num_files.saturating_add(other.num_files);
        self.num_partitions = self.num_partitions.saturating_add(other.num_partitions);
    }
}
