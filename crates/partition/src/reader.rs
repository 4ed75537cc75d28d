use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use ctas_common::{CtasError, Result};
use ctas_storage::{PartitionMethod, Storage, TableDescriptor};

use crate::format::decode_batches;
use crate::key::PartitionKeyValue;
use crate::layout::{is_data_file, parse_partition_segment, parse_partition_value};
use crate::value::{Row, ScalarValue, rows_from_batch, rows_to_batch};

/// Reads a committed partitioned table back into full-schema rows.
///
/// Partition values come from the directory names and are appended after the data columns,
/// matching the registered table schema. No pruning is performed.
#[derive(Debug, Clone)]
pub struct PartitionedTableReader {
    storage: Arc<dyn Storage>,
}

impl PartitionedTableReader {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn read_table(&self, desc: &TableDescriptor) -> Result<Vec<Row>> {
        let columns = desc.partition_method.columns();
        if columns.is_empty() {
            return self.read_location(Path::new(&desc.path), &[]);
        }
        let mut out = Vec::new();
        for partition in &desc.partitions {
            let mut values = Vec::with_capacity(columns.len());
            for (col, raw) in columns.iter().zip(&partition.values) {
                values.push(parse_partition_value(&col.name, raw, &col.data_type)?);
            }
            out.extend(self.read_location(Path::new(&partition.path), &values)?);
        }
        Ok(out)
    }

    pub fn read_table_batch(&self, desc: &TableDescriptor) -> Result<RecordBatch> {
        let rows = self.read_table(desc)?;
        rows_to_batch(&Arc::new(desc.schema.clone()), &rows)
    }

    fn read_location(&self, location: &Path, partition_values: &[ScalarValue]) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        for entry in self.storage.list_dir(location)? {
            if entry.is_dir || !is_data_file(&entry.name) {
                continue;
            }
            let batches = decode_batches(self.storage.read_file(&entry.path)?)?;
            for batch in &batches {
                for mut row in rows_from_batch(batch)? {
                    row.extend(partition_values.iter().cloned());
                    out.push(row);
                }
            }
        }
        Ok(out)
    }

    /// Walk `base` and return every leaf directory that matches the method's column nesting.
    pub fn discover_partitions(
        &self,
        base: &Path,
        method: &PartitionMethod,
    ) -> Result<Vec<(PartitionKeyValue, PathBuf)>> {
        let columns = method.columns();
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        let mut stack: Vec<(PathBuf, Vec<String>)> = vec![(base.to_path_buf(), Vec::new())];
        while let Some((dir, values)) = stack.pop() {
            let depth = values.len();
            if depth == columns.len() {
                let names = columns.iter().map(|c| c.name.clone()).collect();
                found.push((PartitionKeyValue::from_parts(names, values)?, dir));
                continue;
            }
            for entry in self.storage.list_dir(&dir)? {
                if !entry.is_dir {
                    continue;
                }
                let Ok((col, value)) = parse_partition_segment(&entry.name) else {
                    continue;
                };
                if col != columns[depth].name {
                    return Err(CtasError::Execution(format!(
                        "unexpected partition directory '{}' at depth {depth}, expected column '{}'",
                        entry.path.display(),
                        columns[depth].name
                    )));
                }
                let mut next = values.clone();
                next.push(value);
                stack.push((entry.path, next));
            }
        }
        found.sort();
        Ok(found)
    }
}
