//! Upstream plan contract consumed by the write stage.
//!
//! The write stage never looks inside the SELECT it materializes: it only needs the output
//! schema, how many partitions the plan produces and a batch stream per partition. ORDER BY,
//! LIMIT, GROUP BY and UNION are all just different producers of those streams.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use ctas_common::{CtasError, Result};
use futures::Stream;
use futures::stream;

/// Boxed stream of output batches for one upstream partition.
pub type SendableBatchStream = Pin<Box<dyn Stream<Item = Result<RecordBatch>> + Send>>;

pub trait UpstreamPlan: Send + Sync + Debug {
    fn schema(&self) -> SchemaRef;

    /// Number of partitions; one writer task is scheduled per partition.
    fn partition_count(&self) -> usize;

    /// Stream the rows of `partition`. Callable again for a retried task.
    fn execute_partition(&self, partition: usize) -> Result<SendableBatchStream>;
}

/// Pre-partitioned in-memory batches.
#[derive(Debug, Clone)]
pub struct MemoryPlan {
    schema: SchemaRef,
    partitions: Vec<Vec<RecordBatch>>,
}

impl MemoryPlan {
    pub fn try_new(schema: SchemaRef, partitions: Vec<Vec<RecordBatch>>) -> Result<Self> {
        for batch in partitions.iter().flatten() {
            if batch.schema().fields() != schema.fields() {
                return Err(CtasError::Planning(
                    "memory plan batch schema does not match plan schema".to_string(),
                ));
            }
        }
        Ok(Self { schema, partitions })
    }

    /// Spread rows across `partitions` round-robin, the way a parallelism hint fans out a
    /// single input.
    pub fn round_robin(
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        partitions: usize,
    ) -> Result<Self> {
        let partitions = partitions.max(1);
        let mut out = vec![Vec::new(); partitions];
        let mut next = 0usize;
        for batch in &batches {
            let mut indices = vec![Vec::new(); partitions];
            for row in 0..batch.num_rows() {
                indices[(next + row) % partitions].push(row as u32);
            }
            next = (next + batch.num_rows()) % partitions;
            for (p, idx) in indices.into_iter().enumerate() {
                if idx.is_empty() {
                    continue;
                }
                let taken = take_record_batch(batch, &UInt32Array::from(idx))
                    .map_err(|e| CtasError::Planning(format!("round robin split failed: {e}")))?;
                out[p].push(taken);
            }
        }
        Self::try_new(schema, out)
    }

    pub fn total_rows(&self) -> usize {
        self.partitions
            .iter()
            .flatten()
            .map(RecordBatch::num_rows)
            .sum()
    }
}

impl UpstreamPlan for MemoryPlan {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn execute_partition(&self, partition: usize) -> Result<SendableBatchStream> {
        let batches = self.partitions.get(partition).cloned().ok_or_else(|| {
            CtasError::Execution(format!(
                "partition {partition} out of range (plan has {})",
                self.partitions.len()
            ))
        })?;
        Ok(Box::pin(stream::iter(batches.into_iter().map(Ok))))
    }
}

/// UNION ALL of several inputs with the same schema; partitions are concatenated.
#[derive(Debug, Clone)]
pub struct UnionPlan {
    schema: SchemaRef,
    inputs: Vec<Arc<dyn UpstreamPlan>>,
}

impl UnionPlan {
    pub fn try_new(inputs: Vec<Arc<dyn UpstreamPlan>>) -> Result<Self> {
        let first = inputs
            .first()
            .ok_or_else(|| CtasError::Planning("union needs at least one input".to_string()))?;
        let schema = first.schema();
        if inputs.iter().any(|i| i.schema().fields() != schema.fields()) {
            return Err(CtasError::Planning(
                "union inputs must share one schema".to_string(),
            ));
        }
        Ok(Self { schema, inputs })
    }
}

impl UpstreamPlan for UnionPlan {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn partition_count(&self) -> usize {
        self.inputs.iter().map(|i| i.partition_count()).sum()
    }

    fn execute_partition(&self, partition: usize) -> Result<SendableBatchStream> {
        let mut offset = partition;
        for input in &self.inputs {
            let n = input.partition_count();
            if offset < n {
                return input.execute_partition(offset);
            }
            offset -= n;
        }
        Err(CtasError::Execution(format!(
            "partition {partition} out of range (union has {})",
            self.partition_count()
        )))
    }
}
