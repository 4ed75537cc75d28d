//! Partitioned output for CTAS writer tasks.
//!
//! Architecture role:
//! - maps each output row to a canonical partition key
//! - buffers rows per key and flushes them as parquet files under `col=value` directories
//! - reports per-task statistics and the set of partition locations it created
//!
//! Key modules:
//! - [`key`]
//! - [`layout`]
//! - [`writer`]
//! - [`reader`]
//! - [`stats`]

pub mod format;
pub mod key;
pub mod layout;
pub mod reader;
pub mod stats;
pub mod value;
pub mod writer;

pub use key::{
    KeyExpr, PartitionKeyColumn, PartitionKeyEvaluator, PartitionKeySpec, PartitionKeyValue,
    PartitionedSchema,
};
pub use reader::PartitionedTableReader;
pub use stats::{PartitionWriteStats, TaskStats, TaskStatsCollector};
pub use value::{Row, ScalarValue};
pub use writer::{PartitionInstance, PartitionWriter, TaskWriteOutput, WriterConfig, WriterContext};
