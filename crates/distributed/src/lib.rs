//! Distributed CTAS execution: write-stage scheduling, statistics aggregation and the
//! catalog commit.
//!
//! Architecture role:
//! - [`scheduler`] fans one writer task per upstream partition over a worker pool
//! - [`task`] streams a partition through the partition writer
//! - [`aggregate`] and [`commit`] turn successful task outputs into a registered table
//! - [`ctas`] drives a whole statement end to end
//!
//! Key modules:
//! - [`plan`]
//! - [`stage`]
//! - [`task`]
//! - [`scheduler`]
//! - [`aggregate`]
//! - [`commit`]
//! - [`ctas`]

pub mod aggregate;
pub mod commit;
pub mod ctas;
pub mod plan;
pub mod scheduler;
pub mod stage;
pub mod task;

pub use aggregate::aggregate;
pub use commit::{CommitCoordinator, CommitRequest, reconcile_partitions};
pub use ctas::{CtasExecutor, CtasOutcome, CtasStatement};
pub use plan::{MemoryPlan, SendableBatchStream, UnionPlan, UpstreamPlan};
pub use scheduler::{SchedulerConfig, StageOutcome, StageScheduler, WorkerPool, WorkerSlots};
pub use stage::{StageExecution, StageState, TaskState, TaskStatus, WriteStage};
pub use task::{TaskAssignment, TaskExecutor, WriterTaskExecutor};
