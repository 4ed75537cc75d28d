//! Catalog, table statistics and storage-location contracts for CTAS output.
//!
//! Key modules:
//! - [`catalog`]: table descriptors, partition methods, the [`Catalog`] trait and its
//!   in-memory and JSON-file implementations
//! - [`stats`]: table-level statistics
//! - [`storage`]: the location abstraction writers persist into

pub mod catalog;
pub mod stats;
pub mod storage;

pub use catalog::*;
pub use stats::TableStats;
pub use storage::{DirEntry, LocalStorage, Storage};
