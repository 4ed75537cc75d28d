//! Shared configuration, error types, IDs, and metrics for the CTAS crates.
//!
//! Architecture role:
//! - defines engine configuration passed to writers and the stage scheduler
//! - provides the common [`CtasError`] / [`Result`] contracts
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{CtasError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
