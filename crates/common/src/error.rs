use thiserror::Error;

/// Canonical CTAS error taxonomy used across crates.
///
/// Classification guidance:
/// - [`CtasError::InvalidPartitionValue`]: a partition key evaluated to a value that cannot
///   name a directory; fatal to the producing task
/// - [`CtasError::WriteFailure`]: storage write failed; eligible for bounded task retry
/// - [`CtasError::PartitionLocationConflict`]: one key resolved to two locations; fatal to
///   the whole stage
/// - [`CtasError::TableAlreadyExists`]: CTAS target name is taken; surfaced before any write
/// - [`CtasError::MissingPartitionLocation`]: post-stage validation found a recorded key
///   without a physical location; the commit fails and the catalog is left untouched
#[derive(Debug, Error)]
pub enum CtasError {
    /// A partition-key expression produced null or a type that cannot be rendered as a
    /// path segment.
    #[error("invalid partition value for column '{column}': {reason}")]
    InvalidPartitionValue {
        /// Partition-key column name.
        column: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Underlying storage write error.
    #[error("write failure: {0}")]
    WriteFailure(String),

    /// The same partition key mapped to two structurally different locations.
    #[error("partition location conflict for key '{key}': '{existing}' vs '{conflicting}'")]
    PartitionLocationConflict {
        /// Rendered partition key.
        key: String,
        /// Location recorded first.
        existing: String,
        /// Location that disagrees with it.
        conflicting: String,
    },

    /// Catalog already holds a table with this name.
    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    /// A recorded partition has no physical location under the table path.
    #[error("missing partition location for table '{table}': {location}")]
    MissingPartitionLocation {
        /// Target table.
        table: String,
        /// Expected location.
        location: String,
    },

    /// Catalog lookup for a name that is not registered.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Invalid or inconsistent configuration/catalog state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Statement shape issues found before the stage starts (unknown columns, bad key
    /// specs, empty plans).
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime failures after planning succeeded (decode/encode, batch shape mismatch).
    #[error("execution error: {0}")]
    Execution(String),

    /// Task or stage stopped by a cancellation signal.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CtasError {
    /// Whether a task failing with this error may be re-dispatched.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CtasError::WriteFailure(_) | CtasError::Io(_))
    }

    /// Whether this error must fail the whole stage immediately, regardless of retry budget.
    pub fn is_stage_fatal(&self) -> bool {
        matches!(self, CtasError::PartitionLocationConflict { .. })
    }

    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CtasError::InvalidPartitionValue { .. } => "invalid_partition_value",
            CtasError::WriteFailure(_) => "write_failure",
            CtasError::PartitionLocationConflict { .. } => "partition_location_conflict",
            CtasError::TableAlreadyExists(_) => "table_already_exists",
            CtasError::MissingPartitionLocation { .. } => "missing_partition_location",
            CtasError::UnknownTable(_) => "unknown_table",
            CtasError::InvalidConfig(_) => "invalid_config",
            CtasError::Planning(_) => "planning",
            CtasError::Execution(_) => "execution",
            CtasError::Cancelled(_) => "cancelled",
            CtasError::Io(_) => "io",
        }
    }
}

/// Standard CTAS result alias.
pub type Result<T> = std::result::Result<T, CtasError>;

#[cfg(test)]
mod tests {
    use super::CtasError;

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(CtasError::WriteFailure("disk full".to_string()).is_retryable());
        assert!(CtasError::Io(std::io::Error::other("reset")).is_retryable());
        assert!(
            !CtasError::InvalidPartitionValue {
                column: "key".to_string(),
                reason: "null".to_string(),
            }
            .is_retryable()
        );
        assert!(!CtasError::TableAlreadyExists("t".to_string()).is_retryable());
    }

    #[test]
    fn location_conflict_is_stage_fatal() {
        let err = CtasError::PartitionLocationConflict {
            key: "key=1".to_string(),
            existing: "/a/key=1".to_string(),
            conflicting: "/b/key=1".to_string(),
        };
        assert!(err.is_stage_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "partition_location_conflict");
    }
}
