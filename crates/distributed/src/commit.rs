//! Catalog commit: reconcile the discovered partitions, validate them and publish the
//! table with one atomic catalog call.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow_schema::Schema;
use ctas_common::metrics::global_metrics;
use ctas_common::{CtasError, Result};
use ctas_partition::{PartitionInstance, PartitionKeyValue};
use ctas_storage::{Catalog, PartitionMethod, Storage, TableDescriptor, TableStats};
use tracing::{info, warn};

/// Everything needed to register a new table after its write stage succeeded.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub name: String,
    /// Full table schema, partition columns last.
    pub schema: Schema,
    pub path: PathBuf,
    pub partition_method: PartitionMethod,
    /// Partition instances as reported by each task.
    pub partitions: Vec<Vec<PartitionInstance>>,
    /// Aggregated statistics; `num_partitions` is overwritten from the reconciled set.
    pub stats: TableStats,
}

/// Deduplicate per-task partition reports by key.
///
/// An equal key reported with two different locations is a
/// [`CtasError::PartitionLocationConflict`]. Unpartitioned instances are dropped. The result
/// is sorted by location.
pub fn reconcile_partitions(per_task: &[Vec<PartitionInstance>]) -> Result<Vec<PartitionInstance>> {
    let mut by_key: BTreeMap<&PartitionKeyValue, &PathBuf> = BTreeMap::new();
    for instance in per_task.iter().flatten() {
        if instance.key.is_unpartitioned() {
            continue;
        }
        match by_key.get(&instance.key) {
            Some(existing) if **existing != instance.location => {
                return Err(CtasError::PartitionLocationConflict {
                    key: instance.key.to_string(),
                    existing: existing.display().to_string(),
                    conflicting: instance.location.display().to_string(),
                });
            }
            Some(_) => {}
            None => {
                by_key.insert(&instance.key, &instance.location);
            }
        }
    }
    let mut out: Vec<PartitionInstance> = by_key
        .into_iter()
        .map(|(key, location)| PartitionInstance {
            key: key.clone(),
            location: location.clone(),
        })
        .collect();
    out.sort_by(|a, b| a.location.cmp(&b.location));
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct CommitCoordinator {
    catalog: Arc<dyn Catalog>,
    storage: Arc<dyn Storage>,
}

impl CommitCoordinator {
    pub fn new(catalog: Arc<dyn Catalog>, storage: Arc<dyn Storage>) -> Self {
        Self { catalog, storage }
    }

    /// Register the table. Nothing reaches the catalog unless every check passes; each
    /// partition must sit at the canonical location its key derives under the table path.
    pub fn commit(&self, request: CommitRequest) -> Result<TableDescriptor> {
        let result = self.try_commit(request);
        let outcome = match &result {
            Ok(_) => "committed",
            Err(CtasError::TableAlreadyExists(_)) => "already_exists",
            Err(CtasError::MissingPartitionLocation { .. }) => "missing_location",
            Err(CtasError::PartitionLocationConflict { .. }) => "location_conflict",
            Err(_) => "failed",
        };
        global_metrics().inc_catalog_commits(outcome);
        result
    }

    fn try_commit(&self, request: CommitRequest) -> Result<TableDescriptor> {
        if self.catalog.exists_table(&request.name)? {
            return Err(CtasError::TableAlreadyExists(request.name));
        }
        let partitions = reconcile_partitions(&request.partitions)?;
        for p in &partitions {
            let expected = p.key.location(&request.path);
            if p.location != expected {
                warn!(
                    table = %request.name,
                    key = %p.key,
                    location = %p.location.display(),
                    operator = "CommitCoordinator",
                    "partition reported outside its table path"
                );
                return Err(CtasError::PartitionLocationConflict {
                    key: p.key.to_string(),
                    existing: expected.display().to_string(),
                    conflicting: p.location.display().to_string(),
                });
            }
        }

        if !self.storage.is_dir(&request.path)? {
            return Err(self.missing(&request.name, &request.path));
        }
        for p in &partitions {
            if !self.storage.is_dir(&p.location)? {
                return Err(self.missing(&request.name, &p.location));
            }
        }

        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let desc = TableDescriptor {
            name: request.name,
            schema: request.schema,
            path: request.path.to_string_lossy().to_string(),
            partition_method: request.partition_method,
            partitions: partitions
                .iter()
                .map(|p| p.key.to_desc(&p.location))
                .collect(),
            stats: TableStats {
                num_partitions: partitions.len() as u64,
                ..request.stats
            },
            created_at_ms,
        };
        desc.validate()?;
        self.catalog.create_table(desc.clone())?;
        info!(
            table = %desc.name,
            path = %desc.path,
            rows = desc.stats.num_rows,
            files = desc.stats.num_files,
            partitions = desc.partitions.len(),
            operator = "CommitCoordinator",
            "table committed"
        );
        Ok(desc)
    }

    fn missing(&self, table: &str, location: &std::path::Path) -> CtasError {
        warn!(
            table = %table,
            location = %location.display(),
            operator = "CommitCoordinator",
            "partition location missing at commit"
        );
        CtasError::MissingPartitionLocation {
            table: table.to_string(),
            location: location.display().to_string(),
        }
    }
}
