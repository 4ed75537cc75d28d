//! Table catalog: descriptors, partition methods and the transactional registration API.
//!
//! `create_table` is the single mutation the CTAS path performs. Implementations apply it
//! as one step so no observer ever sees a descriptor without its partition method or
//! statistics.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use arrow_schema::{DataType, Schema};
use ctas_common::{CtasError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::stats::TableStats;

/// One partition-key column of a [`PartitionMethod::Column`] table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionColumn {
    pub name: String,
    pub data_type: DataType,
}

impl PartitionColumn {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Discriminant of [`PartitionMethod`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    None,
    Column,
}

/// How a table's rows are split into physical locations.
///
/// Column order is significant: it fixes directory nesting depth and segment order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionMethod {
    #[default]
    None,
    Column { columns: Vec<PartitionColumn> },
}

impl PartitionMethod {
    pub fn kind(&self) -> PartitionKind {
        match self {
            PartitionMethod::None => PartitionKind::None,
            PartitionMethod::Column { .. } => PartitionKind::Column,
        }
    }

    /// Partition-key columns in declared order; empty for unpartitioned tables.
    pub fn columns(&self) -> &[PartitionColumn] {
        match self {
            PartitionMethod::None => &[],
            PartitionMethod::Column { columns } => columns,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        !self.columns().is_empty()
    }
}

/// A discovered partition as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDesc {
    /// Relative directory under the table path, e.g. `key=17.0`.
    pub name: String,
    /// Canonical value per partition column, in declared order.
    pub values: Vec<String>,
    /// Absolute location of the partition directory.
    pub path: String,
}

/// Catalog entry for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    /// Full logical schema. Partition columns are included and appear last.
    pub schema: Schema,
    /// Base storage location.
    pub path: String,
    #[serde(default)]
    pub partition_method: PartitionMethod,
    #[serde(default)]
    pub partitions: Vec<PartitionDesc>,
    #[serde(default)]
    pub stats: TableStats,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl TableDescriptor {
    /// Check internal consistency before the descriptor is published.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CtasError::InvalidConfig(
                "table name must not be empty".to_string(),
            ));
        }
        if self.path.trim().is_empty() {
            return Err(CtasError::InvalidConfig(format!(
                "table '{}' must define a storage path",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for field in self.schema.fields() {
            if !seen.insert(field.name().as_str()) {
                return Err(CtasError::InvalidConfig(format!(
                    "table '{}' has duplicate column '{}'",
                    self.name,
                    field.name()
                )));
            }
        }
        let columns = self.partition_method.columns();
        for col in columns {
            let field = self.schema.field_with_name(&col.name).map_err(|_| {
                CtasError::InvalidConfig(format!(
                    "partition column '{}' is not part of table '{}'",
                    col.name, self.name
                ))
            })?;
            if field.data_type() != &col.data_type {
                return Err(CtasError::InvalidConfig(format!(
                    "partition column '{}' declared as {:?} but schema has {:?}",
                    col.name,
                    col.data_type,
                    field.data_type()
                )));
            }
        }
        for p in &self.partitions {
            if p.values.len() != columns.len() {
                return Err(CtasError::InvalidConfig(format!(
                    "partition '{}' has {} values for {} partition columns",
                    p.name,
                    p.values.len(),
                    columns.len()
                )));
            }
        }
        Ok(())
    }
}

/// Catalog service contract.
///
/// Each call is atomic on its own; `create_table` either registers the whole descriptor
/// or fails with [`CtasError::TableAlreadyExists`] leaving state untouched.
pub trait Catalog: Send + Sync + std::fmt::Debug {
    fn exists_table(&self, name: &str) -> Result<bool>;

    fn get_table_desc(&self, name: &str) -> Result<TableDescriptor>;

    fn create_table(&self, desc: TableDescriptor) -> Result<()>;

    /// Replace the statistics of an existing table.
    fn update_table_stats(&self, name: &str, stats: TableStats) -> Result<()>;

    /// Registered table names, sorted.
    fn list_tables(&self) -> Result<Vec<String>>;
}

/// Identifiers are case-insensitive.
pub fn normalize_table_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: RwLock<HashMap<String, TableDescriptor>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Catalog for MemoryCatalog {
    fn exists_table(&self, name: &str) -> Result<bool> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.contains_key(&normalize_table_name(name)))
    }

    fn get_table_desc(&self, name: &str) -> Result<TableDescriptor> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        tables
            .get(&normalize_table_name(name))
            .cloned()
            .ok_or_else(|| CtasError::UnknownTable(name.to_string()))
    }

    fn create_table(&self, desc: TableDescriptor) -> Result<()> {
        desc.validate()?;
        let key = normalize_table_name(&desc.name);
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if tables.contains_key(&key) {
            return Err(CtasError::TableAlreadyExists(desc.name));
        }
        debug!(table = %desc.name, operator = "MemoryCatalog", "table registered");
        tables.insert(key, desc);
        Ok(())
    }

    fn update_table_stats(&self, name: &str, stats: TableStats) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let desc = tables
            .get_mut(&normalize_table_name(name))
            .ok_or_else(|| CtasError::UnknownTable(name.to_string()))?;
        desc.stats = stats;
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let mut names = tables.values().map(|t| t.name.clone()).collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }
}

/// JSON-file backed catalog.
///
/// Mutations reload the file, apply the change, write a staged sibling and rename it over
/// the target while holding the catalog lock.
#[derive(Debug)]
pub struct FileCatalog {
    path: PathBuf,
    tables: Mutex<HashMap<String, TableDescriptor>>,
}

impl FileCatalog {
    /// Open the catalog at `path`, creating an empty one if the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = load_tables(&path)?;
        info!(
            catalog = %path.display(),
            tables = tables.len(),
            operator = "FileCatalog",
            "catalog opened"
        );
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, TableDescriptor>) -> Result<()>,
    {
        let mut guard = self.tables.lock().map_err(|_| poisoned())?;
        let mut next = load_tables(&self.path)?;
        apply(&mut next)?;
        persist_tables(&self.path, &next)?;
        *guard = next;
        Ok(())
    }
}

impl Catalog for FileCatalog {
    fn exists_table(&self, name: &str) -> Result<bool> {
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        Ok(tables.contains_key(&normalize_table_name(name)))
    }

    fn get_table_desc(&self, name: &str) -> Result<TableDescriptor> {
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        tables
            .get(&normalize_table_name(name))
            .cloned()
            .ok_or_else(|| CtasError::UnknownTable(name.to_string()))
    }

    fn create_table(&self, desc: TableDescriptor) -> Result<()> {
        desc.validate()?;
        self.mutate(|tables| {
            let key = normalize_table_name(&desc.name);
            if tables.contains_key(&key) {
                return Err(CtasError::TableAlreadyExists(desc.name.clone()));
            }
            tables.insert(key, desc.clone());
            Ok(())
        })?;
        info!(
            table = %desc.name,
            catalog = %self.path.display(),
            operator = "FileCatalog",
            "table registered"
        );
        Ok(())
    }

    fn update_table_stats(&self, name: &str, stats: TableStats) -> Result<()> {
        self.mutate(|tables| {
            let desc = tables
                .get_mut(&normalize_table_name(name))
                .ok_or_else(|| CtasError::UnknownTable(name.to_string()))?;
            desc.stats = stats;
            Ok(())
        })
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        let mut names = tables.values().map(|t| t.name.clone()).collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }
}

fn load_tables(path: &Path) -> Result<HashMap<String, TableDescriptor>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let s = fs::read_to_string(path)?;
    if s.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let tables: Vec<TableDescriptor> =
        serde_json::from_str(&s).map_err(|e| CtasError::InvalidConfig(e.to_string()))?;
    Ok(tables
        .into_iter()
        .map(|t| (normalize_table_name(&t.name), t))
        .collect())
}

fn persist_tables(path: &Path, tables: &HashMap<String, TableDescriptor>) -> Result<()> {
    let mut ordered = tables.values().collect::<Vec<_>>();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));
    let payload = serde_json::to_vec_pretty(&ordered)
        .map_err(|e| CtasError::Execution(format!("catalog json encode failed: {e}")))?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let staged = staged_sibling_path(path);
    fs::write(&staged, &payload)?;
    if let Err(e) = fs::rename(&staged, path) {
        let _ = fs::remove_file(&staged);
        return Err(CtasError::Execution(format!(
            "catalog commit failed: {} -> {} ({e})",
            staged.display(),
            path.display()
        )));
    }
    Ok(())
}

fn staged_sibling_path(path: &Path) -> PathBuf {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("catalog");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    parent.join(format!(".ctas_staged_{stem}_{nanos}.tmp"))
}

fn poisoned() -> CtasError {
    CtasError::Execution("catalog lock poisoned".to_string())
}
