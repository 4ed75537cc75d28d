#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{Float64Array, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use ctas_common::{CtasError, EngineConfig, Result};
use ctas_distributed::{CtasExecutor, WorkerPool};
use ctas_storage::{Catalog, DirEntry, LocalStorage, Storage};

pub const KEYS: [f64; 8] = [17.0, 36.0, 38.0, 38.0, 45.0, 45.0, 45.0, 49.0];

pub fn unique_path(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}"))
}

pub fn test_config(warehouse: &Path) -> EngineConfig {
    EngineConfig {
        warehouse_dir: warehouse.to_string_lossy().to_string(),
        retry_backoff_base_ms: 1,
        ..EngineConfig::default()
    }
}

pub fn executor(
    config: EngineConfig,
    catalog: Arc<dyn Catalog>,
    storage: Arc<dyn Storage>,
) -> CtasExecutor {
    CtasExecutor::new(config, catalog, storage, WorkerPool::local(2, 2)).expect("executor")
}

/// `(col1, col2, key)` rows with the eight fixed key values.
pub fn lineitem_batch() -> (SchemaRef, RecordBatch) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("col1", DataType::Int64, false),
        Field::new("col2", DataType::Int64, false),
        Field::new("key", DataType::Float64, true),
    ]));
    let n = KEYS.len() as i64;
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from((1..=n).collect::<Vec<_>>())),
            Arc::new(Int64Array::from((1..=n).map(|v| v * 100).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(KEYS.to_vec())),
        ],
    )
    .expect("batch");
    (schema, batch)
}

pub fn subdirs(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// Fails the `fail_on`-th write (1-based) of files whose name starts with `prefix`.
#[derive(Debug)]
pub struct FlakyStorage {
    inner: LocalStorage,
    prefix: String,
    fail_on: usize,
    seen: AtomicUsize,
    pub failures: AtomicUsize,
}

impl FlakyStorage {
    pub fn new(prefix: &str, fail_on: usize) -> Self {
        Self {
            inner: LocalStorage::new(),
            prefix: prefix.to_string(),
            fail_on,
            seen: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }
}

impl Storage for FlakyStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path)
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        self.inner.is_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.create_dir_all(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let matches = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(&self.prefix))
            .unwrap_or(false);
        if matches && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(CtasError::WriteFailure(format!(
                "injected failure writing {}",
                path.display()
            )));
        }
        self.inner.write_file(path, data)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.inner.list_dir(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.inner.remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.remove_dir_all(path)
    }
}

/// Reports directories whose name equals `hidden` as absent, like a location removed by an
/// external cleaner between the write stage and the commit.
#[derive(Debug)]
pub struct HidingStorage {
    inner: LocalStorage,
    hidden: String,
}

impl HidingStorage {
    pub fn new(hidden: &str) -> Self {
        Self {
            inner: LocalStorage::new(),
            hidden: hidden.to_string(),
        }
    }

    fn is_hidden(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy() == self.hidden)
            .unwrap_or(false)
    }
}

impl Storage for HidingStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(!self.is_hidden(path) && self.inner.exists(path)?)
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(!self.is_hidden(path) && self.inner.is_dir(path)?)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.create_dir_all(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.inner.write_file(path, data)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.inner.list_dir(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.inner.remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.remove_dir_all(path)
    }
}
