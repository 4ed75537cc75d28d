mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use arrow::array::{Float64Array, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use common::{
    FlakyStorage, HidingStorage, executor, lineitem_batch, subdirs, test_config, unique_path,
};
use ctas_common::{CtasError, EngineConfig, TaskId};
use ctas_distributed::{CtasStatement, MemoryPlan, TaskState};
use ctas_partition::{PartitionKeyColumn, PartitionKeySpec, PartitionedTableReader};
use ctas_storage::{
    Catalog, LocalStorage, MemoryCatalog, PartitionMethod, Storage, TableDescriptor,
    TableStats,
};
use tokio_util::sync::CancellationToken;

fn key_spec() -> PartitionKeySpec {
    PartitionKeySpec::new(vec![PartitionKeyColumn::column("key", DataType::Float64)])
}

fn lineitem_plan(parallelism: usize) -> Arc<MemoryPlan> {
    let (schema, batch) = lineitem_batch();
    Arc::new(MemoryPlan::round_robin(schema, vec![batch], parallelism).expect("plan"))
}

#[tokio::test]
async fn existing_table_fails_before_any_write() {
    let warehouse = unique_path("ctas_fail_exists");
    let catalog = Arc::new(MemoryCatalog::new());
    catalog
        .create_table(TableDescriptor {
            name: "t1".to_string(),
            schema: Schema::new(vec![Field::new("a", DataType::Int64, true)]),
            path: "/elsewhere/t1".to_string(),
            partition_method: PartitionMethod::None,
            partitions: Vec::new(),
            stats: TableStats::default(),
            created_at_ms: 0,
        })
        .expect("seed table");
    let exec = executor(
        test_config(&warehouse),
        catalog.clone(),
        Arc::new(LocalStorage::new()),
    );

    let err = exec
        .execute(CtasStatement::new("T1", lineitem_plan(3), key_spec()))
        .await
        .expect_err("duplicate table");
    assert!(matches!(err, CtasError::TableAlreadyExists(ref name) if name == "t1"));
    assert!(!warehouse.join("t1").exists());
    assert_eq!(
        catalog.get_table_desc("t1").expect("desc").path,
        "/elsewhere/t1"
    );
}

#[tokio::test]
async fn retried_task_does_not_double_count_rows() {
    let warehouse = unique_path("ctas_fail_retry");
    let catalog = Arc::new(MemoryCatalog::new());
    // Every row flushes on its own; task 1 fails on its second file, after one file landed.
    let flaky = Arc::new(FlakyStorage::new("part-00001-", 2));
    let storage: Arc<dyn Storage> = flaky.clone();
    let config = EngineConfig {
        writer_max_buffered_rows_per_partition: 1,
        ..test_config(&warehouse)
    };
    let exec = executor(config, catalog, Arc::clone(&storage));

    let outcome = exec
        .execute(CtasStatement::new("retried", lineitem_plan(3), key_spec()))
        .await
        .expect("ctas succeeds after retry");
    assert_eq!(flaky.failures.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.execution.task(TaskId(1)).expect("task").attempt, 2);
    assert_eq!(
        outcome.execution.count_in(TaskState::Succeeded),
        outcome.execution.task_count()
    );

    let desc = outcome.descriptor;
    assert_eq!(desc.stats.num_rows, 8);
    assert_eq!(desc.stats.num_files, 8);
    let rows = PartitionedTableReader::new(Arc::new(LocalStorage::new()))
        .read_table(&desc)
        .expect("read back");
    assert_eq!(rows.len(), 8);
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn exhausted_retries_fail_the_statement() {
    let warehouse = unique_path("ctas_fail_exhausted");
    let catalog = Arc::new(MemoryCatalog::new());
    let flaky = Arc::new(FlakyStorage::new("part-00000-", 1));
    let config = EngineConfig {
        max_task_attempts: 1,
        ..test_config(&warehouse)
    };
    let exec = executor(config, catalog.clone(), flaky);

    let err = exec
        .execute(CtasStatement::new("exhausted", lineitem_plan(2), key_spec()))
        .await
        .expect_err("no retries left");
    assert!(matches!(err, CtasError::WriteFailure(_)));
    assert!(!catalog.exists_table("exhausted").expect("exists"));
    let _ = std::fs::remove_dir_all(warehouse);
}

fn batch_with_null_key() -> (Arc<Schema>, RecordBatch) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("col1", DataType::Int64, false),
        Field::new("key", DataType::Float64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
            Arc::new(Float64Array::from(vec![Some(17.0), Some(36.0), None, Some(45.0)])),
        ],
    )
    .expect("batch");
    (schema, batch)
}

#[tokio::test]
async fn invalid_key_fails_stage_and_leaves_catalog_untouched() {
    let warehouse = unique_path("ctas_fail_null_key");
    let catalog = Arc::new(MemoryCatalog::new());
    let exec = executor(
        test_config(&warehouse),
        catalog.clone(),
        Arc::new(LocalStorage::new()),
    );

    let (schema, batch) = batch_with_null_key();
    let plan = MemoryPlan::round_robin(schema, vec![batch], 2).expect("plan");
    let err = exec
        .execute(CtasStatement::new("null_key", Arc::new(plan), key_spec()))
        .await
        .expect_err("null key");
    assert!(matches!(err, CtasError::InvalidPartitionValue { ref column, .. } if column == "key"));
    assert!(!catalog.exists_table("null_key").expect("exists"));
    // Cleanup is off by default: the base location stays for inspection.
    assert!(warehouse.join("null_key").is_dir());
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn failed_stage_output_is_removed_when_cleanup_enabled() {
    let warehouse = unique_path("ctas_fail_cleanup");
    let catalog = Arc::new(MemoryCatalog::new());
    let config = EngineConfig {
        cleanup_failed_output: true,
        ..test_config(&warehouse)
    };
    let exec = executor(config, catalog.clone(), Arc::new(LocalStorage::new()));

    let (schema, batch) = batch_with_null_key();
    let plan = MemoryPlan::round_robin(schema, vec![batch], 2).expect("plan");
    exec.execute(CtasStatement::new("cleaned", Arc::new(plan), key_spec()))
        .await
        .expect_err("null key");
    assert!(!warehouse.join("cleaned").exists());
    assert!(!catalog.exists_table("cleaned").expect("exists"));
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn vanished_partition_directory_blocks_commit() {
    let warehouse = unique_path("ctas_fail_missing_dir");
    let catalog = Arc::new(MemoryCatalog::new());
    let storage: Arc<dyn Storage> = Arc::new(HidingStorage::new("key=49.0"));
    let exec = executor(test_config(&warehouse), catalog.clone(), storage);

    let err = exec
        .execute(CtasStatement::new("vanished", lineitem_plan(3), key_spec()))
        .await
        .expect_err("missing location");
    match err {
        CtasError::MissingPartitionLocation { table, location } => {
            assert_eq!(table, "vanished");
            assert!(location.ends_with("key=49.0"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!catalog.exists_table("vanished").expect("exists"));
    // The other partitions were written; only registration was refused.
    assert_eq!(subdirs(&warehouse.join("vanished")).len(), 5);
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn cancelled_statement_is_not_registered() {
    let warehouse = unique_path("ctas_fail_cancel");
    let catalog = Arc::new(MemoryCatalog::new());
    let exec = executor(
        test_config(&warehouse),
        catalog.clone(),
        Arc::new(LocalStorage::new()),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = exec
        .execute_with_cancel(
            CtasStatement::new("cancelled", lineitem_plan(3), key_spec()),
            cancel,
        )
        .await
        .expect_err("cancelled");
    assert!(matches!(err, CtasError::Cancelled(_)));
    assert!(!catalog.exists_table("cancelled").expect("exists"));
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn partition_column_cannot_be_the_only_column() {
    let warehouse = unique_path("ctas_fail_only_key");
    let catalog = Arc::new(MemoryCatalog::new());
    let exec = executor(
        test_config(&warehouse),
        catalog.clone(),
        Arc::new(LocalStorage::new()),
    );
    let schema = Arc::new(Schema::new(vec![Field::new("key", DataType::Float64, false)]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(Float64Array::from(vec![1.0, 2.0]))],
    )
    .expect("batch");
    let plan = MemoryPlan::try_new(schema, vec![vec![batch]]).expect("plan");

    let err = exec
        .execute(CtasStatement::new("only_key", Arc::new(plan), key_spec()))
        .await
        .expect_err("no data columns");
    assert!(matches!(err, CtasError::Planning(_)));
    assert!(!warehouse.join("only_key").exists());
}
