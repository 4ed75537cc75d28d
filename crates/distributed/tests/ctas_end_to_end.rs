mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Float64Array, Int64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use common::{KEYS, executor, lineitem_batch, subdirs, test_config, unique_path};
use ctas_distributed::{CtasStatement, MemoryPlan, UnionPlan, UpstreamPlan};
use ctas_partition::{
    KeyExpr, PartitionKeyColumn, PartitionKeySpec, PartitionedTableReader, ScalarValue,
};
use ctas_storage::{Catalog, FileCatalog, LocalStorage, MemoryCatalog, Storage};

fn key_spec() -> PartitionKeySpec {
    PartitionKeySpec::new(vec![PartitionKeyColumn::column("key", DataType::Float64)])
}

#[tokio::test]
async fn partitioned_ctas_writes_one_directory_per_key() {
    let warehouse = unique_path("ctas_e2e_basic");
    let catalog = Arc::new(MemoryCatalog::new());
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new());
    let exec = executor(test_config(&warehouse), catalog.clone(), Arc::clone(&storage));

    let (schema, batch) = lineitem_batch();
    let plan = MemoryPlan::round_robin(schema, vec![batch], 3).expect("plan");
    let outcome = exec
        .execute(CtasStatement::new("testCtasWithColumnedPartition", Arc::new(plan), key_spec()))
        .await
        .expect("ctas");

    let desc = outcome.descriptor;
    assert_eq!(desc.name, "testctaswithcolumnedpartition");
    assert_eq!(desc.stats.num_rows, 8);
    assert_eq!(desc.stats.num_partitions, 5);
    assert_eq!(desc.partitions.len(), 5);
    let field_names: Vec<_> = desc.schema.fields().iter().map(|f| f.name().clone()).collect();
    assert_eq!(field_names, vec!["col1", "col2", "key"]);

    let base = warehouse.join("testctaswithcolumnedpartition");
    assert_eq!(
        subdirs(&base),
        vec!["key=17.0", "key=36.0", "key=38.0", "key=45.0", "key=49.0"]
    );
    assert!(catalog.exists_table("testCtasWithColumnedPartition").expect("exists"));

    let rows = PartitionedTableReader::new(storage)
        .read_table(&desc)
        .expect("read back");
    assert_eq!(rows.len(), 8);
    let mut keys: Vec<f64> = rows
        .iter()
        .map(|r| match r[2] {
            ScalarValue::Float64(v) => v,
            ref other => panic!("unexpected key value {other:?}"),
        })
        .collect();
    keys.sort_by(|a, b| a.partial_cmp(b).expect("finite"));
    assert_eq!(keys, KEYS.to_vec());
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn group_by_output_keeps_one_row_per_group() {
    let warehouse = unique_path("ctas_e2e_group_by");
    let catalog = Arc::new(MemoryCatalog::new());
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new());
    let exec = executor(test_config(&warehouse), catalog, Arc::clone(&storage));

    let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
    for k in KEYS {
        *counts.entry(k as i64).or_default() += 1;
    }
    let schema = Arc::new(Schema::new(vec![
        Field::new("cnt", DataType::Int64, false),
        Field::new("key", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(counts.values().copied().collect::<Vec<_>>())),
            Arc::new(Float64Array::from(
                counts.keys().map(|k| *k as f64).collect::<Vec<_>>(),
            )),
        ],
    )
    .expect("batch");
    let plan = MemoryPlan::round_robin(schema, vec![batch], 2).expect("plan");

    let desc = exec
        .execute(CtasStatement::new("grouped", Arc::new(plan), key_spec()))
        .await
        .expect("ctas")
        .descriptor;
    assert_eq!(desc.stats.num_rows, 5);

    let rows = PartitionedTableReader::new(storage)
        .read_table(&desc)
        .expect("read back");
    let by_key: BTreeMap<String, i64> = rows
        .iter()
        .map(|r| match (&r[0], &r[1]) {
            (ScalarValue::Int64(c), ScalarValue::Float64(k)) => (format!("{k:?}"), *c),
            other => panic!("unexpected row {other:?}"),
        })
        .collect();
    assert_eq!(by_key.len(), 5);
    assert_eq!(by_key["38.0"], 2);
    assert_eq!(by_key["45.0"], 3);
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn union_order_by_and_limit_inputs_are_plain_row_streams() {
    let warehouse = unique_path("ctas_e2e_shapes");
    let catalog = Arc::new(MemoryCatalog::new());
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new());
    let exec = executor(test_config(&warehouse), catalog, Arc::clone(&storage));
    let (schema, batch) = lineitem_batch();

    // ORDER BY: one sorted partition.
    let ordered = MemoryPlan::try_new(schema.clone(), vec![vec![batch.clone()]]).expect("plan");
    let desc = exec
        .execute(CtasStatement::new("ordered", Arc::new(ordered), key_spec()))
        .await
        .expect("ordered ctas")
        .descriptor;
    assert_eq!(desc.stats.num_rows, 8);
    assert_eq!(desc.partitions.len(), 5);

    // LIMIT 3 over the sorted input.
    let limited =
        MemoryPlan::try_new(schema.clone(), vec![vec![batch.slice(0, 3)]]).expect("plan");
    let desc = exec
        .execute(CtasStatement::new("limited", Arc::new(limited), key_spec()))
        .await
        .expect("limited ctas")
        .descriptor;
    assert_eq!(desc.stats.num_rows, 3);
    assert_eq!(
        subdirs(&warehouse.join("limited")),
        vec!["key=17.0", "key=36.0", "key=38.0"]
    );

    // UNION ALL of the table with itself.
    let left: Arc<dyn UpstreamPlan> =
        Arc::new(MemoryPlan::round_robin(schema.clone(), vec![batch.clone()], 2).expect("plan"));
    let right: Arc<dyn UpstreamPlan> =
        Arc::new(MemoryPlan::try_new(schema, vec![vec![batch]]).expect("plan"));
    let union = UnionPlan::try_new(vec![left, right]).expect("union");
    assert_eq!(union.partition_count(), 3);
    let desc = exec
        .execute(CtasStatement::new("unioned", Arc::new(union), key_spec()))
        .await
        .expect("union ctas")
        .descriptor;
    assert_eq!(desc.stats.num_rows, 16);
    assert_eq!(desc.partitions.len(), 5);
    let rows = PartitionedTableReader::new(storage)
        .read_table(&desc)
        .expect("read back");
    assert_eq!(rows.len(), 16);
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn unpartitioned_ctas_writes_into_base_directory() {
    let warehouse = unique_path("ctas_e2e_flat");
    let catalog = Arc::new(MemoryCatalog::new());
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new());
    let exec = executor(test_config(&warehouse), catalog, Arc::clone(&storage));

    let (schema, batch) = lineitem_batch();
    let plan = MemoryPlan::round_robin(schema, vec![batch], 3).expect("plan");
    let desc = exec
        .execute(CtasStatement::new("flat", Arc::new(plan), PartitionKeySpec::unpartitioned()))
        .await
        .expect("ctas")
        .descriptor;
    assert!(desc.partitions.is_empty());
    assert_eq!(desc.stats.num_partitions, 0);
    assert_eq!(desc.stats.num_rows, 8);
    assert_eq!(desc.stats.num_files, 3);
    assert!(subdirs(&warehouse.join("flat")).is_empty());

    let rows = PartitionedTableReader::new(storage)
        .read_table(&desc)
        .expect("read back");
    assert_eq!(rows.len(), 8);
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn multi_column_keys_nest_in_declaration_order() {
    let warehouse = unique_path("ctas_e2e_nested");
    let catalog = Arc::new(MemoryCatalog::new());
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new());
    let exec = executor(test_config(&warehouse), catalog, Arc::clone(&storage));

    let (schema, batch) = lineitem_batch();
    let plan = MemoryPlan::round_robin(schema, vec![batch], 2).expect("plan");
    let spec = PartitionKeySpec::new(vec![
        PartitionKeyColumn::column("key", DataType::Float64),
        PartitionKeyColumn::computed(
            "bucket",
            KeyExpr::cast(KeyExpr::column("col1"), DataType::Utf8),
            DataType::Utf8,
        ),
    ]);
    let desc = exec
        .execute(CtasStatement::new("nested", Arc::new(plan), spec))
        .await
        .expect("ctas")
        .descriptor;
    assert_eq!(desc.partitions.len(), 8);
    let base = warehouse.join("nested");
    assert_eq!(subdirs(&base.join("key=45.0")), vec!["bucket=5", "bucket=6", "bucket=7"]);

    let field_names: Vec<_> = desc.schema.fields().iter().map(|f| f.name().clone()).collect();
    assert_eq!(field_names, vec!["col1", "col2", "key", "bucket"]);
    let rows = PartitionedTableReader::new(storage)
        .read_table(&desc)
        .expect("read back");
    assert_eq!(rows.len(), 8);
    let _ = std::fs::remove_dir_all(warehouse);
}

#[tokio::test]
async fn explicit_location_and_file_catalog_survive_reopen() {
    let root = unique_path("ctas_e2e_file_catalog");
    let catalog_path = root.join("catalog.json");
    let location = root.join("custom").join("t_loc");
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new());
    {
        let catalog = Arc::new(FileCatalog::open(&catalog_path).expect("open catalog"));
        let exec = executor(test_config(&root.join("warehouse")), catalog, Arc::clone(&storage));
        let (schema, batch) = lineitem_batch();
        let plan = MemoryPlan::round_robin(schema, vec![batch], 3).expect("plan");
        exec.execute(
            CtasStatement::new("t_loc", Arc::new(plan), key_spec()).with_location(&location),
        )
        .await
        .expect("ctas");
    }
    assert!(!root.join("warehouse").join("t_loc").exists());
    assert_eq!(subdirs(&location).len(), 5);

    let reopened = FileCatalog::open(&catalog_path).expect("reopen catalog");
    assert_eq!(reopened.list_tables().expect("list"), vec!["t_loc".to_string()]);
    let desc = reopened.get_table_desc("t_loc").expect("desc");
    assert_eq!(desc.path, location.to_string_lossy());
    assert_eq!(desc.stats.num_rows, 8);
    let rows = PartitionedTableReader::new(storage)
        .read_table(&desc)
        .expect("read back");
    assert_eq!(rows.len(), 8);
    let _ = std::fs::remove_dir_all(root);
}
