use std::env;
use std::path::Path;
use std::sync::Arc;

use ctas_common::EngineConfig;
use ctas_partition::PartitionedTableReader;
use ctas_storage::{Catalog, FileCatalog, LocalStorage};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "usage: ctas-catalog <list | describe <table> | verify <table>>"
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = EngineConfig::from_env()?;
    let catalog_path = config
        .catalog_path
        .clone()
        .ok_or("CTAS_CATALOG_PATH must point at a catalog file")?;
    let catalog = FileCatalog::open(&catalog_path)?;

    let args: Vec<String> = env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["list"] => {
            for name in catalog.list_tables()? {
                println!("{name}");
            }
        }
        ["describe", table] => {
            let desc = catalog.get_table_desc(table)?;
            println!("{}", serde_json::to_string_pretty(&desc)?);
        }
        ["verify", table] => {
            // Compare catalog partitions against what is on disk and re-count rows.
            let desc = catalog.get_table_desc(table)?;
            let reader = PartitionedTableReader::new(Arc::new(LocalStorage::new()));
            let on_disk = reader.discover_partitions(Path::new(&desc.path), &desc.partition_method)?;
            let rows = reader.read_table(&desc)?.len() as u64;
            let report = serde_json::json!({
                "table": desc.name,
                "catalog_partitions": desc.partitions.len(),
                "disk_partitions": on_disk.len(),
                "catalog_rows": desc.stats.num_rows,
                "disk_rows": rows,
                "consistent": on_disk.len() == desc.partitions.len() && rows == desc.stats.num_rows,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            eprintln!("{}", usage());
            std::process::exit(2);
        }
    }
    Ok(())
}
