//! Data-file encoding. Everything parquet-specific stays in this module.

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use bytes::Bytes;
use ctas_common::{CtasError, Result};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::value::{Row, rows_to_batch};

/// Encode rows laid out in `schema` order as one parquet file image.
pub fn encode_rows(schema: &SchemaRef, rows: &[Row]) -> Result<Vec<u8>> {
    let batch = rows_to_batch(schema, rows)?;
    encode_batch(&batch)
}

pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))
        .map_err(|e| CtasError::Execution(format!("parquet writer init failed: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| CtasError::Execution(format!("parquet write failed: {e}")))?;
    writer
        .into_inner()
        .map_err(|e| CtasError::Execution(format!("parquet finish failed: {e}")))
}

pub fn decode_batches(data: Vec<u8>) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(data))
        .map_err(|e| CtasError::Execution(format!("parquet open failed: {e}")))?
        .build()
        .map_err(|e| CtasError::Execution(format!("parquet reader build failed: {e}")))?;
    reader
        .map(|b| b.map_err(|e| CtasError::Execution(format!("parquet decode failed: {e}"))))
        .collect()
}
