//! Row-level scalar values and conversion to and from Arrow batches.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Date32Array, Date32Builder, Float32Array,
    Float32Builder, Float64Array, Float64Builder, Int32Array, Int32Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, SchemaRef};
use ctas_common::{CtasError, Result};
use serde::{Deserialize, Serialize};

/// One typed cell of an output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    /// Days since the unix epoch.
    Date32(i32),
    Null,
}

/// An ordered sequence of typed column values.
pub type Row = Vec<ScalarValue>;

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// Arrow type of this value; `None` for untyped null.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            ScalarValue::Int32(_) => Some(DataType::Int32),
            ScalarValue::Int64(_) => Some(DataType::Int64),
            ScalarValue::Float32(_) => Some(DataType::Float32),
            ScalarValue::Float64(_) => Some(DataType::Float64),
            ScalarValue::Utf8(_) => Some(DataType::Utf8),
            ScalarValue::Boolean(_) => Some(DataType::Boolean),
            ScalarValue::Date32(_) => Some(DataType::Date32),
            ScalarValue::Null => None,
        }
    }

    /// Rough in-memory footprint used for buffer accounting.
    pub fn estimated_bytes(&self) -> usize {
        match self {
            ScalarValue::Int32(_) | ScalarValue::Float32(_) | ScalarValue::Date32(_) => 4,
            ScalarValue::Int64(_) | ScalarValue::Float64(_) => 8,
            ScalarValue::Utf8(s) => s.len() + 8,
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Null => 1,
        }
    }
}

pub fn estimate_row_bytes(row: &[ScalarValue]) -> usize {
    row.iter().map(ScalarValue::estimated_bytes).sum()
}

pub fn scalar_from_array(array: &ArrayRef, row: usize) -> Result<ScalarValue> {
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    match array.data_type() {
        DataType::Int32 => Ok(ScalarValue::Int32(downcast::<Int32Array>(array)?.value(row))),
        DataType::Int64 => Ok(ScalarValue::Int64(downcast::<Int64Array>(array)?.value(row))),
        DataType::Float32 => Ok(ScalarValue::Float32(
            downcast::<Float32Array>(array)?.value(row),
        )),
        DataType::Float64 => Ok(ScalarValue::Float64(
            downcast::<Float64Array>(array)?.value(row),
        )),
        DataType::Utf8 => Ok(ScalarValue::Utf8(
            downcast::<StringArray>(array)?.value(row).to_string(),
        )),
        DataType::Boolean => Ok(ScalarValue::Boolean(
            downcast::<BooleanArray>(array)?.value(row),
        )),
        DataType::Date32 => Ok(ScalarValue::Date32(
            downcast::<Date32Array>(array)?.value(row),
        )),
        other => Err(CtasError::Execution(format!(
            "scalar type not supported for CTAS output: {other:?}"
        ))),
    }
}

fn downcast<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        CtasError::Execution(format!(
            "array downcast failed for {:?}",
            array.data_type()
        ))
    })
}

/// Explode a batch into owned rows.
pub fn rows_from_batch(batch: &RecordBatch) -> Result<Vec<Row>> {
    let mut rows = Vec::with_capacity(batch.num_rows());
    for r in 0..batch.num_rows() {
        let mut row = Vec::with_capacity(batch.num_columns());
        for col in batch.columns() {
            row.push(scalar_from_array(col, r)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Build a batch from rows laid out in `schema` order.
pub fn rows_to_batch(schema: &SchemaRef, rows: &[Row]) -> Result<RecordBatch> {
    let width = schema.fields().len();
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(CtasError::Execution(format!(
            "row has {} values but schema has {width} columns",
            bad.len()
        )));
    }
    let mut columns = Vec::with_capacity(width);
    for (idx, field) in schema.fields().iter().enumerate() {
        columns.push(scalars_to_array(
            rows.iter().map(|r| &r[idx]),
            rows.len(),
            field.data_type(),
        )?);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    RecordBatch::try_new_with_options(Arc::clone(schema), columns, &options)
        .map_err(|e| CtasError::Execution(format!("batch build failed: {e}")))
}

fn scalars_to_array<'a>(
    values: impl Iterator<Item = &'a ScalarValue>,
    len: usize,
    dt: &DataType,
) -> Result<ArrayRef> {
    match dt {
        DataType::Int32 => {
            let mut b = Int32Builder::with_capacity(len);
            for v in values {
                match v {
                    ScalarValue::Int32(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch("Int32", other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(len);
            for v in values {
                match v {
                    ScalarValue::Int64(x) => b.append_value(*x),
                    ScalarValue::Int32(x) => b.append_value(i64::from(*x)),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch("Int64", other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float32 => {
            let mut b = Float32Builder::with_capacity(len);
            for v in values {
                match v {
                    ScalarValue::Float32(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch("Float32", other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(len);
            for v in values {
                match v {
                    ScalarValue::Float64(x) => b.append_value(*x),
                    ScalarValue::Float32(x) => b.append_value(f64::from(*x)),
                    ScalarValue::Int64(x) => b.append_value(*x as f64),
                    ScalarValue::Int32(x) => b.append_value(f64::from(*x)),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch("Float64", other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(len, len * 8);
            for v in values {
                match v {
                    ScalarValue::Utf8(x) => b.append_value(x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch("Utf8", other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(len);
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch("Boolean", other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Date32 => {
            let mut b = Date32Builder::with_capacity(len);
            for v in values {
                match v {
                    ScalarValue::Date32(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(type_mismatch("Date32", other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(CtasError::Execution(format!(
            "output type not supported for CTAS: {other:?}"
        ))),
    }
}

fn type_mismatch(expected: &str, got: &ScalarValue) -> CtasError {
    CtasError::Execution(format!(
        "type mismatch while building {expected} array: got {got:?}"
    ))
}
