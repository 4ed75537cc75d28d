//! Partition-key specification and per-row evaluation.
//!
//! A [`PartitionKeySpec`] lists the key columns in directory nesting order. Each column is
//! either drawn straight from the output schema or computed from it (literal or cast).
//! [`PartitionKeyEvaluator`] compiles the key spec against a concrete schema once and then maps
//! every row to its canonical [`PartitionKeyValue`].

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use ctas_common::{CtasError, Result};
use ctas_storage::{PartitionColumn, PartitionDesc, PartitionMethod};
use serde::{Deserialize, Serialize};

use crate::layout::{
    format_partition_value, is_partitionable_type, parse_partition_segment, partition_location,
    partition_segment,
};
use crate::value::ScalarValue;

/// Expression producing one key column from an output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyExpr {
    Column(String),
    Literal(ScalarValue),
    Cast { expr: Box<KeyExpr>, to: DataType },
}

impl KeyExpr {
    pub fn column(name: impl Into<String>) -> Self {
        KeyExpr::Column(name.into())
    }

    pub fn cast(expr: KeyExpr, to: DataType) -> Self {
        KeyExpr::Cast {
            expr: Box::new(expr),
            to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionKeyColumn {
    pub name: String,
    pub expr: KeyExpr,
    pub data_type: DataType,
}

impl PartitionKeyColumn {
    /// Key column that reuses an output column of the same name.
    pub fn column(name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        Self {
            expr: KeyExpr::Column(name.clone()),
            name,
            data_type,
        }
    }

    pub fn computed(name: impl Into<String>, expr: KeyExpr, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            expr,
            data_type,
        }
    }
}

/// Ordered key columns. Empty means the table is not partitioned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionKeySpec {
    pub columns: Vec<PartitionKeyColumn>,
}

impl PartitionKeySpec {
    pub fn new(columns: Vec<PartitionKeyColumn>) -> Self {
        Self { columns }
    }

    pub fn unpartitioned() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn partition_method(&self) -> PartitionMethod {
        if self.columns.is_empty() {
            return PartitionMethod::None;
        }
        PartitionMethod::Column {
            columns: self
                .columns
                .iter()
                .map(|c| PartitionColumn::new(c.name.clone(), c.data_type.clone()))
                .collect(),
        }
    }
}

/// Canonical key tuple of one row. Equal tuples always name the same location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKeyValue {
    columns: Vec<String>,
    values: Vec<String>,
}

impl PartitionKeyValue {
    /// Key of an unpartitioned table; resolves to the base location itself.
    pub fn unpartitioned() -> Self {
        Self {
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build from already-canonical values. Both slices must have equal length.
    pub fn from_parts(columns: Vec<String>, values: Vec<String>) -> Result<Self> {
        if columns.len() != values.len() {
            return Err(CtasError::Execution(format!(
                "partition key has {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self { columns, values })
    }

    /// Parse a relative directory name such as `key=17.0/flag=true`.
    pub fn parse_relative(name: &str) -> Result<Self> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for segment in name.split('/').filter(|s| !s.is_empty()) {
            let (col, value) = parse_partition_segment(segment)?;
            columns.push(col);
            values.push(value);
        }
        Ok(Self { columns, values })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn segments(&self) -> Vec<String> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| partition_segment(c, v))
            .collect()
    }

    /// Relative directory name, segments joined with `/`.
    pub fn relative_name(&self) -> String {
        self.segments().join("/")
    }

    pub fn location(&self, base: &Path) -> PathBuf {
        partition_location(base, &self.segments())
    }

    /// Catalog form of this key at `location`.
    pub fn to_desc(&self, location: &Path) -> PartitionDesc {
        PartitionDesc {
            name: self.relative_name(),
            values: self.values.clone(),
            path: location.to_string_lossy().to_string(),
        }
    }
}

impl fmt::Display for PartitionKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unpartitioned() {
            write!(f, "<unpartitioned>")
        } else {
            write!(f, "{}", self.relative_name())
        }
    }
}

#[derive(Debug, Clone)]
enum CompiledExpr {
    Column(usize),
    Literal(ScalarValue),
    Cast(Box<CompiledExpr>, DataType),
}

#[derive(Debug, Clone)]
struct CompiledKeyColumn {
    name: String,
    expr: CompiledExpr,
    data_type: DataType,
}

/// Stateless row-to-key mapper; shareable across tasks.
#[derive(Debug, Clone)]
pub struct PartitionKeyEvaluator {
    columns: Vec<CompiledKeyColumn>,
}

impl PartitionKeyEvaluator {
    pub fn try_new(input_schema: &Schema, spec: &PartitionKeySpec) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(spec.columns.len());
        for col in &spec.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(CtasError::Planning(format!(
                    "partition column '{}' listed twice",
                    col.name
                )));
            }
            if !is_partitionable_type(&col.data_type) {
                return Err(CtasError::InvalidPartitionValue {
                    column: col.name.clone(),
                    reason: format!("type {:?} cannot name a partition", col.data_type),
                });
            }
            columns.push(CompiledKeyColumn {
                name: col.name.clone(),
                expr: compile(input_schema, &col.expr)?,
                data_type: col.data_type.clone(),
            });
        }
        Ok(Self { columns })
    }

    pub fn is_partitioned(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn evaluate(&self, row: &[ScalarValue]) -> Result<PartitionKeyValue> {
        let mut names = Vec::with_capacity(self.columns.len());
        let mut values = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let raw = eval(&col.expr, row, &col.name)?;
            let typed = cast_scalar(raw, &col.data_type, &col.name)?;
            values.push(format_partition_value(&col.name, &typed)?);
            names.push(col.name.clone());
        }
        Ok(PartitionKeyValue {
            columns: names,
            values,
        })
    }
}

fn compile(schema: &Schema, expr: &KeyExpr) -> Result<CompiledExpr> {
    match expr {
        KeyExpr::Column(name) => schema
            .index_of(name)
            .map(CompiledExpr::Column)
            .map_err(|_| {
                CtasError::Planning(format!(
                    "partition key references unknown column '{name}'"
                ))
            }),
        KeyExpr::Literal(v) => Ok(CompiledExpr::Literal(v.clone())),
        KeyExpr::Cast { expr, to } => Ok(CompiledExpr::Cast(
            Box::new(compile(schema, expr)?),
            to.clone(),
        )),
    }
}

fn eval(expr: &CompiledExpr, row: &[ScalarValue], column: &str) -> Result<ScalarValue> {
    match expr {
        CompiledExpr::Column(idx) => row.get(*idx).cloned().ok_or_else(|| {
            CtasError::Execution(format!(
                "row has {} values, key column '{column}' reads index {idx}",
                row.len()
            ))
        }),
        CompiledExpr::Literal(v) => Ok(v.clone()),
        CompiledExpr::Cast(inner, to) => cast_scalar(eval(inner, row, column)?, to, column),
    }
}

// 2^63; every f64 in `[-2^63, 2^63)` truncates to a representable i64.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Convert a scalar to `to`. NULL passes through; the formatter rejects it.
/// Values that do not fit the target type are rejected rather than clamped.
pub fn cast_scalar(value: ScalarValue, to: &DataType, column: &str) -> Result<ScalarValue> {
    if value.is_null() || value.data_type().as_ref() == Some(to) {
        return Ok(value);
    }
    let fail = |v: &ScalarValue| CtasError::InvalidPartitionValue {
        column: column.to_string(),
        reason: format!("cannot cast {v:?} to {to:?}"),
    };
    let out = match (&value, to) {
        (ScalarValue::Int32(v), DataType::Int64) => ScalarValue::Int64(i64::from(*v)),
        (ScalarValue::Int64(v), DataType::Int32) => {
            ScalarValue::Int32(i32::try_from(*v).map_err(|_| fail(&value))?)
        }
        (ScalarValue::Int32(v), DataType::Float64) => ScalarValue::Float64(f64::from(*v)),
        (ScalarValue::Int64(v), DataType::Float64) => {
            let f = *v as f64;
            if f as i128 != i128::from(*v) {
                return Err(fail(&value));
            }
            ScalarValue::Float64(f)
        }
        (ScalarValue::Float32(v), DataType::Float64) => ScalarValue::Float64(f64::from(*v)),
        (ScalarValue::Int32(v), DataType::Float32) => {
            let f = *v as f32;
            if f as i128 != i128::from(*v) {
                return Err(fail(&value));
            }
            ScalarValue::Float32(f)
        }
        (ScalarValue::Int64(v), DataType::Float32) => {
            let f = *v as f32;
            if f as i128 != i128::from(*v) {
                return Err(fail(&value));
            }
            ScalarValue::Float32(f)
        }
        (ScalarValue::Float64(v), DataType::Float32) => {
            let f = *v as f32;
            if f.is_infinite() && v.is_finite() {
                return Err(fail(&value));
            }
            ScalarValue::Float32(f)
        }
        (ScalarValue::Float64(v), DataType::Int64) => {
            let t = v.trunc();
            // NaN fails both comparisons.
            if !(t >= -I64_BOUND && t < I64_BOUND) {
                return Err(fail(&value));
            }
            ScalarValue::Int64(t as i64)
        }
        (ScalarValue::Float64(v), DataType::Int32) => {
            let t = v.trunc();
            if !(t >= f64::from(i32::MIN) && t <= f64::from(i32::MAX)) {
                return Err(fail(&value));
            }
            ScalarValue::Int32(t as i32)
        }
        (ScalarValue::Boolean(v), DataType::Int32) => ScalarValue::Int32(i32::from(*v)),
        (ScalarValue::Boolean(v), DataType::Int64) => ScalarValue::Int64(i64::from(*v)),
        (ScalarValue::Utf8(s), DataType::Int32) => {
            ScalarValue::Int32(s.trim().parse().map_err(|_| fail(&value))?)
        }
        (ScalarValue::Utf8(s), DataType::Int64) => {
            ScalarValue::Int64(s.trim().parse().map_err(|_| fail(&value))?)
        }
        (ScalarValue::Utf8(s), DataType::Float64) => {
            ScalarValue::Float64(s.trim().parse().map_err(|_| fail(&value))?)
        }
        (ScalarValue::Utf8(s), DataType::Boolean) => {
            ScalarValue::Boolean(s.trim().parse().map_err(|_| fail(&value))?)
        }
        (ScalarValue::Int32(v), DataType::Utf8) => ScalarValue::Utf8(v.to_string()),
        (ScalarValue::Int64(v), DataType::Utf8) => ScalarValue::Utf8(v.to_string()),
        (ScalarValue::Boolean(v), DataType::Utf8) => ScalarValue::Utf8(v.to_string()),
        (ScalarValue::Float64(v), DataType::Utf8) => ScalarValue::Utf8(format!("{v:?}")),
        (ScalarValue::Date32(v), DataType::Int32) => ScalarValue::Int32(*v),
        (ScalarValue::Int32(v), DataType::Date32) => ScalarValue::Date32(*v),
        _ => return Err(fail(&value)),
    };
    Ok(out)
}

/// Output schema split into physical data columns and path-encoded key columns.
#[derive(Debug, Clone)]
pub struct PartitionedSchema {
    /// Columns stored inside data files.
    pub data_schema: SchemaRef,
    /// Positions of the data columns in the input row.
    pub data_indices: Vec<usize>,
    /// Data columns followed by key columns; registered in the catalog.
    pub table_schema: Schema,
}

impl PartitionedSchema {
    /// Key columns named like an output column are dropped from the data files.
    pub fn try_new(input_schema: &Schema, spec: &PartitionKeySpec) -> Result<Self> {
        let key_names: HashSet<&str> = spec.columns.iter().map(|c| c.name.as_str()).collect();
        let mut data_fields = Vec::new();
        let mut data_indices = Vec::new();
        for (idx, field) in input_schema.fields().iter().enumerate() {
            if !key_names.contains(field.name().as_str()) {
                data_fields.push(field.as_ref().clone());
                data_indices.push(idx);
            }
        }
        if data_fields.is_empty() {
            return Err(CtasError::Planning(
                "CTAS output needs at least one non-partition column".to_string(),
            ));
        }
        let mut table_fields = data_fields.clone();
        for col in &spec.columns {
            table_fields.push(Field::new(&col.name, col.data_type.clone(), false));
        }
        Ok(Self {
            data_schema: Arc::new(Schema::new(data_fields)),
            data_indices,
            table_schema: Schema::new(table_fields),
        })
    }

    pub fn project(&self, row: &[ScalarValue]) -> Vec<ScalarValue> {
        self.data_indices
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(ScalarValue::Null))
            .collect()
    }
}
