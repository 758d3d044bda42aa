//! Query result sets
//!
//! Executors hand back a [`QueryDataSet`]: a lazy cursor over rows that is
//! consumed once. Remote reads happen as the caller pulls rows.

use super::expression::Value;
use super::plan::DataType;
use crate::{Error, Result};

use arrow_array::builder::{
    BooleanBuilder, Float32Builder, Float64Builder, Int32Builder, Int64Builder, StringBuilder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType as ArrowType, Field, Schema};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;

pub const TIME_COLUMN: &str = "Time";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnHeader {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnHeader {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// One output row; `timestamp` is absent for non-aligned results
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub timestamp: Option<i64>,
    pub fields: Vec<Option<Value>>,
}

impl RowRecord {
    pub fn new(timestamp: i64, fields: Vec<Option<Value>>) -> Self {
        Self {
            timestamp: Some(timestamp),
            fields,
        }
    }

    pub fn is_all_null(&self) -> bool {
        self.fields.iter().all(Option::is_none)
    }
}

#[async_trait]
pub trait QueryDataSet: Send {
    fn columns(&self) -> &[ColumnHeader];

    /// Next row, or `None` once the result is exhausted
    async fn next_row(&mut self) -> Result<Option<RowRecord>>;
}

/// Result set over rows already in memory
#[derive(Debug, Default)]
pub struct MemoryDataSet {
    columns: Vec<ColumnHeader>,
    rows: VecDeque<RowRecord>,
}

impl MemoryDataSet {
    pub fn new(columns: Vec<ColumnHeader>, rows: Vec<RowRecord>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }
}

#[async_trait]
impl QueryDataSet for MemoryDataSet {
    fn columns(&self) -> &[ColumnHeader] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<RowRecord>> {
        Ok(self.rows.pop_front())
    }
}

/// Drain a result set; any failure discards the rows read so far
pub async fn collect_rows(dataset: &mut dyn QueryDataSet) -> Result<Vec<RowRecord>> {
    let mut rows = Vec::new();
    while let Some(row) = dataset.next_row().await? {
        rows.push(row);
    }
    Ok(rows)
}

/// Convert rows into an Arrow batch with a leading nullable `Time` column
pub fn to_record_batch(columns: &[ColumnHeader], rows: &[RowRecord]) -> Result<RecordBatch> {
    let mut fields = vec![Field::new(TIME_COLUMN, ArrowType::Int64, true)];
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len() + 1);

    let mut times = Int64Builder::with_capacity(rows.len());
    for row in rows {
        times.append_option(row.timestamp);
    }
    arrays.push(Arc::new(times.finish()));

    for (i, column) in columns.iter().enumerate() {
        fields.push(Field::new(&column.name, arrow_type(column.data_type), true));
        arrays.push(build_column(column, i, rows)?);
    }

    let schema = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays)?)
}

fn arrow_type(data_type: DataType) -> ArrowType {
    match data_type {
        DataType::Boolean => ArrowType::Boolean,
        DataType::Int32 => ArrowType::Int32,
        DataType::Int64 => ArrowType::Int64,
        DataType::Float => ArrowType::Float32,
        DataType::Double => ArrowType::Float64,
        DataType::Text => ArrowType::Utf8,
    }
}

fn build_column(column: &ColumnHeader, index: usize, rows: &[RowRecord]) -> Result<ArrayRef> {
    let cells = rows.iter().map(|row| row.fields.get(index).cloned().flatten());
    let mismatch = |value: &Value| {
        Error::Query(format!(
            "column {} is {} but holds {}",
            column.name,
            column.data_type,
            value.data_type()
        ))
    };

    let array: ArrayRef = match column.data_type {
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(Value::Boolean(v)) => builder.append_value(v),
                    Some(other) => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Int32 => {
            let mut builder = Int32Builder::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(Value::Int32(v)) => builder.append_value(v),
                    Some(other) => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(Value::Int64(v)) => builder.append_value(v),
                    Some(other) => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Float => {
            let mut builder = Float32Builder::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(Value::Float(v)) => builder.append_value(v),
                    Some(other) => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Double => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(Value::Double(v)) => builder.append_value(v),
                    Some(other) => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Text => {
            let mut builder = StringBuilder::new();
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(Value::Text(v)) => builder.append_value(v),
                    Some(other) => return Err(mismatch(&other)),
                }
            }
            Arc::new(builder.finish())
        }
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Array, Float64Array, Int64Array};

    fn columns() -> Vec<ColumnHeader> {
        vec![
            ColumnHeader::new("root.sg.d1.s1", DataType::Int64),
            ColumnHeader::new("root.sg.d1.s2", DataType::Double),
        ]
    }

    #[tokio::test]
    async fn test_collect_memory_rows() {
        let rows = vec![
            RowRecord::new(1, vec![Some(Value::Int64(1)), None]),
            RowRecord::new(2, vec![None, Some(Value::Double(2.5))]),
        ];
        let mut dataset = MemoryDataSet::new(columns(), rows.clone());
        assert_eq!(dataset.columns().len(), 2);
        assert_eq!(collect_rows(&mut dataset).await.unwrap(), rows);
        assert!(dataset.next_row().await.unwrap().is_none());
    }

    #[test]
    fn test_record_batch_conversion() {
        let rows = vec![
            RowRecord::new(1, vec![Some(Value::Int64(10)), None]),
            RowRecord::new(2, vec![None, Some(Value::Double(2.5))]),
        ];
        let batch = to_record_batch(&columns(), &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);
        assert_eq!(batch.schema().field(0).name(), TIME_COLUMN);

        let s1 = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(s1.value(0), 10);
        assert!(s1.is_null(1));

        let s2 = batch
            .column(2)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(s2.value(1), 2.5);
    }

    #[test]
    fn test_record_batch_type_mismatch() {
        let rows = vec![RowRecord::new(1, vec![Some(Value::Text("x".into())), None])];
        assert!(matches!(
            to_record_batch(&columns(), &rows),
            Err(Error::Query(_))
        ));
    }
}
