//! Raw data result sets

use super::reader::{ReaderByTimestamp, SeriesFetcher, SeriesReader, TimeGenerator};
use crate::query::dataset::{ColumnHeader, QueryDataSet, RowRecord};
use crate::query::expression::{Expression, Filter, Value};
use crate::query::plan::{DataType, SeriesSelection};
use crate::query::QueryContext;
use crate::{Error, Result};

use async_trait::async_trait;
use std::sync::Arc;

pub(crate) fn series_columns(series: &SeriesSelection) -> Vec<ColumnHeader> {
    series
        .iter()
        .map(|(path, data_type)| ColumnHeader::new(path.as_str(), data_type))
        .collect()
}

/// Time filter of an optimized expression that is absent or GLOBAL_TIME
pub(crate) fn global_time_filter(expression: Option<&Expression>) -> Result<Option<Filter>> {
    match expression {
        None => Ok(None),
        Some(Expression::GlobalTime(filter)) => Ok(Some(filter.clone())),
        Some(other) => Err(Error::Query(format!(
            "expected a global time filter, got {:?}",
            other.expression_type()
        ))),
    }
}

/// Rows aligned by timestamp across series, each series read under the
/// same time filter
pub struct AlignedDataSet {
    columns: Vec<ColumnHeader>,
    readers: Vec<SeriesReader>,
}

impl AlignedDataSet {
    pub fn new(
        fetcher: &Arc<SeriesFetcher>,
        series: &SeriesSelection,
        filter: Option<Filter>,
        context: &QueryContext,
    ) -> Self {
        let readers = series
            .paths()
            .iter()
            .map(|path| SeriesReader::spawn(fetcher.clone(), path.clone(), filter.clone(), context))
            .collect();
        Self {
            columns: series_columns(series),
            readers,
        }
    }
}

#[async_trait]
impl QueryDataSet for AlignedDataSet {
    fn columns(&self) -> &[ColumnHeader] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<RowRecord>> {
        let mut min_time: Option<i64> = None;
        for reader in &mut self.readers {
            if let Some(point) = reader.peek().await? {
                min_time = Some(min_time.map_or(point.timestamp, |t| t.min(point.timestamp)));
            }
        }
        let Some(timestamp) = min_time else {
            return Ok(None);
        };

        let mut fields = Vec::with_capacity(self.readers.len());
        for reader in &mut self.readers {
            let at_row = matches!(reader.peek().await?, Some(p) if p.timestamp == timestamp);
            fields.push(if at_row {
                reader.next_point().await?.map(|p| p.value)
            } else {
                None
            });
        }
        Ok(Some(RowRecord::new(timestamp, fields)))
    }
}

/// Rows at the timestamps a value-dependent expression selects
pub struct FilteredDataSet {
    columns: Vec<ColumnHeader>,
    generator: TimeGenerator,
    readers: Vec<ReaderByTimestamp>,
}

impl FilteredDataSet {
    pub fn new(
        fetcher: &Arc<SeriesFetcher>,
        series: &SeriesSelection,
        expression: &Expression,
        context: &QueryContext,
    ) -> Result<Self> {
        let generator = TimeGenerator::build(expression, fetcher, context)?;
        let readers = series
            .paths()
            .iter()
            .map(|path| {
                ReaderByTimestamp::new(SeriesReader::spawn(
                    fetcher.clone(),
                    path.clone(),
                    None,
                    context,
                ))
            })
            .collect();
        Ok(Self {
            columns: series_columns(series),
            generator,
            readers,
        })
    }
}

#[async_trait]
impl QueryDataSet for FilteredDataSet {
    fn columns(&self) -> &[ColumnHeader] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<RowRecord>> {
        while let Some(timestamp) = self.generator.next_time().await? {
            let mut fields = Vec::with_capacity(self.readers.len());
            for reader in &mut self.readers {
                fields.push(reader.value_at(timestamp).await?);
            }
            let row = RowRecord::new(timestamp, fields);
            if !row.is_all_null() {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Each series paired with its own time column; rows have no shared time
pub struct NonAlignedDataSet {
    columns: Vec<ColumnHeader>,
    readers: Vec<SeriesReader>,
}

impl NonAlignedDataSet {
    pub fn new(
        fetcher: &Arc<SeriesFetcher>,
        series: &SeriesSelection,
        expression: Option<&Expression>,
        context: &QueryContext,
    ) -> Result<Self> {
        let filter = global_time_filter(expression).map_err(|_| {
            Error::Query("non-aligned queries support time filters only".to_string())
        })?;
        let mut columns = Vec::with_capacity(series.len() * 2);
        let mut readers = Vec::with_capacity(series.len());
        for (path, data_type) in series.iter() {
            columns.push(ColumnHeader::new(format!("Time({})", path), DataType::Int64));
            columns.push(ColumnHeader::new(path.as_str(), data_type));
            readers.push(SeriesReader::spawn(
                fetcher.clone(),
                path.clone(),
                filter.clone(),
                context,
            ));
        }
        Ok(Self { columns, readers })
    }
}

#[async_trait]
impl QueryDataSet for NonAlignedDataSet {
    fn columns(&self) -> &[ColumnHeader] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<RowRecord>> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut any = false;
        for reader in &mut self.readers {
            match reader.next_point().await? {
                Some(point) => {
                    any = true;
                    fields.push(Some(Value::Int64(point.timestamp)));
                    fields.push(Some(point.value));
                }
                None => fields.extend([None, None]),
            }
        }
        Ok(any.then_some(RowRecord {
            timestamp: None,
            fields,
        }))
    }
}
