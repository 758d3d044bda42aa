//! Physical query plans
//!
//! Plans arrive already validated from the planner. They are immutable
//! values: the router produces a new plan carrying the optimized expression
//! instead of mutating the one it was handed.

use super::expression::{Expression, GroupByWindow};
use super::fill::FillStrategy;
use crate::cluster::PartitionKey;
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Dotted series path, e.g. `root.sg1.d1.s1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesPath(String);

impl SeriesPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage group the series belongs to
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::for_path(&self.0)
    }
}

impl fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SeriesPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for SeriesPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float,
    Double,
    Text,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int32 | DataType::Int64 | DataType::Float | DataType::Double
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Text => "TEXT",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BOOLEAN" => Ok(DataType::Boolean),
            "INT32" => Ok(DataType::Int32),
            "INT64" => Ok(DataType::Int64),
            "FLOAT" => Ok(DataType::Float),
            "DOUBLE" => Ok(DataType::Double),
            "TEXT" => Ok(DataType::Text),
            other => Err(Error::Query(format!("unknown data type '{}'", other))),
        }
    }
}

/// Deduplicated series with their data types
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeriesSelection {
    paths: Vec<SeriesPath>,
    data_types: Vec<DataType>,
}

impl SeriesSelection {
    /// Pair up `paths` and `data_types`, dropping repeated paths
    pub fn new(paths: Vec<SeriesPath>, data_types: Vec<DataType>) -> Result<Self> {
        if paths.len() != data_types.len() {
            return Err(Error::Query(format!(
                "{} paths but {} data types",
                paths.len(),
                data_types.len()
            )));
        }
        let mut selection = Self::default();
        for (path, data_type) in paths.into_iter().zip(data_types) {
            match selection.position(&path) {
                Some(i) if selection.data_types[i] != data_type => {
                    return Err(Error::Query(format!(
                        "series {} selected as both {} and {}",
                        path, selection.data_types[i], data_type
                    )));
                }
                Some(_) => {}
                None => {
                    selection.paths.push(path);
                    selection.data_types.push(data_type);
                }
            }
        }
        Ok(selection)
    }

    pub fn single(path: impl Into<SeriesPath>, data_type: DataType) -> Self {
        Self {
            paths: vec![path.into()],
            data_types: vec![data_type],
        }
    }

    pub fn paths(&self) -> &[SeriesPath] {
        &self.paths
    }

    pub fn data_types(&self) -> &[DataType] {
        &self.data_types
    }

    pub fn position(&self, path: &SeriesPath) -> Option<usize> {
        self.paths.iter().position(|p| p == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SeriesPath, DataType)> {
        self.paths.iter().zip(self.data_types.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationType {
    Count,
    Sum,
    Avg,
    MinValue,
    MaxValue,
    FirstValue,
    LastValue,
    MinTime,
    MaxTime,
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Count => "count",
            AggregationType::Sum => "sum",
            AggregationType::Avg => "avg",
            AggregationType::MinValue => "min_value",
            AggregationType::MaxValue => "max_value",
            AggregationType::FirstValue => "first_value",
            AggregationType::LastValue => "last_value",
            AggregationType::MinTime => "min_time",
            AggregationType::MaxTime => "max_time",
        }
    }

    /// Type of the aggregate over a series of `input` type
    pub fn result_type(&self, input: DataType) -> DataType {
        match self {
            AggregationType::Count | AggregationType::MinTime | AggregationType::MaxTime => {
                DataType::Int64
            }
            AggregationType::Sum | AggregationType::Avg => DataType::Double,
            AggregationType::MinValue
            | AggregationType::MaxValue
            | AggregationType::FirstValue
            | AggregationType::LastValue => input,
        }
    }

    pub fn requires_numeric(&self) -> bool {
        matches!(self, AggregationType::Sum | AggregationType::Avg)
    }
}

impl FromStr for AggregationType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(AggregationType::Count),
            "sum" => Ok(AggregationType::Sum),
            "avg" => Ok(AggregationType::Avg),
            "min_value" => Ok(AggregationType::MinValue),
            "max_value" => Ok(AggregationType::MaxValue),
            "first_value" => Ok(AggregationType::FirstValue),
            "last_value" => Ok(AggregationType::LastValue),
            "min_time" => Ok(AggregationType::MinTime),
            "max_time" => Ok(AggregationType::MaxTime),
            other => Err(Error::Query(format!("unknown aggregation '{}'", other))),
        }
    }
}

/// One output column of an aggregation: `aggregation(series[series_index])`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateColumn {
    pub series_index: usize,
    pub aggregation: AggregationType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawDataQueryPlan {
    pub series: SeriesSelection,
    pub expression: Option<Expression>,
    pub align_by_time: bool,
}

impl RawDataQueryPlan {
    pub fn new(series: SeriesSelection, expression: Option<Expression>) -> Self {
        Self {
            series,
            expression,
            align_by_time: true,
        }
    }

    pub fn non_aligned(mut self) -> Self {
        self.align_by_time = false;
        self
    }

    pub fn with_expression(self, expression: Option<Expression>) -> Self {
        Self { expression, ..self }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPlan {
    /// Distinct series read by the aggregation
    pub series: SeriesSelection,
    pub columns: Vec<AggregateColumn>,
    pub expression: Option<Expression>,
}

impl AggregationPlan {
    /// Build from parallel `(path, type, aggregation)` lists
    ///
    /// A path may appear with several aggregations; repeated
    /// `(path, aggregation)` pairs collapse to one column.
    pub fn new(
        paths: Vec<SeriesPath>,
        data_types: Vec<DataType>,
        aggregations: Vec<AggregationType>,
        expression: Option<Expression>,
    ) -> Result<Self> {
        if paths.len() != aggregations.len() {
            return Err(Error::Query(format!(
                "{} paths but {} aggregations",
                paths.len(),
                aggregations.len()
            )));
        }
        let series = SeriesSelection::new(paths.clone(), data_types)?;
        let mut columns: Vec<AggregateColumn> = Vec::with_capacity(paths.len());
        for (path, aggregation) in paths.iter().zip(aggregations) {
            let series_index = series
                .position(path)
                .ok_or_else(|| Error::Internal(format!("series {} lost in dedup", path)))?;
            let column = AggregateColumn {
                series_index,
                aggregation,
            };
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        Ok(Self {
            series,
            columns,
            expression,
        })
    }

    pub fn with_expression(self, expression: Option<Expression>) -> Self {
        Self { expression, ..self }
    }

    /// Column label, e.g. `count(root.sg.d1.s1)`
    pub fn column_name(&self, column: &AggregateColumn) -> String {
        format!(
            "{}({})",
            column.aggregation.as_str(),
            self.series.paths()[column.series_index]
        )
    }

    pub fn column_type(&self, column: &AggregateColumn) -> DataType {
        column
            .aggregation
            .result_type(self.series.data_types()[column.series_index])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupByPlan {
    pub aggregation: AggregationPlan,
    pub window: GroupByWindow,
}

impl GroupByPlan {
    pub fn new(aggregation: AggregationPlan, window: GroupByWindow) -> Self {
        Self {
            aggregation,
            window,
        }
    }

    pub fn expression(&self) -> Option<&Expression> {
        self.aggregation.expression.as_ref()
    }

    pub fn with_expression(self, expression: Option<Expression>) -> Self {
        Self {
            aggregation: self.aggregation.with_expression(expression),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupByFillPlan {
    pub group_by: GroupByPlan,
    pub fill: HashMap<DataType, FillStrategy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillQueryPlan {
    pub series: SeriesSelection,
    pub query_time: i64,
    pub fill: HashMap<DataType, FillStrategy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastQueryPlan {
    pub series: SeriesSelection,
}

/// Closed set of plan shapes the router dispatches on
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    RawData(RawDataQueryPlan),
    Aggregation(AggregationPlan),
    GroupBy(GroupByPlan),
    GroupByFill(GroupByFillPlan),
    Fill(FillQueryPlan),
    Last(LastQueryPlan),
}

impl QueryPlan {
    pub fn name(&self) -> &'static str {
        match self {
            QueryPlan::RawData(_) => "raw_data",
            QueryPlan::Aggregation(_) => "aggregation",
            QueryPlan::GroupBy(_) => "group_by",
            QueryPlan::GroupByFill(_) => "group_by_fill",
            QueryPlan::Fill(_) => "fill",
            QueryPlan::Last(_) => "last",
        }
    }

    pub fn series(&self) -> &SeriesSelection {
        match self {
            QueryPlan::RawData(plan) => &plan.series,
            QueryPlan::Aggregation(plan) => &plan.series,
            QueryPlan::GroupBy(plan) => &plan.aggregation.series,
            QueryPlan::GroupByFill(plan) => &plan.group_by.aggregation.series,
            QueryPlan::Fill(plan) => &plan.series,
            QueryPlan::Last(plan) => &plan.series,
        }
    }
}
