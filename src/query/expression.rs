//! Time and value predicates over time series
//!
//! A [`Filter`] tests one `(timestamp, value)` point. An [`Expression`] binds
//! filters to series: either a GLOBAL_TIME filter that applies to every
//! selected series, or a per-series filter, combined with AND/OR.

use super::plan::{DataType, SeriesPath};
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single series value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Text(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::Text(_) => DataType::Text,
        }
    }

    /// Numeric view of the value, `None` for booleans and text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Boolean(_) | Value::Text(_) => None,
        }
    }

    /// Cast a number into `data_type`; integer targets truncate
    pub fn from_f64(value: f64, data_type: DataType) -> Option<Value> {
        match data_type {
            DataType::Int32 => Some(Value::Int32(value as i32)),
            DataType::Int64 => Some(Value::Int64(value as i64)),
            DataType::Float => Some(Value::Float(value as f32)),
            DataType::Double => Some(Value::Double(value)),
            DataType::Boolean | DataType::Text => None,
        }
    }

    /// Ordering between values of comparable kinds
    ///
    /// Numbers compare across numeric types; booleans and text only compare
    /// with their own kind.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// A timestamped value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValuePair {
    pub timestamp: i64,
    pub value: Value,
}

impl TimeValuePair {
    pub fn new(timestamp: i64, value: Value) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

/// Sliding time windows `[start + k*step, start + k*step + interval)`,
/// clipped to `end_time`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupByWindow {
    pub interval: i64,
    pub sliding_step: i64,
    pub start_time: i64,
    pub end_time: i64,
}

impl GroupByWindow {
    pub fn new(interval: i64, sliding_step: i64, start_time: i64, end_time: i64) -> Self {
        Self {
            interval,
            sliding_step,
            start_time,
            end_time,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval <= 0 || self.sliding_step <= 0 {
            return Err(Error::Optimization(format!(
                "group by interval ({}) and sliding step ({}) must be positive",
                self.interval, self.sliding_step
            )));
        }
        if self.start_time > self.end_time {
            return Err(Error::Optimization(format!(
                "group by start {} is after end {}",
                self.start_time, self.end_time
            )));
        }
        Ok(())
    }

    /// Whether `timestamp` falls inside any window
    pub fn contains(&self, timestamp: i64) -> bool {
        if self.interval <= 0 || self.sliding_step <= 0 {
            return false;
        }
        if timestamp < self.start_time || timestamp >= self.end_time {
            return false;
        }
        let offset = timestamp.abs_diff(self.start_time);
        offset % self.sliding_step.unsigned_abs() < self.interval.unsigned_abs()
    }

    /// Bounds of the window opening at `start`, clamped to the query end
    pub fn window_at(&self, start: i64) -> Option<(i64, i64)> {
        if start < self.start_time || start >= self.end_time {
            return None;
        }
        Some((start, start.saturating_add(self.interval).min(self.end_time)))
    }

    /// Start of the window after the one opening at `start`
    pub fn next_start(&self, start: i64) -> Option<i64> {
        start
            .checked_add(self.sliding_step.max(1))
            .filter(|next| *next < self.end_time)
    }

    /// Window bounds `(start, end)` in order, computed as they are consumed
    pub fn windows(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        let first = Some(self.start_time).filter(|start| *start < self.end_time);
        std::iter::successors(first, move |start| self.next_start(*start))
            .filter_map(move |start| self.window_at(start))
    }

    pub fn window_count(&self) -> usize {
        if self.sliding_step <= 0 || self.end_time <= self.start_time {
            return 0;
        }
        let span = self.end_time.abs_diff(self.start_time);
        usize::try_from(span.div_ceil(self.sliding_step.unsigned_abs())).unwrap_or(usize::MAX)
    }
}

/// Predicate over a single `(timestamp, value)` point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// time <op> literal
    Time(CompareOp, i64),
    /// value <op> literal
    Value(CompareOp, Value),
    /// time falls in a group-by window
    GroupBy(GroupByWindow),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn time(op: CompareOp, timestamp: i64) -> Self {
        Filter::Time(op, timestamp)
    }

    pub fn value(op: CompareOp, value: Value) -> Self {
        Filter::Value(op, value)
    }

    /// `[start, end)` as a time filter
    pub fn time_range(start: i64, end: i64) -> Self {
        Filter::time(CompareOp::GtEq, start).and(Filter::time(CompareOp::Lt, end))
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    pub fn satisfy(&self, timestamp: i64, value: &Value) -> bool {
        match self {
            Filter::Time(op, literal) => op.holds(timestamp.cmp(literal)),
            Filter::Value(op, literal) => value
                .compare(literal)
                .map(|ordering| op.holds(ordering))
                .unwrap_or(false),
            Filter::GroupBy(window) => window.contains(timestamp),
            Filter::And(left, right) => {
                left.satisfy(timestamp, value) && right.satisfy(timestamp, value)
            }
            Filter::Or(left, right) => {
                left.satisfy(timestamp, value) || right.satisfy(timestamp, value)
            }
            Filter::Not(inner) => !inner.satisfy(timestamp, value),
        }
    }

    /// Evaluate a filter that references time only
    pub fn satisfy_time(&self, timestamp: i64) -> bool {
        match self {
            Filter::Time(op, literal) => op.holds(timestamp.cmp(literal)),
            Filter::Value(..) => true,
            Filter::GroupBy(window) => window.contains(timestamp),
            Filter::And(left, right) => {
                left.satisfy_time(timestamp) && right.satisfy_time(timestamp)
            }
            Filter::Or(left, right) => {
                left.satisfy_time(timestamp) || right.satisfy_time(timestamp)
            }
            Filter::Not(inner) => !inner.satisfy_time(timestamp),
        }
    }

    pub fn has_value_predicate(&self) -> bool {
        match self {
            Filter::Value(..) => true,
            Filter::Time(..) | Filter::GroupBy(_) => false,
            Filter::And(left, right) | Filter::Or(left, right) => {
                left.has_value_predicate() || right.has_value_predicate()
            }
            Filter::Not(inner) => inner.has_value_predicate(),
        }
    }

    /// Check every embedded group-by window
    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::GroupBy(window) => window.validate(),
            Filter::And(left, right) | Filter::Or(left, right) => {
                left.validate()?;
                right.validate()
            }
            Filter::Not(inner) => inner.validate(),
            Filter::Time(..) | Filter::Value(..) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionType {
    GlobalTime,
    Series,
    And,
    Or,
}

/// Filter tree bound to series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// Time-only filter applying to every selected series
    GlobalTime(Filter),
    /// Filter on one series
    Series { path: SeriesPath, filter: Filter },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub fn global_time(filter: Filter) -> Self {
        Expression::GlobalTime(filter)
    }

    pub fn series(path: impl Into<SeriesPath>, filter: Filter) -> Self {
        Expression::Series {
            path: path.into(),
            filter,
        }
    }

    pub fn and(self, other: Expression) -> Self {
        Expression::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expression) -> Self {
        Expression::Or(Box::new(self), Box::new(other))
    }

    pub fn expression_type(&self) -> ExpressionType {
        match self {
            Expression::GlobalTime(_) => ExpressionType::GlobalTime,
            Expression::Series { .. } => ExpressionType::Series,
            Expression::And(..) => ExpressionType::And,
            Expression::Or(..) => ExpressionType::Or,
        }
    }

    pub fn is_global_time(&self) -> bool {
        self.expression_type() == ExpressionType::GlobalTime
    }

    /// Series referenced by per-series leaves, in first-seen order
    pub fn series_paths(&self) -> Vec<&SeriesPath> {
        let mut paths = Vec::new();
        self.collect_paths(&mut paths);
        paths
    }

    fn collect_paths<'a>(&'a self, paths: &mut Vec<&'a SeriesPath>) {
        match self {
            Expression::GlobalTime(_) => {}
            Expression::Series { path, .. } => {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
            Expression::And(left, right) | Expression::Or(left, right) => {
                left.collect_paths(paths);
                right.collect_paths(paths);
            }
        }
    }
}
