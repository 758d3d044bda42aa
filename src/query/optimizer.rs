//! Filter expression rewriting
//!
//! After optimization an expression is either a single GLOBAL_TIME node or
//! a tree of per-series leaves with no GLOBAL_TIME node left inside it.

use super::expression::{Expression, Filter};
use super::plan::SeriesPath;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionOptimizer;

impl ExpressionOptimizer {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite `expression` against the selected `paths`
    ///
    /// The input is left untouched; the rewritten tree is returned.
    pub fn optimize(&self, expression: &Expression, paths: &[SeriesPath]) -> Result<Expression> {
        match expression {
            Expression::GlobalTime(filter) => {
                if filter.has_value_predicate() {
                    return Err(Error::Optimization(
                        "global time filter contains a value predicate".to_string(),
                    ));
                }
                filter.validate()?;
                Ok(expression.clone())
            }
            Expression::Series { filter, .. } => {
                filter.validate()?;
                Ok(expression.clone())
            }
            Expression::And(left, right) => {
                let left = self.optimize(left, paths)?;
                let right = self.optimize(right, paths)?;
                Ok(match (left, right) {
                    (Expression::GlobalTime(l), Expression::GlobalTime(r)) => {
                        Expression::GlobalTime(l.and(r))
                    }
                    (Expression::GlobalTime(time), other)
                    | (other, Expression::GlobalTime(time)) => push_down(other, &time),
                    (left, right) => left.and(right),
                })
            }
            Expression::Or(left, right) => {
                let left = self.optimize(left, paths)?;
                let right = self.optimize(right, paths)?;
                match (left, right) {
                    (Expression::GlobalTime(l), Expression::GlobalTime(r)) => {
                        Ok(Expression::GlobalTime(l.or(r)))
                    }
                    (Expression::GlobalTime(time), other)
                    | (other, Expression::GlobalTime(time)) => {
                        Ok(expand_over_paths(&time, paths)?.or(other))
                    }
                    (left, right) => Ok(left.or(right)),
                }
            }
        }
    }
}

/// AND `time` into every series leaf of `expression`
fn push_down(expression: Expression, time: &Filter) -> Expression {
    match expression {
        Expression::Series { path, filter } => Expression::Series {
            path,
            filter: filter.and(time.clone()),
        },
        Expression::And(left, right) => push_down(*left, time).and(push_down(*right, time)),
        Expression::Or(left, right) => push_down(*left, time).or(push_down(*right, time)),
        Expression::GlobalTime(filter) => Expression::GlobalTime(filter.and(time.clone())),
    }
}

/// OR of `time` bound to each selected path
fn expand_over_paths(time: &Filter, paths: &[SeriesPath]) -> Result<Expression> {
    let mut leaves = paths
        .iter()
        .map(|path| Expression::series(path.clone(), time.clone()));
    let first = leaves.next().ok_or_else(|| {
        Error::Optimization("cannot expand a global time filter over zero paths".to_string())
    })?;
    Ok(leaves.fold(first, Expression::or))
}
