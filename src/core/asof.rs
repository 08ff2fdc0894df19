//! "What was true at time T" over stored rows.
//!
//! Two boundary rules live here and must not be mixed up:
//!
//! * Interval rows (`valid_from`, `valid_to`): current at T iff
//!   `valid_from <= T` and (`valid_to` is open or `valid_to > T`). The start is
//!   inclusive, the end exclusive.
//! * Point events (`effective_at`): visible at T iff `effective_at <= T`.
//!
//! Both are offered in memory (iterator adaptors) and in SQL ([`Query`]).
//! Either form only narrows, so `as_of` composes with any other filter in
//! any order.

use crate::core::error::DecisioningError;
use crate::core::time::Timestamp;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub valid_from: Timestamp,
    pub valid_to: Option<Timestamp>,
}

impl ValidityWindow {
    pub fn new(valid_from: Timestamp, valid_to: Option<Timestamp>) -> Result<Self, DecisioningError> {
        if let Some(end) = valid_to {
            if end <= valid_from {
                return Err(DecisioningError::ValidationError(format!(
                    "valid_to ({}) must be after valid_from ({})",
                    end, valid_from
                )));
            }
        }
        Ok(Self {
            valid_from,
            valid_to,
        })
    }

    pub fn open_ended(valid_from: Timestamp) -> Self {
        Self {
            valid_from,
            valid_to: None,
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.valid_from <= at && self.valid_to.is_none_or(|end| end > at)
    }
}

/// Rows with a validity interval.
pub trait EffectiveDated {
    fn validity(&self) -> ValidityWindow;

    fn is_valid_at(&self, at: Timestamp) -> bool {
        self.validity().contains(at)
    }
}

/// Append-only rows stamped with the business time they took effect.
pub trait PointInTime {
    fn effective_at(&self) -> Timestamp;

    fn is_effective_at(&self, at: Timestamp) -> bool {
        self.effective_at() <= at
    }
}

impl<T: EffectiveDated + ?Sized> EffectiveDated for &T {
    fn validity(&self) -> ValidityWindow {
        (**self).validity()
    }
}

impl<T: PointInTime + ?Sized> PointInTime for &T {
    fn effective_at(&self) -> Timestamp {
        (**self).effective_at()
    }
}

/// Lazy as-of narrowing for any iterator of dated rows.
pub trait AsOfExt: Iterator + Sized {
    fn valid_as_of(self, at: Timestamp) -> std::iter::Filter<Self, Box<dyn FnMut(&Self::Item) -> bool>>
    where
        Self::Item: EffectiveDated,
    {
        self.filter(Box::new(move |row: &Self::Item| row.is_valid_at(at)))
    }

    fn effective_as_of(self, at: Timestamp) -> std::iter::Filter<Self, Box<dyn FnMut(&Self::Item) -> bool>>
    where
        Self::Item: PointInTime,
    {
        self.filter(Box::new(move |row: &Self::Item| row.is_effective_at(at)))
    }
}

impl<I: Iterator> AsOfExt for I {}

/// One ANDed condition with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
struct Predicate {
    sql: String,
    params: Vec<SqlValue>,
}

/// A narrowing SELECT over one table.
///
/// Table and column names are `&'static str` so they never come from user
/// input; values always travel as bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: &'static str,
    columns: &'static str,
    valid_from_column: &'static str,
    valid_to_column: &'static str,
    effective_at_column: &'static str,
    predicates: Vec<Predicate>,
    order_by: Option<&'static str>,
    limit: Option<i64>,
}

impl Query {
    pub fn select(table: &'static str, columns: &'static str) -> Self {
        Self {
            table,
            columns,
            valid_from_column: "valid_from",
            valid_to_column: "valid_to",
            effective_at_column: "effective_at",
            predicates: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn validity_columns(mut self, valid_from: &'static str, valid_to: &'static str) -> Self {
        self.valid_from_column = valid_from;
        self.valid_to_column = valid_to;
        self
    }

    pub fn effective_column(mut self, effective_at: &'static str) -> Self {
        self.effective_at_column = effective_at;
        self
    }

    /// Interval rule: `valid_from <= at AND (valid_to IS NULL OR valid_to > at)`.
    pub fn as_of(mut self, at: Timestamp) -> Self {
        let micros = SqlValue::Integer(at.as_micros());
        self.predicates.push(Predicate {
            sql: format!(
                "({from} <= ? AND ({to} IS NULL OR {to} > ?))",
                from = self.valid_from_column,
                to = self.valid_to_column
            ),
            params: vec![micros.clone(), micros],
        });
        self
    }

    /// `as_of(now)`.
    pub fn current(self, now: Timestamp) -> Self {
        self.as_of(now)
    }

    /// Point-event rule: `effective_at <= at`.
    pub fn effective_as_of(mut self, at: Timestamp) -> Self {
        self.predicates.push(Predicate {
            sql: format!("{} <= ?", self.effective_at_column),
            params: vec![SqlValue::Integer(at.as_micros())],
        });
        self
    }

    pub fn filter_eq(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.predicates.push(Predicate {
            sql: format!("{} = ?", column),
            params: vec![value.into()],
        });
        self
    }

    pub fn filter_null(mut self, column: &'static str) -> Self {
        self.predicates.push(Predicate {
            sql: format!("{} IS NULL", column),
            params: Vec::new(),
        });
        self
    }

    pub fn order_by(mut self, clause: &'static str) -> Self {
        self.order_by = Some(clause);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut sql = format!("SELECT {} FROM {}", self.columns, self.table);
        let mut params = Vec::new();
        if !self.predicates.is_empty() {
            let clauses: Vec<&str> = self.predicates.iter().map(|p| p.sql.as_str()).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
            for p in &self.predicates {
                params.extend(p.params.iter().cloned());
            }
        }
        if let Some(order) = self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(limit));
        }
        (sql, params)
    }

    pub fn fetch<T, F>(&self, conn: &Connection, map_row: F) -> Result<Vec<T>, DecisioningError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let (sql, params) = self.to_sql();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), map_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
