//! Predicate queries over a collection.
//!
//! A [`Query`] is a conjunction of clauses. Equality on an indexed field is
//! answered from the index; every other clause is checked against the
//! candidate records.

use crate::{record::fields, Record};
use serde_json::Value;
use std::cmp::Ordering;

/// A single predicate over one field. An absent field reads as `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    IsNull(String),
    NotNull(String),
}

impl Clause {
    pub fn field(&self) -> &str {
        match self {
            Clause::Eq(f, _)
            | Clause::Ne(f, _)
            | Clause::Gt(f, _)
            | Clause::Gte(f, _)
            | Clause::Lt(f, _)
            | Clause::Lte(f, _)
            | Clause::IsNull(f)
            | Clause::NotNull(f) => f,
        }
    }

    /// Check the clause against a record.
    pub fn matches(&self, record: &Record) -> bool {
        let value = record.get(self.field()).unwrap_or(&Value::Null);
        match self {
            Clause::Eq(_, expected) => values_equal(value, expected),
            Clause::Ne(_, expected) => !values_equal(value, expected),
            Clause::Gt(_, bound) => compare(value, bound) == Some(Ordering::Greater),
            Clause::Gte(_, bound) => matches!(
                compare(value, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Clause::Lt(_, bound) => compare(value, bound) == Some(Ordering::Less),
            Clause::Lte(_, bound) => {
                matches!(compare(value, bound), Some(Ordering::Less | Ordering::Equal))
            }
            Clause::IsNull(_) => value.is_null(),
            Clause::NotNull(_) => !value.is_null(),
        }
    }
}

/// Builder for a conjunction of clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    /// A query matching every record, tombstones included.
    pub fn new() -> Self {
        Self::default()
    }

    /// A query matching only non-deleted records.
    pub fn active() -> Self {
        Self::new().is_null(fields::DELETED_AT)
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(field.into(), value.into()));
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Ne(field.into(), value.into()));
        self
    }

    pub fn gt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Gt(field.into(), value.into()));
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Gte(field.into(), value.into()));
        self
    }

    pub fn lt(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Lt(field.into(), value.into()));
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Lte(field.into(), value.into()));
        self
    }

    pub fn is_null(mut self, field: impl Into<String>) -> Self {
        self.clauses.push(Clause::IsNull(field.into()));
        self
    }

    pub fn not_null(mut self, field: impl Into<String>) -> Self {
        self.clauses.push(Clause::NotNull(field.into()));
        self
    }

    /// Add an arbitrary clause.
    pub fn and(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Whether every clause holds for the record.
    pub fn matches(&self, record: &Record) -> bool {
        self.clauses.iter().all(|c| c.matches(record))
    }
}

/// Ordered key for secondary indices. Arrays and objects are not indexable.
///
/// Integral numbers, including floats with no fractional part, are keyed
/// exactly as `Int`, so ids above 2^53 stay distinct and `2` equals `2.0`.
#[derive(Debug, Clone)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    String(String),
}

/// Largest magnitude at which an integral `f64` still fits an `i128`.
const INT_RANGE: f64 = 1.0e38;

impl IndexKey {
    /// Key for a field value; `None` means the value cannot be indexed.
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        match value {
            None | Some(Value::Null) => Some(IndexKey::Null),
            Some(Value::Bool(b)) => Some(IndexKey::Bool(*b)),
            Some(Value::Number(n)) => Some(Self::number(n)),
            Some(Value::String(s)) => Some(IndexKey::String(s.clone())),
            Some(Value::Array(_) | Value::Object(_)) => None,
        }
    }

    fn number(n: &serde_json::Number) -> Self {
        if let Some(i) = n.as_i64() {
            return IndexKey::Int(i128::from(i));
        }
        if let Some(u) = n.as_u64() {
            return IndexKey::Int(i128::from(u));
        }
        match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < INT_RANGE => IndexKey::Int(f as i128),
            Some(f) => IndexKey::Float(f),
            None => IndexKey::Float(f64::NAN),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexKey::Null => 0,
            IndexKey::Bool(_) => 1,
            IndexKey::Int(_) | IndexKey::Float(_) => 2,
            IndexKey::String(_) => 3,
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            (IndexKey::Int(a), IndexKey::Int(b)) => a.cmp(b),
            (IndexKey::Float(a), IndexKey::Float(b)) => a.total_cmp(b),
            // an Int never equals a Float; ties from rounding sort the Int first
            (IndexKey::Int(a), IndexKey::Float(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (IndexKey::Float(a), IndexKey::Int(b)) => {
                a.total_cmp(&(*b as f64)).then(Ordering::Greater)
            }
            (IndexKey::String(a), IndexKey::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Equality with numbers compared by value, so `2` matches `2.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => IndexKey::number(x) == IndexKey::number(y),
        _ => a == b,
    }
}

/// Ordering between two scalars of the same kind. Timestamps are stored as
/// ISO-8601 strings, so string order is chronological order.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            Some(IndexKey::number(x).cmp(&IndexKey::number(y)))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
