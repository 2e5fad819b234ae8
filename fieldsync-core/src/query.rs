//! Query specifications for collection reads.
//!
//! A [`QuerySpec`] is the store-agnostic description of a collection query:
//! a set of field filters, an optional single sort, and an optional row limit.
//! Specifications are validated before they reach the network so malformed
//! queries fail fast with a [`QueryError`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;
use crate::record::parse_timestamp;

/// Pseudo-field that addresses the document identifier in filters.
pub const DOCUMENT_ID_FIELD: &str = "__id__";

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
    /// Field value is one of the listed values
    In,
    /// Field value is none of the listed values
    NotIn,
    /// Array field contains the value
    ArrayContains,
    /// Array field contains any of the listed values
    ArrayContainsAny,
}

impl FilterOperator {
    /// Canonical textual form, used in keys and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::ArrayContains => "array-contains",
            Self::ArrayContainsAny => "array-contains-any",
        }
    }

    /// Operators whose operand is a list of candidate values.
    pub fn takes_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn | Self::ArrayContainsAny)
    }

    /// Ordering comparisons (`<`, `<=`, `>`, `>=`).
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Lt | Self::Lte | Self::Gt | Self::Gte)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOperator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "==" | "=" | "eq" => Ok(Self::Eq),
            "!=" | "<>" | "ne" => Ok(Self::Ne),
            "<" | "lt" => Ok(Self::Lt),
            "<=" | "lte" => Ok(Self::Lte),
            ">" | "gt" => Ok(Self::Gt),
            ">=" | "gte" => Ok(Self::Gte),
            "in" => Ok(Self::In),
            "not-in" | "not_in" => Ok(Self::NotIn),
            "array-contains" | "array_contains" => Ok(Self::ArrayContains),
            "array-contains-any" | "array_contains_any" => Ok(Self::ArrayContainsAny),
            _ => Err(QueryError::UnknownOperator {
                operator: s.to_string(),
            }),
        }
    }
}

/// A single field filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field to filter on
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against
    pub value: Value,
}

impl Filter {
    /// Create a new filter.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Build a filter from a textual operator such as `"=="` or `"array-contains"`.
    pub fn parse(
        field: impl Into<String>,
        operator: &str,
        value: impl Into<Value>,
    ) -> Result<Self, QueryError> {
        let filter = Self::new(field, operator.parse()?, value);
        filter.validate()?;
        Ok(filter)
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Lte, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Gte, value)
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOperator::In, Value::Array(values))
    }

    pub fn not_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOperator::NotIn, Value::Array(values))
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::ArrayContains, value)
    }

    pub fn array_contains_any(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOperator::ArrayContainsAny, Value::Array(values))
    }

    /// Equality filter on the document identifier.
    pub fn document_id(id: impl Into<String>) -> Self {
        Self::eq(DOCUMENT_ID_FIELD, Value::String(id.into()))
    }

    /// Check the operand shape against the operator.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.field.trim().is_empty() {
            return Err(QueryError::EmptyField);
        }

        let invalid = |reason: &str| QueryError::InvalidOperand {
            field: self.field.clone(),
            operator: self.operator.to_string(),
            reason: reason.to_string(),
        };

        if self.operator.takes_list() {
            return match &self.value {
                Value::Array(values) if values.is_empty() => {
                    Err(invalid("list operand must not be empty"))
                }
                Value::Array(_) => Ok(()),
                _ => Err(invalid("operand must be a list")),
            };
        }

        if self.operator.is_range() {
            return match &self.value {
                Value::Number(_) | Value::String(_) => Ok(()),
                Value::Object(_) if parse_timestamp(&self.value).is_some() => Ok(()),
                _ => Err(invalid("range operand must be a number, string or timestamp")),
            };
        }

        if self.operator == FilterOperator::ArrayContains && self.value.is_array() {
            return Err(invalid("array-contains takes a single value"));
        }

        Ok(())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl FromStr for Direction {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Asc),
            "desc" | "descending" => Ok(Self::Desc),
            _ => Err(QueryError::UnknownDirection {
                direction: s.to_string(),
            }),
        }
    }
}

/// Single-field ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A collection query: filters, optional sort, optional limit.
///
/// Filters are a set. Construction order carries no meaning and the cache
/// key builder canonicalizes it away.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl QuerySpec {
    /// An empty specification: every document in the collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a filter from a textual operator.
    pub fn where_op(
        self,
        field: impl Into<String>,
        operator: &str,
        value: impl Into<Value>,
    ) -> Result<Self, QueryError> {
        Ok(self.filter(Filter::parse(field, operator, value)?))
    }

    /// Set the sort field and direction.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Set the row limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when the spec selects the whole collection unordered.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.order_by.is_none() && self.limit.is_none()
    }

    /// Validate every filter, the sort field and the limit.
    pub fn validate(&self) -> Result<(), QueryError> {
        for filter in &self.filters {
            filter.validate()?;
        }
        if let Some(order) = &self.order_by {
            if order.field.trim().is_empty() {
                return Err(QueryError::EmptyField);
            }
        }
        if self.limit == Some(0) {
            return Err(QueryError::ZeroLimit);
        }
        Ok(())
    }
}
