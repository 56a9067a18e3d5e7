//! Metadata filter expressions.
//!
//! A [`Filter`] is a tree of comparison leaves combined with `AND`, `OR` and
//! `NOT`. Leaves name either a declared metadata column (`category`) or a key
//! inside the JSON metadata column using `<json column>.<key>`
//! (`metadata_json.author`).
//!
//! Filters are compiled to parameterized SQL by [`compile`]. Values are
//! always bound; only validated column names reach the statement text.
//!
//! # Example
//!
//! ```rust
//! use embedstore::filter::Filter;
//!
//! let filter = Filter::and(vec![
//!     Filter::eq("category", "docs"),
//!     Filter::or(vec![Filter::gte("page", 10), Filter::like("title", "Intro%")]),
//! ]);
//! assert!(!filter.is_empty());
//! ```

mod compiler;

pub use compiler::{CompiledFilter, FilterContext, SqlParam, compile};
pub(crate) use compiler::value_text;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// Membership in a list of values.
    In,
    /// SQL `LIKE`. The pattern is passed through unescaped; escaping `%` and
    /// `_` is the caller's responsibility.
    Like,
}

impl FilterOperator {
    /// Returns the SQL operator.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::In => "IN",
            Self::Like => "LIKE",
        }
    }

    /// Returns true for `<`, `<=`, `>` and `>=`.
    #[must_use]
    pub const fn is_ordering(&self) -> bool {
        matches!(self, Self::Lt | Self::Lte | Self::Gt | Self::Gte)
    }
}

/// A filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// `field <op> value`.
    Comparison {
        /// Declared column name or `<json column>.<key>`.
        field: String,
        /// Operator.
        op: FilterOperator,
        /// Scalar value, or a list for [`FilterOperator::In`].
        value: Value,
    },
    /// All sub-filters match. An empty list matches everything.
    And {
        /// Sub-filters.
        filters: Vec<Self>,
    },
    /// Any sub-filter matches. An empty list matches nothing.
    Or {
        /// Sub-filters.
        filters: Vec<Self>,
    },
    /// The sub-filter does not match.
    Not {
        /// Negated filter.
        filter: Box<Self>,
    },
}

// `eq`, `ne` and `not` build leaves; they are not comparisons or operators.
#[allow(clippy::should_implement_trait)]
impl Filter {
    /// Builds a comparison leaf.
    #[must_use]
    pub fn comparison(field: impl Into<String>, op: FilterOperator, value: impl Into<Value>) -> Self {
        Self::Comparison {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// `field = value`
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, FilterOperator::Eq, value)
    }

    /// `field != value`
    #[must_use]
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, FilterOperator::Ne, value)
    }

    /// `field < value`
    #[must_use]
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, FilterOperator::Lt, value)
    }

    /// `field <= value`
    #[must_use]
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, FilterOperator::Lte, value)
    }

    /// `field > value`
    #[must_use]
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, FilterOperator::Gt, value)
    }

    /// `field >= value`
    #[must_use]
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::comparison(field, FilterOperator::Gte, value)
    }

    /// `field IN (values...)`
    #[must_use]
    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::comparison(field, FilterOperator::In, Value::Array(values))
    }

    /// `field LIKE pattern`
    #[must_use]
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::comparison(field, FilterOperator::Like, Value::String(pattern.into()))
    }

    /// Conjunction.
    #[must_use]
    pub const fn and(filters: Vec<Self>) -> Self {
        Self::And { filters }
    }

    /// Disjunction.
    #[must_use]
    pub const fn or(filters: Vec<Self>) -> Self {
        Self::Or { filters }
    }

    /// Negation.
    #[must_use]
    pub fn not(filter: Self) -> Self {
        Self::Not {
            filter: Box::new(filter),
        }
    }

    /// Returns true if the filter matches everything (an empty `AND`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And { filters } => filters.iter().all(Self::is_empty),
            Self::Comparison { .. } | Self::Or { .. } | Self::Not { .. } => false,
        }
    }

    /// Returns every field referenced by the filter.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Comparison { field, .. } => out.push(field),
            Self::And { filters } | Self::Or { filters } => {
                for filter in filters {
                    filter.collect_fields(out);
                }
            },
            Self::Not { filter } => filter.collect_fields(out),
        }
    }
}
