//! Filter-to-SQL compilation.
//!
//! Produces a predicate with numbered placeholders (`$2`, `$3`, ...) and the
//! values to bind to them. Declared columns compare against values bound as
//! text and cast to the column's declared type, so one bind type works for
//! every column type. JSON keys are bound too; only validated column names
//! are interpolated.

use super::{Filter, FilterOperator};
use crate::models::{SafeIdent, SqlType};
use crate::{Error, Result};
use serde_json::Value;
use tokio_postgres::types::ToSql;

/// Declared column types `LIKE` can be applied to.
const TEXT_TYPES: &[&str] = &[
    "text",
    "character varying",
    "varchar",
    "character",
    "char",
    "bpchar",
    "citext",
    "name",
];

/// A value bound to a compiled placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// Text, cast server-side where needed.
    Text(String),
    /// Double precision number.
    Float(f64),
    /// Boolean.
    Bool(bool),
}

impl SqlParam {
    /// Returns the value as a bind parameter.
    #[must_use]
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            Self::Text(s) => s,
            Self::Float(f) => f,
            Self::Bool(b) => b,
        }
    }
}

/// A compiled predicate and its bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    /// SQL predicate, without the `WHERE` keyword.
    pub clause: String,
    /// Values for the placeholders, in placeholder order.
    pub params: Vec<SqlParam>,
}

/// The fields a filter may reference.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    columns: Vec<(SafeIdent, SqlType)>,
    json_column: Option<SafeIdent>,
}

impl FilterContext {
    /// Creates a context from declared columns and the optional JSON column.
    #[must_use]
    pub const fn new(columns: Vec<(SafeIdent, SqlType)>, json_column: Option<SafeIdent>) -> Self {
        Self {
            columns,
            json_column,
        }
    }

    fn resolve<'a>(&'a self, field: &'a str) -> Result<Target<'a>> {
        if let Some((name, ty)) = self.columns.iter().find(|(name, _)| name.as_str() == field) {
            return Ok(Target::Column(name, ty));
        }
        if let Some(json) = &self.json_column {
            if let Some(key) = field
                .strip_prefix(json.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .filter(|key| !key.is_empty())
            {
                return Ok(Target::JsonKey(json, key));
            }
        }
        Err(Error::FilterCompilation(format!(
            "field '{field}' not found"
        )))
    }
}

enum Target<'a> {
    Column(&'a SafeIdent, &'a SqlType),
    JsonKey(&'a SafeIdent, &'a str),
}

/// How a JSON value is compared.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Number,
    Bool,
}

struct Compiler<'a> {
    context: &'a FilterContext,
    params: Vec<SqlParam>,
    next: usize,
}

impl Compiler<'_> {
    fn bind(&mut self, param: SqlParam) -> String {
        let placeholder = format!("${}", self.next);
        self.next += 1;
        self.params.push(param);
        placeholder
    }

    fn node(&mut self, filter: &Filter) -> Result<String> {
        match filter {
            Filter::Comparison { field, op, value } => self.leaf(field, *op, value),
            Filter::And { filters } => self.group(filters, " AND ", "TRUE"),
            Filter::Or { filters } => self.group(filters, " OR ", "FALSE"),
            Filter::Not { filter } => Ok(format!("(NOT {})", self.node(filter)?)),
        }
    }

    fn group(&mut self, filters: &[Filter], joiner: &str, empty: &str) -> Result<String> {
        if filters.is_empty() {
            return Ok(empty.to_string());
        }
        let clauses = filters
            .iter()
            .map(|f| self.node(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", clauses.join(joiner)))
    }

    fn leaf(&mut self, field: &str, op: FilterOperator, value: &Value) -> Result<String> {
        check_value(field, op, value)?;
        match self.context.resolve(field)? {
            Target::Column(column, ty) => self.column_leaf(column, ty, op, value),
            Target::JsonKey(json, key) => self.json_leaf(json, key, field, op, value),
        }
    }

    fn column_leaf(
        &mut self,
        column: &SafeIdent,
        ty: &SqlType,
        op: FilterOperator,
        value: &Value,
    ) -> Result<String> {
        let lhs = column.quoted();
        if value.is_null() {
            return Ok(null_check(&lhs, op));
        }
        let clause = match (op, value) {
            (FilterOperator::In, Value::Array(items)) => {
                if items.is_empty() {
                    return Ok("FALSE".to_string());
                }
                let placeholders: Vec<String> = items
                    .iter()
                    .map(|item| {
                        let p = self.bind(SqlParam::Text(value_text(item)));
                        format!("{p}::text::{ty}")
                    })
                    .collect();
                format!("({lhs} IN ({}))", placeholders.join(", "))
            },
            (FilterOperator::Like, _) => {
                if ty.is_array() || !TEXT_TYPES.contains(&ty.base_name().as_str()) {
                    return Err(unsupported(
                        column.as_str(),
                        op,
                        &format!("a column of type {ty}"),
                    ));
                }
                let p = self.bind(SqlParam::Text(value_text(value)));
                format!("({lhs} LIKE {p})")
            },
            _ => {
                let p = self.bind(SqlParam::Text(value_text(value)));
                format!("({lhs} {} {p}::text::{ty})", op.as_sql())
            },
        };
        Ok(clause)
    }

    fn json_leaf(
        &mut self,
        json: &SafeIdent,
        key: &str,
        field: &str,
        op: FilterOperator,
        value: &Value,
    ) -> Result<String> {
        let key_param = self.bind(SqlParam::Text(key.to_string()));
        let key_ref = JsonKeyRef {
            column: json.quoted(),
            key: format!("{key_param}::text"),
        };
        if value.is_null() {
            return Ok(null_check(&key_ref.extracted(), op));
        }
        match (op, value) {
            (FilterOperator::In, Value::Array(items)) => {
                if items.is_empty() {
                    return Ok("FALSE".to_string());
                }
                let kind = list_kind(field, items)?;
                let lhs = key_ref.typed(kind);
                let placeholders: Vec<String> = items
                    .iter()
                    .map(|item| self.bind(json_param(item, kind)))
                    .collect();
                Ok(format!("({lhs} IN ({}))", placeholders.join(", ")))
            },
            _ => {
                let kind = scalar_kind(field, value)?;
                let lhs = key_ref.typed(kind);
                let p = self.bind(json_param(value, kind));
                Ok(format!("({lhs} {} {p})", op.as_sql()))
            },
        }
    }
}

/// Compiles `filter` against `context`, numbering placeholders from
/// `first_param`.
///
/// # Errors
///
/// Returns [`Error::FilterCompilation`] if a leaf names a field that is not a
/// declared column or JSON key, or pairs an operator with a value it cannot
/// take (`in` without a list, `like` without a string or on a declared
/// column that is not of a text type, ordering against
/// booleans, nulls, lists or objects, null with anything but `=`/`!=`).
pub fn compile(
    filter: &Filter,
    context: &FilterContext,
    first_param: usize,
) -> Result<CompiledFilter> {
    let mut compiler = Compiler {
        context,
        params: Vec::new(),
        next: first_param,
    };
    let clause = compiler.node(filter)?;
    Ok(CompiledFilter {
        clause,
        params: compiler.params,
    })
}

fn unsupported(field: &str, op: FilterOperator, what: &str) -> Error {
    Error::FilterCompilation(format!(
        "operator {} on field '{field}' does not accept {what}",
        op.as_sql()
    ))
}

fn check_value(field: &str, op: FilterOperator, value: &Value) -> Result<()> {
    match (op, value) {
        (FilterOperator::In, Value::Array(items)) => {
            if items.iter().any(|v| v.is_array() || v.is_object() || v.is_null()) {
                return Err(unsupported(field, op, "nested lists, objects or nulls"));
            }
            Ok(())
        },
        (FilterOperator::In, _) => Err(unsupported(field, op, "a non-list value")),
        (FilterOperator::Like, Value::String(_)) => Ok(()),
        (FilterOperator::Like, _) => Err(unsupported(field, op, "a non-string pattern")),
        (_, Value::Array(_)) => Err(unsupported(field, op, "a list")),
        (FilterOperator::Eq | FilterOperator::Ne, _) => Ok(()),
        (_, Value::Null | Value::Bool(_) | Value::Object(_)) => {
            Err(unsupported(field, op, "null, boolean or object values"))
        },
        (_, Value::Number(_) | Value::String(_)) => Ok(()),
    }
}

fn null_check(lhs: &str, op: FilterOperator) -> String {
    if op == FilterOperator::Ne {
        format!("({lhs} IS NOT NULL)")
    } else {
        format!("({lhs} IS NULL)")
    }
}

/// Renders a JSON value as the text PostgreSQL parses for the column type.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn scalar_kind(field: &str, value: &Value) -> Result<ValueKind> {
    match value {
        Value::String(_) => Ok(ValueKind::Text),
        Value::Number(_) => Ok(ValueKind::Number),
        Value::Bool(_) => Ok(ValueKind::Bool),
        Value::Null | Value::Array(_) | Value::Object(_) => Err(Error::FilterCompilation(format!(
            "JSON field '{field}' can only be compared with strings, numbers or booleans"
        ))),
    }
}

fn list_kind(field: &str, items: &[Value]) -> Result<ValueKind> {
    let kind = scalar_kind(field, &items[0])?;
    for item in &items[1..] {
        if scalar_kind(field, item)? != kind {
            return Err(Error::FilterCompilation(format!(
                "list for JSON field '{field}' mixes value types"
            )));
        }
    }
    Ok(kind)
}

/// A key of the JSON column, with its name bound once and referenced twice
/// when the value type is checked before casting.
struct JsonKeyRef {
    column: String,
    key: String,
}

impl JsonKeyRef {
    fn extracted(&self) -> String {
        format!("({} ->> {})", self.column, self.key)
    }

    /// Casts the key's text to `kind`. Values of another JSON type yield
    /// `NULL`, so those rows never match instead of failing the query.
    fn typed(&self, kind: ValueKind) -> String {
        let (json_type, sql_type) = match kind {
            ValueKind::Text => return self.extracted(),
            ValueKind::Number => ("number", "double precision"),
            ValueKind::Bool => ("boolean", "boolean"),
        };
        format!(
            "(CASE WHEN jsonb_typeof({}::jsonb -> {}) = '{json_type}' THEN {}::{sql_type} END)",
            self.column,
            self.key,
            self.extracted()
        )
    }
}

#[allow(clippy::cast_precision_loss)]
fn json_param(value: &Value, kind: ValueKind) -> SqlParam {
    match (kind, value) {
        (ValueKind::Number, Value::Number(n)) => SqlParam::Float(n.as_f64().unwrap_or_default()),
        (ValueKind::Bool, Value::Bool(b)) => SqlParam::Bool(*b),
        _ => SqlParam::Text(value_text(value)),
    }
}
