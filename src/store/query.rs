//! Statement rendering and value binding for the store.
//!
//! Vectors travel as pgvector text (`[1,2,3]`) bound as `text` and cast
//! server-side. Declared metadata values are bound the same way and cast to
//! the column type, so a single bind type serves every column.

use crate::filter::value_text;
use crate::index::DistanceStrategy;
use crate::schema::{LayoutColumn, TableLayout};
use crate::{Error, Result, describe_db_error};
use serde_json::Value;
use std::fmt::Write as _;
use uuid::Uuid;

/// SQLSTATE class for integrity constraint violations.
const INTEGRITY_CONSTRAINT_CLASS: &str = "23";

/// Formats a vector as pgvector text: `[1,2.5,3]`.
pub(crate) fn format_vector(values: &[f32]) -> String {
    let values: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("[{}]", values.join(","))
}

/// Parses pgvector text back into a vector.
pub(crate) fn parse_vector(text: &str) -> Result<Vec<f32>> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| Error::OperationFailed {
            operation: "parse_vector".to_string(),
            cause: format!("'{text}' is not a vector literal"),
        })?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|v| {
            v.trim().parse::<f32>().map_err(|e| Error::OperationFailed {
                operation: "parse_vector".to_string(),
                cause: format!("'{v}': {e}"),
            })
        })
        .collect()
}

/// Checks a vector against the table dimension before any SQL runs.
pub(crate) fn check_vector(values: &[f32], dimension: usize, what: &str) -> Result<()> {
    if values.len() != dimension {
        return Err(Error::Configuration(format!(
            "{what} has {} dimensions, expected {dimension}",
            values.len()
        )));
    }
    if let Some(position) = values.iter().position(|v| !v.is_finite()) {
        return Err(Error::Configuration(format!(
            "{what} has a non-finite value at position {position}"
        )));
    }
    Ok(())
}

/// Renders the `INSERT` for one record.
///
/// Placeholders: `$1` id, `$2` content, `$3` vector, then one per declared
/// column, then the JSON column if the table has one.
pub(crate) fn insert_statement(layout: &TableLayout, upsert: bool) -> String {
    let columns: Vec<String> = layout
        .column_names()
        .into_iter()
        .map(|name| format!("\"{name}\""))
        .collect();

    let mut values = vec!["$1".to_string(), "$2".to_string(), "$3::text::vector".to_string()];
    let mut next = 4;
    for column in &layout.metadata_columns {
        values.push(format!("${next}::text::{}", column.data_type));
        next += 1;
    }
    if layout.metadata_json_column.is_some() {
        values.push(format!("${next}::jsonb"));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        layout.qualified_name(),
        columns.join(", "),
        values.join(", ")
    );
    if upsert {
        let updates: Vec<String> = columns
            .iter()
            .skip(1)
            .map(|column| format!("{column} = EXCLUDED.{column}"))
            .collect();
        let _ = write!(
            sql,
            " ON CONFLICT ({}) DO UPDATE SET {}",
            layout.id_column.quoted(),
            updates.join(", ")
        );
    }
    sql
}

/// Renders the ranked nearest-neighbor query.
///
/// `$1` is the query vector; the predicate's placeholders start at `$2`.
/// Result columns: id, content, vector text, each declared column as JSON,
/// the JSON column if any, and the score last.
pub(crate) fn search_statement(
    layout: &TableLayout,
    strategy: DistanceStrategy,
    predicate: Option<&str>,
    limit: usize,
) -> String {
    let embedding = layout.embedding_column.quoted();
    let mut select = vec![
        layout.id_column.quoted(),
        format!("{}::text", layout.content_column.quoted()),
        format!("{embedding}::text"),
    ];
    select.extend(
        layout
            .metadata_columns
            .iter()
            .map(|column| format!("to_jsonb({})", column.name.quoted())),
    );
    if let Some(json) = &layout.metadata_json_column {
        select.push(format!("{}::jsonb", json.quoted()));
    }
    select.push(format!(
        "{}({embedding}, $1::text::vector)",
        strategy.search_function()
    ));

    let mut sql = format!(
        "SELECT {} FROM {}",
        select.join(", "),
        layout.qualified_name()
    );
    if let Some(predicate) = predicate {
        let _ = write!(sql, " WHERE {predicate}");
    }
    let _ = write!(
        sql,
        " ORDER BY {embedding} {} $1::text::vector LIMIT {limit}",
        strategy.operator()
    );
    sql
}

/// Renders the batch delete. `$1` is a `uuid[]`.
pub(crate) fn delete_statement(layout: &TableLayout) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ANY($1)",
        layout.qualified_name(),
        layout.id_column.quoted()
    )
}

pub(crate) fn count_statement(layout: &TableLayout) -> String {
    format!("SELECT count(*) FROM {}", layout.qualified_name())
}

/// Renders a metadata value as text for a declared column.
///
/// `None` binds SQL `NULL`.
pub(crate) fn bind_text(column: &LayoutColumn, value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Array(items) if column.data_type.is_array() => Some(array_literal(items)),
        _ if matches!(column.data_type.base_name().as_str(), "json" | "jsonb") => {
            Some(value.to_string())
        },
        _ => Some(value_text(value)),
    }
}

/// Renders a PostgreSQL array literal: `{"a","b",NULL}`.
pub(crate) fn array_literal(items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Array(nested) => array_literal(nested),
            other => {
                let text = value_text(other).replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{text}\"")
            },
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

/// Maps a failed record write.
///
/// Integrity violations name the offending record; anything else is a plain
/// query failure.
pub(crate) fn write_error(
    operation: &str,
    index: usize,
    id: &Uuid,
    e: &tokio_postgres::Error,
) -> Error {
    match e.as_db_error() {
        Some(db) if db.code().code().starts_with(INTEGRITY_CONSTRAINT_CLASS) => {
            Error::ConstraintViolation {
                index,
                id: id.to_string(),
                cause: describe_db_error(e),
            }
        },
        _ => Error::query(operation, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MetadataColumn, TableConfig};
    use test_case::test_case;

    fn layout() -> TableLayout {
        TableConfig::new("docs", 3)
            .with_metadata_columns(vec![
                MetadataColumn::new("category", "text"),
                MetadataColumn::new("page", "integer"),
            ])
            .with_metadata_json_column("metadata_json")
            .validate()
            .unwrap()
    }

    #[test]
    fn test_format_vector() {
        assert_eq!(format_vector(&[1.0, 2.5, -0.125]), "[1,2.5,-0.125]");
        assert_eq!(format_vector(&[]), "[]");
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(parse_vector("[1,2.5,-0.125]").unwrap(), vec![1.0, 2.5, -0.125]);
        assert_eq!(parse_vector(" [ 1 , 2 ] ").unwrap(), vec![1.0, 2.0]);
        assert!(parse_vector("[]").unwrap().is_empty());
        assert!(parse_vector("1,2").is_err());
        assert!(parse_vector("[1,x]").is_err());
    }

    #[test]
    fn test_check_vector() {
        assert!(check_vector(&[1.0, 2.0, 3.0], 3, "query").is_ok());

        let err = check_vector(&[1.0, 2.0], 3, "query").unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("2 dimensions, expected 3")));

        let err = check_vector(&[1.0, f32::NAN, 3.0], 3, "record 4").unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.starts_with("record 4")));
    }

    #[test]
    fn test_insert_statement() {
        assert_eq!(
            insert_statement(&layout(), false),
            "INSERT INTO \"public\".\"docs\" (\"embedding_id\", \"content\", \"embedding\", \
             \"category\", \"page\", \"metadata_json\") VALUES ($1, $2, $3::text::vector, \
             $4::text::text, $5::text::integer, $6::jsonb)"
        );
    }

    #[test]
    fn test_upsert_statement_updates_every_other_column() {
        let sql = insert_statement(&layout(), true);
        assert!(sql.ends_with(
            "ON CONFLICT (\"embedding_id\") DO UPDATE SET \"content\" = EXCLUDED.\"content\", \
             \"embedding\" = EXCLUDED.\"embedding\", \"category\" = EXCLUDED.\"category\", \
             \"page\" = EXCLUDED.\"page\", \"metadata_json\" = EXCLUDED.\"metadata_json\""
        ));
    }

    #[test]
    fn test_insert_without_metadata() {
        let layout = TableConfig::new("docs", 3).validate().unwrap();
        assert_eq!(
            insert_statement(&layout, false),
            "INSERT INTO \"public\".\"docs\" (\"embedding_id\", \"content\", \"embedding\") \
             VALUES ($1, $2, $3::text::vector)"
        );
    }

    #[test]
    fn test_search_statement() {
        let sql = search_statement(
            &layout(),
            DistanceStrategy::Cosine,
            Some("(\"category\" = $2::text::text)"),
            4,
        );
        assert_eq!(
            sql,
            "SELECT \"embedding_id\", \"content\"::text, \"embedding\"::text, \
             to_jsonb(\"category\"), to_jsonb(\"page\"), \"metadata_json\"::jsonb, \
             cosine_distance(\"embedding\", $1::text::vector) FROM \"public\".\"docs\" \
             WHERE (\"category\" = $2::text::text) \
             ORDER BY \"embedding\" <=> $1::text::vector LIMIT 4"
        );
    }

    #[test_case(DistanceStrategy::Euclidean, "l2_distance", "<->")]
    #[test_case(DistanceStrategy::InnerProduct, "inner_product", "<#>")]
    #[test_case(DistanceStrategy::Manhattan, "l1_distance", "<+>")]
    fn test_search_statement_strategy(strategy: DistanceStrategy, function: &str, op: &str) {
        let sql = search_statement(&layout(), strategy, None, 10);
        assert!(sql.contains(&format!("{function}(\"embedding\", $1::text::vector)")));
        assert!(sql.ends_with(&format!("ORDER BY \"embedding\" {op} $1::text::vector LIMIT 10")));
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn test_delete_and_count() {
        assert_eq!(
            delete_statement(&layout()),
            "DELETE FROM \"public\".\"docs\" WHERE \"embedding_id\" = ANY($1)"
        );
        assert_eq!(
            count_statement(&layout()),
            "SELECT count(*) FROM \"public\".\"docs\""
        );
    }

    #[test]
    fn test_array_literal_escapes() {
        let items = vec![
            Value::from("plain"),
            Value::from("with \"quote\""),
            Value::from("back\\slash"),
            Value::Null,
            Value::from(3),
        ];
        assert_eq!(
            array_literal(&items),
            r#"{"plain","with \"quote\"","back\\slash",NULL,"3"}"#
        );
    }

    #[test]
    fn test_bind_text() {
        let layout = TableConfig::new("docs", 3)
            .with_metadata_columns(vec![
                MetadataColumn::new("tags", "text[]"),
                MetadataColumn::new("extra", "jsonb"),
                MetadataColumn::new("page", "integer"),
            ])
            .validate()
            .unwrap();
        let (tags, extra, page) = (
            &layout.metadata_columns[0],
            &layout.metadata_columns[1],
            &layout.metadata_columns[2],
        );

        assert_eq!(
            bind_text(tags, &serde_json::json!(["a", "b"])).as_deref(),
            Some(r#"{"a","b"}"#)
        );
        assert_eq!(
            bind_text(extra, &Value::from("x")).as_deref(),
            Some("\"x\"")
        );
        assert_eq!(bind_text(page, &Value::from(7)).as_deref(), Some("7"));
        assert_eq!(bind_text(page, &Value::Null), None);
    }
}
