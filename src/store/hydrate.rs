//! Conversions between records, bound parameters and result rows.

use super::query::{bind_text, check_vector, format_vector, parse_vector};
use crate::index::ScoreOrder;
use crate::models::{EmbeddingRecord, SearchMatch};
use crate::schema::TableLayout;
use crate::{Error, Result};
use serde_json::{Map, Value};
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

/// A record validated and converted to bind values.
#[derive(Debug)]
pub(crate) struct PreparedRecord {
    pub(crate) id: Uuid,
    content: Option<String>,
    vector: String,
    declared: Vec<Option<String>>,
    /// Outer `None`: the table has no JSON column.
    json: Option<Option<Value>>,
}

impl PreparedRecord {
    /// Bind values in [`super::query::insert_statement`] placeholder order.
    pub(crate) fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(4 + self.declared.len());
        params.push(&self.id);
        params.push(&self.content);
        params.push(&self.vector);
        params.extend(self.declared.iter().map(|v| v as &(dyn ToSql + Sync)));
        if let Some(json) = &self.json {
            params.push(json);
        }
        params
    }
}

/// Validates `record` and splits its metadata between declared columns and
/// the JSON column.
///
/// Declared columns the record does not mention are written as `NULL`; the
/// JSON column is `NULL` when no undeclared keys remain.
pub(crate) fn prepare_record(
    layout: &TableLayout,
    index: usize,
    record: &EmbeddingRecord,
) -> Result<PreparedRecord> {
    check_vector(&record.embedding, layout.dimension, &format!("record {index}"))?;

    let mut declared = vec![None; layout.metadata_columns.len()];
    let mut extras = Map::new();
    for (key, value) in &record.metadata {
        match layout
            .metadata_columns
            .iter()
            .position(|column| column.name.as_str() == key)
        {
            Some(position) => {
                declared[position] = bind_text(&layout.metadata_columns[position], value);
            },
            None if layout.metadata_json_column.is_some() => {
                extras.insert(key.clone(), value.clone());
            },
            None => {
                return Err(Error::Configuration(format!(
                    "record {index}: metadata key '{key}' matches no column and the table has \
                     no JSON metadata column"
                )));
            },
        }
    }

    let json = layout
        .metadata_json_column
        .as_ref()
        .map(|_| (!extras.is_empty()).then_some(Value::Object(extras)));

    Ok(PreparedRecord {
        id: record.id_or_new(),
        content: record.content.clone(),
        vector: format_vector(&record.embedding),
        declared,
        json,
    })
}

/// Merges stored metadata: JSON blob keys first, declared columns on top.
pub(crate) fn merge_metadata(
    blob: Option<Value>,
    declared: impl IntoIterator<Item = (String, Option<Value>)>,
) -> Map<String, Value> {
    let mut metadata = match blob {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (name, value) in declared {
        metadata.insert(name, value.unwrap_or(Value::Null));
    }
    metadata
}

/// Reads a row produced by [`super::query::search_statement`].
pub(crate) fn match_from_row(row: &Row, layout: &TableLayout) -> Result<SearchMatch> {
    let decode = |e: tokio_postgres::Error| Error::query("search_decode", &e);

    let id: Uuid = row.try_get(0).map_err(decode)?;
    let content: Option<String> = row.try_get(1).map_err(decode)?;
    let vector: String = row.try_get(2).map_err(decode)?;

    let mut next = 3;
    let mut declared = Vec::with_capacity(layout.metadata_columns.len());
    for column in &layout.metadata_columns {
        let value: Option<Value> = row.try_get(next).map_err(decode)?;
        declared.push((column.name.to_string(), value));
        next += 1;
    }
    let blob: Option<Value> = if layout.metadata_json_column.is_some() {
        let blob = row.try_get(next).map_err(decode)?;
        next += 1;
        blob
    } else {
        None
    };
    let score: f64 = row.try_get(next).map_err(decode)?;

    Ok(SearchMatch {
        id,
        score,
        embedding: parse_vector(&vector)?,
        content,
        metadata: merge_metadata(blob, declared),
    })
}

/// Orders fetched matches best-first, breaking score ties by id. Ties cut
/// off by the query's `LIMIT` are never seen here.
pub(crate) fn rank_matches(matches: &mut [SearchMatch], order: ScoreOrder) {
    matches.sort_by(|a, b| {
        let by_score = match order {
            ScoreOrder::Ascending => a.score.total_cmp(&b.score),
            ScoreOrder::Descending => b.score.total_cmp(&a.score),
        };
        by_score.then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MetadataColumn, TableConfig};
    use serde_json::json;

    fn layout(with_json: bool) -> TableLayout {
        let config = TableConfig::new("docs", 2).with_metadata_columns(vec![
            MetadataColumn::new("category", "text"),
            MetadataColumn::new("page", "integer"),
        ]);
        let config = if with_json {
            config.with_metadata_json_column("metadata_json")
        } else {
            config
        };
        config.validate().unwrap()
    }

    fn matched(id: u128, score: f64) -> SearchMatch {
        SearchMatch {
            id: Uuid::from_u128(id),
            score,
            embedding: vec![],
            content: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_prepare_splits_metadata() {
        let record = EmbeddingRecord::new(vec![1.0, 2.0])
            .with_content("hello")
            .with_metadata("page", 3)
            .with_metadata("author", "ada");
        let prepared = prepare_record(&layout(true), 0, &record).unwrap();

        assert_eq!(prepared.declared, vec![None, Some("3".to_string())]);
        assert_eq!(prepared.json, Some(Some(json!({"author": "ada"}))));
        assert_eq!(prepared.vector, "[1,2]");
        assert_eq!(prepared.params().len(), 6);
    }

    #[test]
    fn test_prepare_without_extras_writes_null_json() {
        let record = EmbeddingRecord::new(vec![1.0, 2.0]).with_metadata("category", "a");
        let prepared = prepare_record(&layout(true), 0, &record).unwrap();
        assert_eq!(prepared.json, Some(None));
    }

    #[test]
    fn test_prepare_keeps_caller_id() {
        let id = Uuid::new_v4();
        let record = EmbeddingRecord::new(vec![1.0, 2.0]).with_id(id);
        let prepared = prepare_record(&layout(false), 0, &record).unwrap();
        assert_eq!(prepared.id, id);
        assert_eq!(prepared.json, None);
        assert_eq!(prepared.params().len(), 5);
    }

    #[test]
    fn test_prepare_rejects_undeclared_key_without_json_column() {
        let record = EmbeddingRecord::new(vec![1.0, 2.0]).with_metadata("author", "ada");
        let err = prepare_record(&layout(false), 7, &record).unwrap_err();
        assert!(
            matches!(err, Error::Configuration(msg) if msg.contains("record 7") && msg.contains("'author'"))
        );
    }

    #[test]
    fn test_prepare_rejects_wrong_dimension() {
        let record = EmbeddingRecord::new(vec![1.0, 2.0, 3.0]);
        let err = prepare_record(&layout(true), 2, &record).unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.starts_with("record 2")));
    }

    #[test]
    fn test_declared_columns_win_over_blob() {
        let merged = merge_metadata(
            Some(json!({"category": "from-json", "author": "ada"})),
            vec![
                ("category".to_string(), Some(json!("from-column"))),
                ("page".to_string(), None),
            ],
        );
        assert_eq!(
            Value::Object(merged),
            json!({"category": "from-column", "author": "ada", "page": null})
        );
    }

    #[test]
    fn test_merge_ignores_non_object_blob() {
        let merged = merge_metadata(Some(json!([1, 2])), vec![]);
        assert!(merged.is_empty());
        assert!(merge_metadata(None, vec![]).is_empty());
    }

    #[test]
    fn test_rank_ascending_breaks_ties_by_id() {
        let mut matches = vec![matched(3, 0.5), matched(2, 0.1), matched(1, 0.5)];
        rank_matches(&mut matches, ScoreOrder::Ascending);
        let order: Vec<u128> = matches.iter().map(|m| m.id.as_u128()).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_rank_descending() {
        let mut matches = vec![matched(1, 0.2), matched(2, 0.9), matched(3, 0.9)];
        rank_matches(&mut matches, ScoreOrder::Descending);
        let order: Vec<u128> = matches.iter().map(|m| m.id.as_u128()).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }
}
