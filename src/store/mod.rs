//! Writes, deletes and ranked similarity search over a vector table.
//!
//! An [`EmbeddingStore`] is opened against an existing table. Its layout is
//! read from the catalog once, at open; every later statement is rendered
//! from that layout.
//!
//! Each call uses one pooled connection and one transaction:
//!
//! - `add_all`/`upsert_all` commit every record or none
//! - `search` applies its [`QueryOptions`] with `SET LOCAL`, so they revert
//!   when the transaction ends and never leak to other pool users

mod hydrate;
mod query;

use crate::engine::Engine;
use crate::filter::{FilterContext, compile};
use crate::models::{EmbeddingRecord, QueryOptions, SafeIdent, SearchMatch, SearchRequest, SqlType, qualified};
use crate::observability::record_operation;
use crate::schema::{
    DEFAULT_CONTENT_COLUMN, DEFAULT_EMBEDDING_COLUMN, DEFAULT_ID_COLUMN, DEFAULT_SCHEMA,
    LayoutColumn, TableColumn, TableConfig, TableLayout, vector_dimension,
};
use crate::{Error, Result};
use hydrate::{match_from_row, prepare_record, rank_matches};
use std::sync::Arc;
use std::time::Instant;
use tokio_postgres::types::ToSql;
use tracing::instrument;
use uuid::Uuid;

/// Which table a store reads and writes, and how its columns are used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Table name.
    pub table_name: String,
    /// Schema name.
    pub schema_name: String,
    /// UUID primary key column.
    pub id_column: String,
    /// Text content column.
    pub content_column: String,
    /// `vector(N)` column.
    pub embedding_column: String,
    /// Declared metadata columns. `None` uses every other column not listed
    /// in `ignore_metadata_columns`.
    pub metadata_columns: Option<Vec<String>>,
    /// Columns excluded when metadata columns are discovered.
    pub ignore_metadata_columns: Vec<String>,
    /// JSON column holding undeclared metadata keys.
    pub metadata_json_column: Option<String>,
    /// Session options for searches that carry none.
    pub default_options: Option<QueryOptions>,
}

impl StoreConfig {
    /// Creates a configuration with default column names and no JSON column.
    #[must_use]
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            schema_name: DEFAULT_SCHEMA.to_string(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            content_column: DEFAULT_CONTENT_COLUMN.to_string(),
            embedding_column: DEFAULT_EMBEDDING_COLUMN.to_string(),
            metadata_columns: None,
            ignore_metadata_columns: Vec::new(),
            metadata_json_column: None,
            default_options: None,
        }
    }

    /// Mirrors the names of a table created from `config`.
    #[must_use]
    pub fn from_table_config(config: &TableConfig) -> Self {
        Self {
            table_name: config.table_name.clone(),
            schema_name: config.schema_name.clone(),
            id_column: config.id_column.clone(),
            content_column: config.content_column.clone(),
            embedding_column: config.embedding_column.clone(),
            metadata_columns: Some(
                config
                    .metadata_columns
                    .iter()
                    .map(|c| c.name.clone())
                    .collect(),
            ),
            ignore_metadata_columns: Vec::new(),
            metadata_json_column: config.metadata_json_column.clone(),
            default_options: None,
        }
    }

    /// Sets the schema.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema_name = schema.into();
        self
    }

    /// Sets the id column.
    #[must_use]
    pub fn with_id_column(mut self, name: impl Into<String>) -> Self {
        self.id_column = name.into();
        self
    }

    /// Sets the content column.
    #[must_use]
    pub fn with_content_column(mut self, name: impl Into<String>) -> Self {
        self.content_column = name.into();
        self
    }

    /// Sets the embedding column.
    #[must_use]
    pub fn with_embedding_column(mut self, name: impl Into<String>) -> Self {
        self.embedding_column = name.into();
        self
    }

    /// Declares the metadata columns explicitly.
    #[must_use]
    pub fn with_metadata_columns<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.metadata_columns = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Excludes columns from metadata discovery.
    #[must_use]
    pub fn with_ignore_metadata_columns<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.ignore_metadata_columns = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the JSON metadata column.
    #[must_use]
    pub fn with_metadata_json_column(mut self, name: impl Into<String>) -> Self {
        self.metadata_json_column = Some(name.into());
        self
    }

    /// Sets the session options applied to searches without their own.
    #[must_use]
    pub fn with_default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = Some(options);
        self
    }
}

fn find_column<'a>(columns: &'a [TableColumn], column: &str, table: &str) -> Result<&'a TableColumn> {
    columns
        .iter()
        .find(|c| c.name == column)
        .ok_or_else(|| Error::Configuration(format!("column '{column}' not found in {table}")))
}

/// Resolves a store layout from catalog columns.
fn resolve_layout(config: &StoreConfig, columns: &[TableColumn]) -> Result<TableLayout> {
    let schema = SafeIdent::new(config.schema_name.as_str())?;
    let table = SafeIdent::new(config.table_name.as_str())?;
    let name = qualified(&schema, &table);
    if columns.is_empty() {
        return Err(Error::Configuration(format!("table {name} does not exist")));
    }

    let find = |column: &str| find_column(columns, column, &name);

    let id = find(&config.id_column)?;
    if id.data_type != "uuid" {
        return Err(Error::Configuration(format!(
            "id column '{}' has type {}, expected uuid",
            id.name, id.data_type
        )));
    }
    let content = find(&config.content_column)?;
    let embedding = find(&config.embedding_column)?;
    let dimension = vector_dimension(&embedding.data_type).ok_or_else(|| {
        Error::Configuration(format!(
            "embedding column '{}' has type {}, expected vector(N)",
            embedding.name, embedding.data_type
        ))
    })?;
    let json = match config.metadata_json_column.as_deref() {
        Some(json) => {
            let column = find(json)?;
            if !matches!(column.data_type.as_str(), "json" | "jsonb") {
                return Err(Error::Configuration(format!(
                    "metadata JSON column '{json}' has type {}, expected json or jsonb",
                    column.data_type
                )));
            }
            Some(SafeIdent::new(json)?)
        },
        None => None,
    };

    let mut reserved = vec![id.name.as_str(), content.name.as_str(), embedding.name.as_str()];
    reserved.extend(config.metadata_json_column.as_deref());

    let metadata: Vec<&TableColumn> = match &config.metadata_columns {
        Some(_) if !config.ignore_metadata_columns.is_empty() => {
            return Err(Error::Configuration(
                "metadata_columns and ignore_metadata_columns cannot both be set".to_string(),
            ));
        },
        Some(names) => {
            let mut selected: Vec<&TableColumn> = Vec::with_capacity(names.len());
            for column in names {
                if reserved.contains(&column.as_str()) {
                    return Err(Error::Configuration(format!(
                        "'{column}' is not a metadata column"
                    )));
                }
                if selected.iter().any(|c| &c.name == column) {
                    return Err(Error::Configuration(format!(
                        "metadata column '{column}' is listed more than once"
                    )));
                }
                selected.push(find(column)?);
            }
            selected
        },
        None => columns
            .iter()
            .filter(|c| {
                !reserved.contains(&c.name.as_str()) && !config.ignore_metadata_columns.contains(&c.name)
            })
            .collect(),
    };

    let metadata_columns = metadata
        .into_iter()
        .map(|c| {
            Ok(LayoutColumn {
                name: SafeIdent::new(c.name.as_str())?,
                data_type: SqlType::new(c.data_type.as_str())?,
                nullable: true,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TableLayout {
        schema,
        table,
        id_column: SafeIdent::new(id.name.as_str())?,
        content_column: SafeIdent::new(content.name.as_str())?,
        embedding_column: SafeIdent::new(embedding.name.as_str())?,
        dimension,
        metadata_columns,
        metadata_json_column: json,
    })
}

/// Prepared statements and layout shared by clones of a store.
#[derive(Debug)]
struct StoreInner {
    layout: TableLayout,
    filter_context: FilterContext,
    default_options: Option<QueryOptions>,
    insert_sql: String,
    upsert_sql: String,
    delete_sql: String,
    count_sql: String,
}

/// A vector table opened for reads and writes.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    engine: Engine,
    inner: Arc<StoreInner>,
}

impl EmbeddingStore {
    /// Opens `config`'s table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the table or a configured column
    /// is missing, the embedding column is not `vector(N)`, or a name is not
    /// a safe identifier; connectivity or operation errors otherwise.
    #[instrument(skip(engine, config), fields(table = %config.table_name, schema = %config.schema_name))]
    pub async fn open(engine: Engine, config: StoreConfig) -> Result<Self> {
        let columns = engine
            .table_columns(&config.schema_name, &config.table_name)
            .await?;
        let layout = resolve_layout(&config, &columns)?;
        tracing::info!(
            table = %layout.qualified_name(),
            dimension = layout.dimension,
            metadata_columns = layout.metadata_columns.len(),
            "Opened embedding store"
        );
        Ok(Self::with_layout(engine, layout, config.default_options))
    }

    fn with_layout(engine: Engine, layout: TableLayout, default_options: Option<QueryOptions>) -> Self {
        let filter_context = FilterContext::new(
            layout
                .metadata_columns
                .iter()
                .map(|c| (c.name.clone(), c.data_type.clone()))
                .collect(),
            layout.metadata_json_column.clone(),
        );
        let inner = StoreInner {
            insert_sql: query::insert_statement(&layout, false),
            upsert_sql: query::insert_statement(&layout, true),
            delete_sql: query::delete_statement(&layout),
            count_sql: query::count_statement(&layout),
            layout,
            filter_context,
            default_options,
        };
        Self {
            engine,
            inner: Arc::new(inner),
        }
    }

    /// Returns the resolved table layout.
    #[must_use]
    pub fn layout(&self) -> &TableLayout {
        &self.inner.layout
    }

    /// Returns the embedding dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.inner.layout.dimension
    }

    /// Adds one record and returns its id.
    ///
    /// # Errors
    ///
    /// See [`EmbeddingStore::add_all`].
    pub async fn add(&self, record: EmbeddingRecord) -> Result<Uuid> {
        let ids = self.add_all(std::slice::from_ref(&record)).await?;
        ids.into_iter().next().ok_or_else(|| Error::OperationFailed {
            operation: "add".to_string(),
            cause: "no id returned".to_string(),
        })
    }

    /// Adds records in one transaction and returns their ids in input order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] before any SQL if a record has the
    /// wrong dimension or an undeclared metadata key the table cannot hold,
    /// and [`Error::ConstraintViolation`] if a record breaks a table
    /// constraint (a duplicate id, for one). Nothing is written on error.
    #[instrument(skip(self, records), fields(table = %self.inner.layout.table, count = records.len()))]
    pub async fn add_all(&self, records: &[EmbeddingRecord]) -> Result<Vec<Uuid>> {
        let started = Instant::now();
        let result = self.write("add", &self.inner.insert_sql, records).await;
        record_operation("add", started, &result);
        result
    }

    /// Inserts records or replaces those whose id already exists.
    ///
    /// # Errors
    ///
    /// As [`EmbeddingStore::add_all`], except that existing ids are not a
    /// violation.
    #[instrument(skip(self, records), fields(table = %self.inner.layout.table, count = records.len()))]
    pub async fn upsert_all(&self, records: &[EmbeddingRecord]) -> Result<Vec<Uuid>> {
        let started = Instant::now();
        let result = self.write("upsert", &self.inner.upsert_sql, records).await;
        record_operation("upsert", started, &result);
        result
    }

    async fn write(
        &self,
        operation: &'static str,
        sql: &str,
        records: &[EmbeddingRecord],
    ) -> Result<Vec<Uuid>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let prepared = records
            .iter()
            .enumerate()
            .map(|(index, record)| prepare_record(&self.inner.layout, index, record))
            .collect::<Result<Vec<_>>>()?;

        let mut client = self.engine.acquire().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| Error::query(operation, &e))?;
        let statement = tx
            .prepare(sql)
            .await
            .map_err(|e| Error::query(operation, &e))?;
        for (index, record) in prepared.iter().enumerate() {
            tx.execute(&statement, &record.params())
                .await
                .map_err(|e| query::write_error(operation, index, &record.id, &e))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::query(operation, &e))?;

        tracing::debug!(records = prepared.len(), "Records written");
        Ok(prepared.into_iter().map(|record| record.id).collect())
    }

    /// Deletes one record. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a connectivity or operation error.
    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        Ok(self.remove_all(&[id]).await? > 0)
    }

    /// Deletes records by id and returns how many existed.
    ///
    /// Unknown ids are ignored. An empty list does nothing.
    ///
    /// # Errors
    ///
    /// Returns a connectivity or operation error.
    #[instrument(skip(self, ids), fields(table = %self.inner.layout.table, count = ids.len()))]
    pub async fn remove_all(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let result = async {
            let client = self.engine.acquire().await?;
            client
                .execute(&self.inner.delete_sql, &[&ids])
                .await
                .map_err(|e| Error::query("remove", &e))
        }
        .await;
        record_operation("remove", started, &result);
        result
    }

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// Returns a connectivity or operation error.
    pub async fn count(&self) -> Result<u64> {
        let client = self.engine.acquire().await?;
        let row = client
            .query_one(&self.inner.count_sql, &[])
            .await
            .map_err(|e| Error::query("count", &e))?;
        let count: i64 = row.get(0);
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Returns the nearest records to the request's vector, best first.
    ///
    /// Scores use the request's strategy. Matches with equal scores are
    /// ordered by id, but which of several rows tied at the limit are
    /// returned is up to the server's scan order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a vector of the wrong dimension,
    /// a zero limit or invalid options, and [`Error::FilterCompilation`] for
    /// an invalid filter. Both are raised before any SQL runs.
    #[instrument(
        skip(self, request),
        fields(table = %self.inner.layout.table, strategy = request.strategy.as_str(), limit = request.limit)
    )]
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchMatch>> {
        let started = Instant::now();
        let result = self.search_inner(request).await;
        record_operation("search", started, &result);
        result
    }

    async fn search_inner(&self, request: &SearchRequest) -> Result<Vec<SearchMatch>> {
        let layout = &self.inner.layout;
        query::check_vector(&request.embedding, layout.dimension, "query vector")?;
        if request.limit == 0 {
            return Err(Error::Configuration("limit must be positive".to_string()));
        }

        let compiled = request
            .filter
            .as_ref()
            .filter(|filter| !filter.is_empty())
            .map(|filter| compile(filter, &self.inner.filter_context, 2))
            .transpose()?;
        let settings = request
            .options
            .as_ref()
            .or(self.inner.default_options.as_ref())
            .map(QueryOptions::settings)
            .transpose()?
            .unwrap_or_default();

        let sql = query::search_statement(
            layout,
            request.strategy,
            compiled.as_ref().map(|c| c.clause.as_str()),
            request.limit,
        );
        let vector = query::format_vector(&request.embedding);
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        params.push(&vector);
        if let Some(compiled) = &compiled {
            params.extend(compiled.params.iter().map(|p| p.as_sql()));
        }

        let mut client = self.engine.acquire().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| Error::query("search", &e))?;
        for setting in &settings {
            tx.batch_execute(&setting.set_local_statement())
                .await
                .map_err(|e| Error::query("search_options", &e))?;
        }
        let rows = tx
            .query(&sql, &params)
            .await
            .map_err(|e| Error::query("search", &e))?;
        tx.commit()
            .await
            .map_err(|e| Error::query("search", &e))?;

        let mut matches = rows
            .iter()
            .map(|row| match_from_row(row, layout))
            .collect::<Result<Vec<_>>>()?;
        rank_matches(&mut matches, request.strategy.score_order());
        tracing::debug!(matches = matches.len(), "Search complete");
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::filter::Filter;
    use crate::index::DistanceStrategy;
    use crate::schema::MetadataColumn;
    use std::time::Duration;

    fn columns() -> Vec<TableColumn> {
        [
            ("embedding_id", "uuid"),
            ("content", "text"),
            ("embedding", "vector(3)"),
            ("category", "text"),
            ("page", "integer"),
            ("internal", "timestamp with time zone"),
            ("metadata_json", "jsonb"),
        ]
        .into_iter()
        .map(|(name, data_type)| TableColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
        })
        .collect()
    }

    fn names(layout: &TableLayout) -> Vec<&str> {
        layout.metadata_columns.iter().map(|c| c.name.as_str()).collect()
    }

    async fn offline_store() -> EmbeddingStore {
        let config = EngineConfig::new("127.0.0.1", "vectors")
            .with_password_auth("app", "pw")
            .with_pool_timeout(Duration::from_secs(1));
        let engine = Engine::connect(EngineConfig { port: 1, ..config }).await.unwrap();
        let layout = TableConfig::new("docs", 3)
            .with_metadata_columns(vec![MetadataColumn::new("category", "text")])
            .validate()
            .unwrap();
        EmbeddingStore::with_layout(engine, layout, None)
    }

    #[test]
    fn test_discovers_metadata_columns() {
        let config = StoreConfig::new("docs").with_metadata_json_column("metadata_json");
        let layout = resolve_layout(&config, &columns()).unwrap();
        assert_eq!(layout.dimension, 3);
        assert_eq!(names(&layout), vec!["category", "page", "internal"]);
        assert_eq!(
            layout.metadata_json_column.as_ref().map(SafeIdent::as_str),
            Some("metadata_json")
        );
    }

    #[test]
    fn test_discovery_without_json_column_treats_it_as_metadata() {
        let layout = resolve_layout(&StoreConfig::new("docs"), &columns()).unwrap();
        assert_eq!(
            names(&layout),
            vec!["category", "page", "internal", "metadata_json"]
        );
    }

    #[test]
    fn test_ignore_metadata_columns() {
        let config = StoreConfig::new("docs")
            .with_metadata_json_column("metadata_json")
            .with_ignore_metadata_columns(["internal"]);
        let layout = resolve_layout(&config, &columns()).unwrap();
        assert_eq!(names(&layout), vec!["category", "page"]);
    }

    #[test]
    fn test_explicit_metadata_columns() {
        let config = StoreConfig::new("docs").with_metadata_columns(["page"]);
        let layout = resolve_layout(&config, &columns()).unwrap();
        assert_eq!(names(&layout), vec!["page"]);
        assert_eq!(layout.metadata_columns[0].data_type.as_str(), "integer");
    }

    #[test]
    fn test_missing_table_or_column() {
        let err = resolve_layout(&StoreConfig::new("docs"), &[]).unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("does not exist")));

        let config = StoreConfig::new("docs").with_metadata_columns(["missing"]);
        let err = resolve_layout(&config, &columns()).unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("'missing'")));
    }

    #[test]
    fn test_rejects_bad_column_types() {
        let config = StoreConfig::new("docs").with_embedding_column("content");
        assert!(resolve_layout(&config, &columns()).is_err());

        let config = StoreConfig::new("docs").with_id_column("page");
        assert!(resolve_layout(&config, &columns()).is_err());

        let config = StoreConfig::new("docs").with_metadata_json_column("category");
        assert!(resolve_layout(&config, &columns()).is_err());
    }

    #[test]
    fn test_conflicting_metadata_selection() {
        let config = StoreConfig::new("docs")
            .with_metadata_columns(["page"])
            .with_ignore_metadata_columns(["internal"]);
        assert!(matches!(
            resolve_layout(&config, &columns()),
            Err(Error::Configuration(_))
        ));

        let config = StoreConfig::new("docs").with_metadata_columns(["page", "page"]);
        assert!(resolve_layout(&config, &columns()).is_err());

        let config = StoreConfig::new("docs").with_metadata_columns(["embedding"]);
        assert!(resolve_layout(&config, &columns()).is_err());
    }

    #[test]
    fn test_from_table_config() {
        let table = TableConfig::new("docs", 3)
            .with_schema("vectors")
            .with_metadata_columns(vec![MetadataColumn::new("category", "text")])
            .with_metadata_json_column("metadata_json");
        let config = StoreConfig::from_table_config(&table);
        assert_eq!(config.schema_name, "vectors");
        assert_eq!(config.metadata_columns, Some(vec!["category".to_string()]));
        assert_eq!(config.metadata_json_column.as_deref(), Some("metadata_json"));
    }

    #[tokio::test]
    async fn test_search_rejects_wrong_dimension_before_io() {
        let store = offline_store().await;
        let err = store
            .search(&SearchRequest::new(vec![1.0, 2.0], DistanceStrategy::Cosine, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_search_rejects_zero_limit_and_bad_filter_before_io() {
        let store = offline_store().await;
        let request = SearchRequest::new(vec![1.0, 2.0, 3.0], DistanceStrategy::Cosine, 0);
        assert!(matches!(
            store.search(&request).await,
            Err(Error::Configuration(_))
        ));

        let request = SearchRequest::new(vec![1.0, 2.0, 3.0], DistanceStrategy::Cosine, 4)
            .with_filter(Filter::eq("unknown", 1));
        assert!(matches!(
            store.search(&request).await,
            Err(Error::FilterCompilation(msg)) if msg.contains("unknown")
        ));
    }

    #[tokio::test]
    async fn test_writes_validate_before_io() {
        let store = offline_store().await;
        assert!(store.add_all(&[]).await.unwrap().is_empty());
        assert_eq!(store.remove_all(&[]).await.unwrap(), 0);

        let records = vec![
            EmbeddingRecord::new(vec![1.0, 2.0, 3.0]),
            EmbeddingRecord::new(vec![1.0, 2.0, 3.0]).with_metadata("author", "ada"),
        ];
        let err = store.add_all(&records).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.starts_with("record 1")));
    }

    #[tokio::test]
    async fn test_valid_write_reaches_the_pool() {
        let store = offline_store().await;
        let err = store
            .add(EmbeddingRecord::new(vec![1.0, 2.0, 3.0]).with_metadata("category", "a"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_store_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EmbeddingStore>();
        assert_send_sync::<Engine>();
    }
}
