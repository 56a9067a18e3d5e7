//! Table layout and DDL rendering.
//!
//! A vector table has a fixed core (UUID id, text content, fixed-dimension
//! vector) followed by caller-declared metadata columns and an optional JSONB
//! column for undeclared keys:
//!
//! ```sql
//! CREATE TABLE "public"."documents" (
//!     "embedding_id" UUID PRIMARY KEY,
//!     "content" TEXT,
//!     "embedding" vector(768) NOT NULL,
//!     "category" text,
//!     "metadata_json" JSONB
//! )
//! ```
//!
//! [`TableConfig::validate`] turns the caller's configuration into a
//! [`TableLayout`] whose names are all [`SafeIdent`]s; every statement is
//! rendered from the layout.

use crate::models::{SafeIdent, SqlType, qualified};
use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Default schema name.
pub const DEFAULT_SCHEMA: &str = "public";
/// Default id column name.
pub const DEFAULT_ID_COLUMN: &str = "embedding_id";
/// Default content column name.
pub const DEFAULT_CONTENT_COLUMN: &str = "content";
/// Default embedding column name.
pub const DEFAULT_EMBEDDING_COLUMN: &str = "embedding";
/// Conventional name for the JSON metadata column.
pub const DEFAULT_METADATA_JSON_COLUMN: &str = "metadata_json";

/// Probes for any relation holding the table's name, including ones the
/// role has no privileges on. Binds `$1` schema, `$2` table.
pub const TABLE_EXISTS_QUERY: &str = "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_class c \
     JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2)";

/// Lists live columns with their formatted types. Binds `$1` schema, `$2`
/// table.
pub const TABLE_COLUMNS_QUERY: &str = "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
     FROM pg_attribute a \
     JOIN pg_class c ON c.oid = a.attrelid \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";

static VECTOR_TYPE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^vector\((\d+)\)$").ok());

/// A declared metadata column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataColumn {
    /// Column name.
    pub name: String,
    /// SQL type, e.g. `text`, `integer`, `varchar(20)`.
    pub data_type: String,
    /// Whether the column accepts NULL.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

const fn default_nullable() -> bool {
    true
}

impl MetadataColumn {
    /// Creates a nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }

    /// Marks the column `NOT NULL`.
    #[must_use]
    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Configuration for a vector table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name.
    pub table_name: String,
    /// Schema name.
    pub schema_name: String,
    /// Id column name.
    pub id_column: String,
    /// Content column name.
    pub content_column: String,
    /// Embedding column name.
    pub embedding_column: String,
    /// Vector dimension.
    pub vector_size: usize,
    /// Declared metadata columns, in table order.
    pub metadata_columns: Vec<MetadataColumn>,
    /// JSONB column for metadata keys without a declared column.
    pub metadata_json_column: Option<String>,
    /// Drop and recreate the table if it exists.
    ///
    /// Destructive: every row in the existing table is lost.
    pub overwrite_existing: bool,
    /// Whether records carry declared metadata. Must be true exactly when
    /// `metadata_columns` is non-empty.
    pub store_metadata: bool,
}

impl TableConfig {
    /// Creates a configuration with default column names and no metadata.
    #[must_use]
    pub fn new(table_name: impl Into<String>, vector_size: usize) -> Self {
        Self {
            table_name: table_name.into(),
            schema_name: DEFAULT_SCHEMA.to_string(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            content_column: DEFAULT_CONTENT_COLUMN.to_string(),
            embedding_column: DEFAULT_EMBEDDING_COLUMN.to_string(),
            vector_size,
            metadata_columns: Vec::new(),
            metadata_json_column: None,
            overwrite_existing: false,
            store_metadata: false,
        }
    }

    /// Sets the schema.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema_name = schema.into();
        self
    }

    /// Sets the id column name.
    #[must_use]
    pub fn with_id_column(mut self, name: impl Into<String>) -> Self {
        self.id_column = name.into();
        self
    }

    /// Sets the content column name.
    #[must_use]
    pub fn with_content_column(mut self, name: impl Into<String>) -> Self {
        self.content_column = name.into();
        self
    }

    /// Sets the embedding column name.
    #[must_use]
    pub fn with_embedding_column(mut self, name: impl Into<String>) -> Self {
        self.embedding_column = name.into();
        self
    }

    /// Declares metadata columns and enables metadata storage.
    #[must_use]
    pub fn with_metadata_columns(mut self, columns: Vec<MetadataColumn>) -> Self {
        self.store_metadata = !columns.is_empty();
        self.metadata_columns = columns;
        self
    }

    /// Sets the metadata storage flag.
    #[must_use]
    pub const fn with_store_metadata(mut self, store: bool) -> Self {
        self.store_metadata = store;
        self
    }

    /// Adds a JSONB column for undeclared metadata keys.
    #[must_use]
    pub fn with_metadata_json_column(mut self, name: impl Into<String>) -> Self {
        self.metadata_json_column = Some(name.into());
        self
    }

    /// Drops any existing table before creating this one.
    #[must_use]
    pub const fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite_existing = overwrite;
        self
    }

    /// Validates every name and the metadata flag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the dimension is zero, the metadata
    /// flag disagrees with the declared columns, a name is not a safe
    /// identifier, a type is not a plain SQL type, or two columns share a
    /// name.
    pub fn validate(&self) -> Result<TableLayout> {
        if self.vector_size == 0 {
            return Err(Error::Configuration(
                "vector dimension must be positive".to_string(),
            ));
        }
        match (self.metadata_columns.is_empty(), self.store_metadata) {
            (true, true) => {
                return Err(Error::Configuration(
                    "store_metadata is set but no metadata columns are declared".to_string(),
                ));
            },
            (false, false) => {
                return Err(Error::Configuration(
                    "metadata columns are declared but store_metadata is disabled".to_string(),
                ));
            },
            _ => {},
        }

        let layout = TableLayout {
            schema: SafeIdent::new(self.schema_name.as_str())?,
            table: SafeIdent::new(self.table_name.as_str())?,
            id_column: SafeIdent::new(self.id_column.as_str())?,
            content_column: SafeIdent::new(self.content_column.as_str())?,
            embedding_column: SafeIdent::new(self.embedding_column.as_str())?,
            dimension: self.vector_size,
            metadata_columns: self
                .metadata_columns
                .iter()
                .map(|column| {
                    Ok(LayoutColumn {
                        name: SafeIdent::new(column.name.as_str())?,
                        data_type: SqlType::new(column.data_type.as_str())?,
                        nullable: column.nullable,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            metadata_json_column: self
                .metadata_json_column
                .as_deref()
                .map(SafeIdent::new)
                .transpose()?,
        };
        layout.check_unique()?;
        Ok(layout)
    }
}

/// A validated metadata column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutColumn {
    /// Column name.
    pub name: SafeIdent,
    /// Declared type.
    pub data_type: SqlType,
    /// Whether the column accepts NULL.
    pub nullable: bool,
}

/// A validated table layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    /// Schema.
    pub schema: SafeIdent,
    /// Table.
    pub table: SafeIdent,
    /// UUID primary key column.
    pub id_column: SafeIdent,
    /// Text content column.
    pub content_column: SafeIdent,
    /// Vector column.
    pub embedding_column: SafeIdent,
    /// Vector dimension.
    pub dimension: usize,
    /// Declared metadata columns.
    pub metadata_columns: Vec<LayoutColumn>,
    /// JSONB metadata column.
    pub metadata_json_column: Option<SafeIdent>,
}

impl TableLayout {
    fn check_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for name in self.column_names() {
            if !seen.insert(name) {
                return Err(Error::Configuration(format!(
                    "column '{name}' is declared more than once"
                )));
            }
        }
        Ok(())
    }

    /// Returns every column name in table order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        let mut names = vec![
            self.id_column.as_str(),
            self.content_column.as_str(),
            self.embedding_column.as_str(),
        ];
        names.extend(self.metadata_columns.iter().map(|c| c.name.as_str()));
        if let Some(json) = &self.metadata_json_column {
            names.push(json.as_str());
        }
        names
    }

    /// Returns `"schema"."table"`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        qualified(&self.schema, &self.table)
    }

    /// Renders the `CREATE TABLE` statement.
    #[must_use]
    pub fn create_table_statement(&self) -> String {
        let mut columns = vec![
            format!("{} UUID PRIMARY KEY", self.id_column.quoted()),
            format!("{} TEXT", self.content_column.quoted()),
            format!(
                "{} vector({}) NOT NULL",
                self.embedding_column.quoted(),
                self.dimension
            ),
        ];
        columns.extend(self.metadata_columns.iter().map(|column| {
            let not_null = if column.nullable { "" } else { " NOT NULL" };
            format!("{} {}{not_null}", column.name.quoted(), column.data_type)
        }));
        if let Some(json) = &self.metadata_json_column {
            columns.push(format!("{} JSONB", json.quoted()));
        }
        format!(
            "CREATE TABLE {} ({})",
            self.qualified_name(),
            columns.join(", ")
        )
    }

    /// Renders `DROP TABLE IF EXISTS`.
    #[must_use]
    pub fn drop_table_statement(&self) -> String {
        drop_table_statement(&self.schema, &self.table)
    }
}

/// Renders `DROP TABLE IF EXISTS "schema"."table"`.
#[must_use]
pub fn drop_table_statement(schema: &SafeIdent, table: &SafeIdent) -> String {
    format!("DROP TABLE IF EXISTS {}", qualified(schema, table))
}

/// A column as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    /// Column name.
    pub name: String,
    /// Type as rendered by `format_type`, e.g. `vector(768)`, `integer`.
    pub data_type: String,
}

/// Reads the dimension from a `vector(N)` type.
#[must_use]
pub fn vector_dimension(data_type: &str) -> Option<usize> {
    VECTOR_TYPE_PATTERN
        .as_ref()?
        .captures(data_type.trim())?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}
