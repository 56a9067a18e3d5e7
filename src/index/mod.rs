//! Vector index strategies.
//!
//! Each strategy renders the `CREATE INDEX` statement for an embedding
//! column. Distance computation and the index structures themselves live in
//! pgvector; this module only decides which statement to issue.
//!
//! | Kind | pgvector method | Parameters | Strategies |
//! |------|-----------------|------------|------------|
//! | `Hnsw` | `hnsw` | `m`, `ef_construction` | cosine, L2, inner product, L1 |
//! | `IvfFlat` | `ivfflat` | `lists` | cosine, L2, inner product |
//! | `Exact` | none | none | all (sequential scan) |

mod distance;

pub use distance::{DistanceStrategy, ScoreOrder};

use crate::models::{SafeIdent, qualified};
use crate::{Error, Result};

/// Default HNSW max connections per node.
pub const DEFAULT_HNSW_M: u32 = 16;
/// Default HNSW build-time candidate list size.
pub const DEFAULT_HNSW_EF_CONSTRUCTION: u32 = 64;
/// Default IVFFlat list count.
pub const DEFAULT_IVFFLAT_LISTS: u32 = 100;

/// Index structure and its build parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Hierarchical navigable small-world graph.
    Hnsw {
        /// Max connections per node.
        m: u32,
        /// Candidate list size while building.
        ef_construction: u32,
    },
    /// Inverted file with flat lists.
    ///
    /// Lists are trained from the rows present at build time, so the index
    /// should be created once representative data is loaded.
    IvfFlat {
        /// Number of lists.
        lists: u32,
    },
    /// No index; every search scans the table.
    Exact,
}

impl IndexKind {
    /// Returns the pgvector access method, if any.
    #[must_use]
    pub const fn method(&self) -> Option<&'static str> {
        match self {
            Self::Hnsw { .. } => Some("hnsw"),
            Self::IvfFlat { .. } => Some("ivfflat"),
            Self::Exact => None,
        }
    }

    /// Returns true if this kind can index `strategy`.
    #[must_use]
    pub const fn supports(&self, strategy: DistanceStrategy) -> bool {
        match (self, strategy) {
            (Self::IvfFlat { .. }, DistanceStrategy::Manhattan) => false,
            (
                Self::Hnsw { .. } | Self::IvfFlat { .. } | Self::Exact,
                DistanceStrategy::Cosine
                | DistanceStrategy::Euclidean
                | DistanceStrategy::InnerProduct
                | DistanceStrategy::Manhattan,
            ) => true,
        }
    }

    fn with_clause(&self) -> Result<Option<String>> {
        match *self {
            Self::Hnsw { m, ef_construction } => {
                positive("m", m)?;
                positive("ef_construction", ef_construction)?;
                Ok(Some(format!("m = {m}, ef_construction = {ef_construction}")))
            },
            Self::IvfFlat { lists } => {
                positive("lists", lists)?;
                Ok(Some(format!("lists = {lists}")))
            },
            Self::Exact => Ok(None),
        }
    }
}

fn positive(name: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(Error::Configuration(format!(
            "index parameter {name} must be positive"
        )));
    }
    Ok(())
}

/// An index descriptor for an embedding column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorIndex {
    /// Index structure.
    pub kind: IndexKind,
    /// Distance strategy the index is built for.
    pub strategy: DistanceStrategy,
    /// Explicit index name; derived from table and column when absent.
    pub name: Option<String>,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::hnsw(DistanceStrategy::Cosine)
    }
}

impl VectorIndex {
    /// HNSW with default parameters.
    #[must_use]
    pub const fn hnsw(strategy: DistanceStrategy) -> Self {
        Self {
            kind: IndexKind::Hnsw {
                m: DEFAULT_HNSW_M,
                ef_construction: DEFAULT_HNSW_EF_CONSTRUCTION,
            },
            strategy,
            name: None,
        }
    }

    /// IVFFlat with default list count.
    #[must_use]
    pub const fn ivfflat(strategy: DistanceStrategy) -> Self {
        Self {
            kind: IndexKind::IvfFlat {
                lists: DEFAULT_IVFFLAT_LISTS,
            },
            strategy,
            name: None,
        }
    }

    /// No index; searches scan the table.
    #[must_use]
    pub const fn exact(strategy: DistanceStrategy) -> Self {
        Self {
            kind: IndexKind::Exact,
            strategy,
            name: None,
        }
    }

    /// Sets the index name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replaces the build parameters.
    #[must_use]
    pub const fn with_kind(mut self, kind: IndexKind) -> Self {
        self.kind = kind;
        self
    }

    /// Returns the index name for `table`/`column`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the explicit or derived name is not
    /// a safe identifier (for example, when it exceeds 63 bytes).
    pub fn index_name(&self, table: &SafeIdent, column: &SafeIdent) -> Result<SafeIdent> {
        match &self.name {
            Some(name) => SafeIdent::new(name.clone()),
            None => {
                let kind = self.kind.method().unwrap_or("exact");
                SafeIdent::new(format!("{table}_{column}_{kind}_idx"))
            },
        }
    }

    /// Renders the `CREATE INDEX` statement, or `None` for [`IndexKind::Exact`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the strategy cannot be indexed by
    /// this kind, a parameter is zero, or the index name is invalid.
    pub fn create_index_statement(
        &self,
        schema: &SafeIdent,
        table: &SafeIdent,
        column: &SafeIdent,
    ) -> Result<Option<String>> {
        if !self.kind.supports(self.strategy) {
            return Err(Error::Configuration(format!(
                "{} indexes do not support the {} distance strategy",
                self.kind.method().unwrap_or("exact"),
                self.strategy.as_str()
            )));
        }
        let Some(method) = self.kind.method() else {
            return Ok(None);
        };
        let name = self.index_name(table, column)?;
        let statement = format!(
            "CREATE INDEX {} ON {} USING {method} ({} {})",
            name.quoted(),
            qualified(schema, table),
            column.quoted(),
            self.strategy.operator_class()
        );
        Ok(Some(match self.kind.with_clause()? {
            Some(with) => format!("{statement} WITH ({with})"),
            None => statement,
        }))
    }

    /// Renders the matching `DROP INDEX IF EXISTS` statement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the index name is invalid.
    pub fn drop_index_statement(
        &self,
        schema: &SafeIdent,
        table: &SafeIdent,
        column: &SafeIdent,
    ) -> Result<String> {
        let name = self.index_name(table, column)?;
        Ok(format!(
            "DROP INDEX IF EXISTS {}",
            qualified(schema, &name)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idents() -> (SafeIdent, SafeIdent, SafeIdent) {
        (
            SafeIdent::new("public").unwrap(),
            SafeIdent::new("docs").unwrap(),
            SafeIdent::new("embedding").unwrap(),
        )
    }

    #[test]
    fn test_default_is_hnsw_cosine() {
        let index = VectorIndex::default();
        assert_eq!(
            index.kind,
            IndexKind::Hnsw {
                m: 16,
                ef_construction: 64
            }
        );
        assert_eq!(index.strategy, DistanceStrategy::Cosine);
    }

    #[test]
    fn test_hnsw_statement() {
        let (schema, table, column) = idents();
        let sql = VectorIndex::default()
            .create_index_statement(&schema, &table, &column)
            .unwrap()
            .unwrap();
        assert_eq!(
            sql,
            "CREATE INDEX \"docs_embedding_hnsw_idx\" ON \"public\".\"docs\" USING hnsw \
             (\"embedding\" vector_cosine_ops) WITH (m = 16, ef_construction = 64)"
        );
    }

    #[test]
    fn test_ivfflat_statement() {
        let (schema, table, column) = idents();
        let sql = VectorIndex::ivfflat(DistanceStrategy::InnerProduct)
            .with_kind(IndexKind::IvfFlat { lists: 50 })
            .with_name("docs_ivf")
            .create_index_statement(&schema, &table, &column)
            .unwrap()
            .unwrap();
        assert_eq!(
            sql,
            "CREATE INDEX \"docs_ivf\" ON \"public\".\"docs\" USING ivfflat \
             (\"embedding\" vector_ip_ops) WITH (lists = 50)"
        );
    }

    #[test]
    fn test_exact_renders_nothing() {
        let (schema, table, column) = idents();
        let sql = VectorIndex::exact(DistanceStrategy::Euclidean)
            .create_index_statement(&schema, &table, &column)
            .unwrap();
        assert!(sql.is_none());
    }

    #[test]
    fn test_unsupported_combination_fails() {
        let (schema, table, column) = idents();
        let err = VectorIndex::ivfflat(DistanceStrategy::Manhattan)
            .create_index_statement(&schema, &table, &column)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("manhattan")));
    }

    #[test]
    fn test_hnsw_supports_manhattan() {
        let (schema, table, column) = idents();
        let sql = VectorIndex::hnsw(DistanceStrategy::Manhattan)
            .create_index_statement(&schema, &table, &column)
            .unwrap()
            .unwrap();
        assert!(sql.contains("vector_l1_ops"));
    }

    #[test]
    fn test_zero_parameters_rejected() {
        let (schema, table, column) = idents();
        let index = VectorIndex::default().with_kind(IndexKind::Hnsw {
            m: 0,
            ef_construction: 64,
        });
        assert!(index.create_index_statement(&schema, &table, &column).is_err());

        let index = VectorIndex::ivfflat(DistanceStrategy::Cosine)
            .with_kind(IndexKind::IvfFlat { lists: 0 });
        assert!(index.create_index_statement(&schema, &table, &column).is_err());
    }

    #[test]
    fn test_unsafe_index_name_rejected() {
        let (schema, table, column) = idents();
        let index = VectorIndex::default().with_name("idx; DROP TABLE docs");
        assert!(index.create_index_statement(&schema, &table, &column).is_err());
    }

    #[test]
    fn test_derived_name_too_long() {
        let schema = SafeIdent::new("public").unwrap();
        let table = SafeIdent::new("t".repeat(40)).unwrap();
        let column = SafeIdent::new("c".repeat(20)).unwrap();
        assert!(VectorIndex::default().index_name(&table, &column).is_err());
        assert!(
            VectorIndex::default()
                .with_name("short_idx")
                .create_index_statement(&schema, &table, &column)
                .is_ok()
        );
    }

    #[test]
    fn test_drop_statement() {
        let (schema, table, column) = idents();
        assert_eq!(
            VectorIndex::default()
                .drop_index_statement(&schema, &table, &column)
                .unwrap(),
            "DROP INDEX IF EXISTS \"public\".\"docs_embedding_hnsw_idx\""
        );
    }
}
