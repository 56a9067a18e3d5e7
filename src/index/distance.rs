//! Distance strategies and their pgvector operators.

use serde::{Deserialize, Serialize};

/// Sort direction of a strategy's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOrder {
    /// Lower scores are better (distances).
    Ascending,
    /// Higher scores are better (similarities).
    Descending,
}

/// A named metric determining the ranking function and the sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceStrategy {
    /// Cosine distance (`<=>`).
    #[default]
    Cosine,
    /// Euclidean distance (`<->`).
    Euclidean,
    /// Inner product (`<#>` orders by its negation).
    InnerProduct,
    /// Taxicab distance (`<+>`). HNSW indexes only.
    Manhattan,
}

impl DistanceStrategy {
    /// Returns the operator used in `ORDER BY`.
    ///
    /// Every operator sorts ascending best-first, which is what lets an index
    /// serve the query.
    #[must_use]
    pub const fn operator(&self) -> &'static str {
        match self {
            Self::Cosine => "<=>",
            Self::Euclidean => "<->",
            Self::InnerProduct => "<#>",
            Self::Manhattan => "<+>",
        }
    }

    /// Returns the function that computes the reported score.
    #[must_use]
    pub const fn search_function(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine_distance",
            Self::Euclidean => "l2_distance",
            Self::InnerProduct => "inner_product",
            Self::Manhattan => "l1_distance",
        }
    }

    /// Returns the operator class used when indexing for this strategy.
    #[must_use]
    pub const fn operator_class(&self) -> &'static str {
        match self {
            Self::Cosine => "vector_cosine_ops",
            Self::Euclidean => "vector_l2_ops",
            Self::InnerProduct => "vector_ip_ops",
            Self::Manhattan => "vector_l1_ops",
        }
    }

    /// Returns the natural order of the reported score.
    #[must_use]
    pub const fn score_order(&self) -> ScoreOrder {
        match self {
            Self::InnerProduct => ScoreOrder::Descending,
            Self::Cosine | Self::Euclidean | Self::Manhattan => ScoreOrder::Ascending,
        }
    }

    /// Returns the strategy as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
            Self::InnerProduct => "inner_product",
            Self::Manhattan => "manhattan",
        }
    }

    /// Parses a strategy name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Some(Self::Cosine),
            "euclidean" | "l2" => Some(Self::Euclidean),
            "inner_product" | "ip" | "dot" => Some(Self::InnerProduct),
            "manhattan" | "l1" | "taxicab" => Some(Self::Manhattan),
            _ => None,
        }
    }
}
