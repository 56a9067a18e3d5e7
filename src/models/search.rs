//! Search requests, matches and per-query session options.

use crate::filter::Filter;
use crate::index::DistanceStrategy;
use crate::{Error, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use uuid::Uuid;

static SETTING_KEY_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").ok()
});

static SETTING_VALUE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(-?[0-9]+(\.[0-9]+)?|[A-Za-z_][A-Za-z0-9_]*)$").ok());

/// A similarity search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Query vector; must match the table dimension.
    pub embedding: Vec<f32>,
    /// Distance strategy used for scoring and ordering.
    pub strategy: DistanceStrategy,
    /// Maximum number of matches.
    pub limit: usize,
    /// Optional metadata filter.
    pub filter: Option<Filter>,
    /// Session settings for this query only.
    pub options: Option<QueryOptions>,
}

impl SearchRequest {
    /// Creates an unfiltered request.
    #[must_use]
    pub const fn new(embedding: Vec<f32>, strategy: DistanceStrategy, limit: usize) -> Self {
        Self {
            embedding,
            strategy,
            limit,
            filter: None,
            options: None,
        }
    }

    /// Sets the metadata filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets per-query session options.
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// A search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    /// Record id.
    pub id: Uuid,
    /// Score under the request's strategy.
    ///
    /// A distance (lower is better) for cosine, L2 and L1; the inner product
    /// (higher is better) for [`DistanceStrategy::InnerProduct`].
    pub score: f64,
    /// The stored vector.
    pub embedding: Vec<f32>,
    /// Stored content.
    pub content: Option<String>,
    /// Declared columns merged over the JSON metadata blob.
    pub metadata: Map<String, Value>,
}

/// A single `SET LOCAL` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetting {
    key: String,
    value: String,
}

impl SessionSetting {
    /// Validates a setting.
    ///
    /// Keys are plain or dotted identifiers (`hnsw.ef_search`); values are
    /// numbers or bare words. Anything else is rejected because `SET` cannot
    /// take bound parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for keys or values outside that shape.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let value = value.into();
        if !SETTING_KEY_PATTERN
            .as_ref()
            .is_some_and(|re| re.is_match(&key))
        {
            return Err(Error::Configuration(format!(
                "'{key}' is not a valid session setting name"
            )));
        }
        if !SETTING_VALUE_PATTERN
            .as_ref()
            .is_some_and(|re| re.is_match(&value))
        {
            return Err(Error::Configuration(format!(
                "'{value}' is not a valid value for {key}"
            )));
        }
        Ok(Self { key, value })
    }

    /// Returns the setting name.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the setting value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Renders the transaction-scoped statement.
    #[must_use]
    pub fn set_local_statement(&self) -> String {
        format!("SET LOCAL {} = {}", self.key, self.value)
    }
}

/// Index tuning applied for the duration of one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOptions {
    /// HNSW candidate list size during search (`hnsw.ef_search`).
    Hnsw {
        /// Size of the dynamic candidate list.
        ef_search: u32,
    },
    /// Number of IVFFlat lists probed (`ivfflat.probes`).
    IvfFlat {
        /// Lists to probe.
        probes: u32,
    },
    /// Arbitrary validated settings.
    Custom(Vec<SessionSetting>),
}

impl QueryOptions {
    /// Returns the settings to apply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a tuning value is zero.
    pub fn settings(&self) -> Result<Vec<SessionSetting>> {
        match self {
            Self::Hnsw { ef_search } => {
                positive("ef_search", *ef_search)?;
                Ok(vec![SessionSetting::new(
                    "hnsw.ef_search",
                    ef_search.to_string(),
                )?])
            },
            Self::IvfFlat { probes } => {
                positive("probes", *probes)?;
                Ok(vec![SessionSetting::new("ivfflat.probes", probes.to_string())?])
            },
            Self::Custom(settings) => Ok(settings.clone()),
        }
    }
}

fn positive(name: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(Error::Configuration(format!("{name} must be positive")));
    }
    Ok(())
}
