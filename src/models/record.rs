//! Embedding records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// An embedding to be written, with optional content and metadata.
///
/// Metadata keys matching a declared metadata column are written to that
/// column; any other key is written to the table's JSON metadata column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Record id. A random v4 UUID is generated when absent.
    pub id: Option<Uuid>,
    /// The embedding vector.
    pub embedding: Vec<f32>,
    /// Text the embedding was computed from.
    pub content: Option<String>,
    /// Metadata values keyed by column name or JSON key.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EmbeddingRecord {
    /// Creates a record without id, content or metadata.
    #[must_use]
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            id: None,
            embedding,
            content: None,
            metadata: Map::new(),
        }
    }

    /// Sets the record id.
    #[must_use]
    pub const fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the record id, generating one if needed.
    #[must_use]
    pub fn id_or_new(&self) -> Uuid {
        self.id.unwrap_or_else(Uuid::new_v4)
    }
}
