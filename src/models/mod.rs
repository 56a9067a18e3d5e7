//! Data models for embedstore.
//!
//! Identifiers, records, search requests and matches shared by the engine,
//! the schema manager and the store.

mod ident;
mod record;
mod search;

pub use ident::{MAX_IDENT_LEN, SafeIdent, SqlType, qualified};
pub use record::EmbeddingRecord;
pub use search::{QueryOptions, SearchMatch, SearchRequest, SessionSetting};
