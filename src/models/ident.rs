//! Validated SQL identifiers and type names.
//!
//! Table, schema and column names are always interpolated into statement
//! text; they can never be bound as parameters. [`SafeIdent`] is the only way
//! such a name reaches a statement, and it can only be built from a string
//! that passes validation.

use crate::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Maximum identifier length accepted by PostgreSQL (`NAMEDATALEN - 1`).
pub const MAX_IDENT_LEN: usize = 63;

// A pattern that fails to compile matches nothing, so validation fails closed.
static IDENT_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").ok());

static SQL_TYPE_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_ ]*(\(\d+(\s*,\s*\d+)?\))?[A-Za-z ]*(\[\])*$").ok()
});

fn matches(pattern: &LazyLock<Option<Regex>>, value: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(value))
}

/// Words that turn a type name into a column constraint.
const CONSTRAINT_WORDS: &[&str] = &[
    "check",
    "collate",
    "constraint",
    "default",
    "generated",
    "not",
    "null",
    "primary",
    "references",
    "unique",
];

/// A validated SQL identifier.
///
/// Renders double-quoted via [`SafeIdent::quoted`] so the case of the name is
/// preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafeIdent(String);

impl SafeIdent {
    /// Validates `name` as an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the name is empty, longer than
    /// [`MAX_IDENT_LEN`] bytes, or contains anything but ASCII letters,
    /// digits, `_` and `$` (with a non-digit first character).
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Configuration("identifier must not be empty".to_string()));
        }
        if name.len() > MAX_IDENT_LEN {
            return Err(Error::Configuration(format!(
                "identifier '{name}' exceeds {MAX_IDENT_LEN} bytes"
            )));
        }
        if !matches(&IDENT_PATTERN, &name) {
            return Err(Error::Configuration(format!(
                "'{name}' is not a safe SQL identifier"
            )));
        }
        Ok(Self(name))
    }

    /// Returns the raw name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the name wrapped in double quotes.
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for SafeIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SafeIdent {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Renders `"schema"."table"`.
#[must_use]
pub fn qualified(schema: &SafeIdent, table: &SafeIdent) -> String {
    format!("{}.{}", schema.quoted(), table.quoted())
}

/// A validated SQL type name such as `integer`, `varchar(20)` or `text[]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlType(String);

impl SqlType {
    /// Validates a type name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the name does not look like a plain
    /// type or carries constraint keywords.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if !matches(&SQL_TYPE_PATTERN, trimmed) {
            return Err(Error::Configuration(format!(
                "'{name}' is not a supported SQL type"
            )));
        }
        let lowered = trimmed.to_ascii_lowercase();
        if let Some(word) = lowered
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .find(|w| CONSTRAINT_WORDS.contains(w))
        {
            return Err(Error::Configuration(format!(
                "type '{name}' must not contain '{word}'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the lowercased base name without modifiers or array brackets.
    #[must_use]
    pub fn base_name(&self) -> String {
        let lowered = self.0.to_ascii_lowercase();
        let end = lowered.find(['(', '[']).unwrap_or(lowered.len());
        lowered[..end].trim().to_string()
    }

    /// Returns true for array types.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.0.ends_with("[]")
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("embedding" ; "lowercase")]
    #[test_case("Embedding_Table" ; "mixed case")]
    #[test_case("_private" ; "leading underscore")]
    #[test_case("col$1" ; "dollar")]
    fn test_valid_identifiers(name: &str) {
        let ident = SafeIdent::new(name).unwrap();
        assert_eq!(ident.as_str(), name);
        assert_eq!(ident.quoted(), format!("\"{name}\""));
    }

    #[test_case("" ; "empty")]
    #[test_case("1abc" ; "leading digit")]
    #[test_case("a b" ; "space")]
    #[test_case("users\"; DROP TABLE x; --" ; "injection")]
    #[test_case("schema.table" ; "dotted")]
    #[test_case("naïve" ; "non ascii")]
    fn test_invalid_identifiers(name: &str) {
        assert!(matches!(SafeIdent::new(name), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_identifier_length_limit() {
        assert!(SafeIdent::new("a".repeat(MAX_IDENT_LEN)).is_ok());
        assert!(SafeIdent::new("a".repeat(MAX_IDENT_LEN + 1)).is_err());
    }

    #[test]
    fn test_qualified() {
        let schema = SafeIdent::new("public").unwrap();
        let table = SafeIdent::new("Docs").unwrap();
        assert_eq!(qualified(&schema, &table), "\"public\".\"Docs\"");
    }

    #[test_case("integer", "integer" ; "plain")]
    #[test_case("character varying(20)", "character varying" ; "varchar with length")]
    #[test_case("numeric(10, 2)", "numeric" ; "numeric with scale")]
    #[test_case("timestamp(3) with time zone", "timestamp" ; "modifier before words")]
    #[test_case("text[]", "text" ; "array")]
    #[test_case(" JSONB ", "jsonb" ; "trimmed")]
    fn test_valid_sql_types(name: &str, base: &str) {
        let ty = SqlType::new(name).unwrap();
        assert_eq!(ty.base_name(), base);
    }

    #[test_case("integer; DROP TABLE x" ; "semicolon")]
    #[test_case("text DEFAULT 'x'" ; "default clause")]
    #[test_case("integer primary key" ; "primary key")]
    #[test_case("text not null" ; "not null")]
    #[test_case("" ; "empty")]
    fn test_invalid_sql_types(name: &str) {
        assert!(SqlType::new(name).is_err());
    }

    #[test]
    fn test_sql_type_is_array() {
        assert!(SqlType::new("integer[]").unwrap().is_array());
        assert!(!SqlType::new("integer").unwrap().is_array());
    }
}
