//! Dotted field paths into raw documents.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{QueryError, QueryResult};

/// A validated `a.b.c` path.
///
/// Segments are non-empty, never start with `$` and never contain quote
/// characters or backslashes, so every backend can inline them as literals.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse and validate a dotted path.
    ///
    /// # Errors
    /// Returns [`QueryError::EmptyPath`] for an empty string,
    /// [`QueryError::EmptySegment`] for `a..b`, `.a` or `$op` segments and
    /// [`QueryError::IllegalCharacter`] for quotes and backslashes.
    pub fn parse(raw: &str) -> QueryResult<Self> {
        if raw.is_empty() {
            return Err(QueryError::EmptyPath);
        }
        if raw.contains(['\'', '"', '\\']) {
            return Err(QueryError::IllegalCharacter(raw.to_owned()));
        }

        let segments: Vec<String> = raw.split('.').map(str::to_owned).collect();
        if segments.iter().any(|s| s.is_empty() || s.starts_with('$')) {
            return Err(QueryError::EmptySegment(raw.to_owned()));
        }

        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolve the path against a document.
    ///
    /// Returns `None` when the path is absent: a missing key, a non-object
    /// parent, or an explicit JSON `null`.
    #[must_use]
    pub fn lookup<'v>(&self, doc: &'v Map<String, Value>) -> Option<&'v Value> {
        let (first, rest) = self.segments.split_first()?;
        let mut current = doc.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        (!current.is_null()).then_some(current)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
