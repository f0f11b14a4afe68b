//! The user-facing query tree and its JSON wire form.
//!
//! A [`Query`] is built with the constructors below (or decoded from JSON)
//! and is not validated until [`Query::normalize`] turns it into a
//! [`Predicate`](crate::Predicate).
//!
//! Wire form:
//!
//! ```text
//! {"path": "owner.email", "op": "eq", "value": "a@b.c"}   // "op" defaults to "eq"
//! {"path": "name", "op": "regex", "value": "^jo"}
//! {"op": "and", "queries": [ ... ]}
//! {"op": "not", "query": { ... }}
//! ```

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::QueryError;

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl CompareOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Lt => "lt",
            CompareOp::Gte => "gte",
            CompareOp::Lte => "lte",
        }
    }

    /// True for `gt`, `lt`, `gte` and `lte`.
    #[must_use]
    pub fn is_range(self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::Ne)
    }

    fn from_wire(op: &str) -> Option<Self> {
        Some(match op {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "lt" => CompareOp::Lt,
            "gte" => CompareOp::Gte,
            "lte" => CompareOp::Lte,
            _ => return None,
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A portable predicate over raw documents.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "WireQuery")]
pub enum Query {
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    Regex {
        path: String,
        pattern: String,
        negated: bool,
    },
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
}

impl Query {
    #[must_use]
    pub fn compare(path: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Query::Compare {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    #[must_use]
    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ne, value)
    }

    #[must_use]
    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Gt, value)
    }

    #[must_use]
    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Lt, value)
    }

    #[must_use]
    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Gte, value)
    }

    #[must_use]
    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Lte, value)
    }

    /// Case-insensitive search of `pattern` in the string at `path`.
    #[must_use]
    pub fn regex(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Query::Regex {
            path: path.into(),
            pattern: pattern.into(),
            negated: false,
        }
    }

    /// Negation of [`Query::regex`]; also matches absent and non-string values.
    #[must_use]
    pub fn negex(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Query::Regex {
            path: path.into(),
            pattern: pattern.into(),
            negated: true,
        }
    }

    /// Conjunction; an empty list matches everything.
    #[must_use]
    pub fn and(queries: impl IntoIterator<Item = Query>) -> Self {
        Query::And(queries.into_iter().collect())
    }

    /// Disjunction; an empty list matches nothing.
    #[must_use]
    pub fn or(queries: impl IntoIterator<Item = Query>) -> Self {
        Query::Or(queries.into_iter().collect())
    }

    #[must_use]
    pub fn not(query: Query) -> Self {
        !query
    }
}

impl std::ops::Not for Query {
    type Output = Query;

    fn not(self) -> Self::Output {
        Query::Not(Box::new(self))
    }
}

impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Query::Compare { path, op, value } => {
                map.serialize_entry("path", path)?;
                map.serialize_entry("op", op.as_str())?;
                map.serialize_entry("value", value)?;
            }
            Query::Regex {
                path,
                pattern,
                negated,
            } => {
                map.serialize_entry("path", path)?;
                map.serialize_entry("op", if *negated { "negex" } else { "regex" })?;
                map.serialize_entry("value", pattern)?;
            }
            Query::And(queries) => {
                map.serialize_entry("op", "and")?;
                map.serialize_entry("queries", queries)?;
            }
            Query::Or(queries) => {
                map.serialize_entry("op", "or")?;
                map.serialize_entry("queries", queries)?;
            }
            Query::Not(query) => {
                map.serialize_entry("op", "not")?;
                map.serialize_entry("query", query)?;
            }
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct WireQuery {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    queries: Option<Vec<Query>>,
    #[serde(default)]
    query: Option<Box<Query>>,
}

impl TryFrom<WireQuery> for Query {
    type Error = QueryError;

    fn try_from(wire: WireQuery) -> Result<Self, Self::Error> {
        let op = wire.op.as_deref().unwrap_or("eq");
        match op {
            "and" | "or" => {
                let queries = wire.queries.ok_or(QueryError::MissingField("queries"))?;
                Ok(if op == "and" {
                    Query::And(queries)
                } else {
                    Query::Or(queries)
                })
            }
            "not" => {
                let query = wire.query.ok_or(QueryError::MissingField("query"))?;
                Ok(Query::Not(query))
            }
            "regex" | "negex" => {
                let path = wire.path.ok_or(QueryError::MissingField("path"))?;
                let Value::String(pattern) = wire.value else {
                    return Err(QueryError::InvalidPattern {
                        path,
                        message: "pattern must be a string".to_owned(),
                    });
                };
                Ok(Query::Regex {
                    path,
                    pattern,
                    negated: op == "negex",
                })
            }
            other => {
                let op = CompareOp::from_wire(other)
                    .ok_or_else(|| QueryError::UnknownOperator(other.to_owned()))?;
                let path = wire.path.ok_or(QueryError::MissingField("path"))?;
                Ok(Query::Compare {
                    path,
                    op,
                    value: wire.value,
                })
            }
        }
    }
}
