//! Normalized predicates: the validated tree every backend compiles.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueryError, QueryResult};
use crate::path::FieldPath;
use crate::query::{CompareOp, Query};
use crate::value::{Scalar, type_name};

/// How object and array comparison operands are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandPolicy {
    /// Rewrite the comparison to a null comparison and log a warning.
    #[default]
    Lenient,
    /// Reject the query.
    Strict,
}

impl OperandPolicy {
    #[must_use]
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            OperandPolicy::Strict
        } else {
            OperandPolicy::Lenient
        }
    }
}

/// A validated query.
///
/// Null comparisons are already folded into [`Predicate::Absent`], so
/// [`Predicate::Compare`] always carries a scalar operand.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// The path is missing or `null`.
    Absent(FieldPath),
    Compare {
        path: FieldPath,
        op: CompareOp,
        value: Scalar,
    },
    Regex {
        path: FieldPath,
        pattern: String,
        negated: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Query {
    /// Validate paths and patterns and apply the operand policy.
    ///
    /// # Errors
    /// Returns a [`QueryError`] for malformed paths, invalid patterns, null
    /// range operands, and non-scalar operands under
    /// [`OperandPolicy::Strict`].
    pub fn normalize(&self, policy: OperandPolicy) -> QueryResult<Predicate> {
        match self {
            Query::Compare { path, op, value } => normalize_compare(path, *op, value, policy),
            Query::Regex {
                path,
                pattern,
                negated,
            } => {
                let path = FieldPath::parse(path)?;
                crate::filter::build_regex(pattern).map_err(|e| QueryError::InvalidPattern {
                    path: path.to_string(),
                    message: e.to_string(),
                })?;
                Ok(Predicate::Regex {
                    path,
                    pattern: pattern.clone(),
                    negated: *negated,
                })
            }
            Query::And(queries) => Ok(Predicate::And(normalize_all(queries, policy)?)),
            Query::Or(queries) => Ok(Predicate::Or(normalize_all(queries, policy)?)),
            Query::Not(query) => Ok(Predicate::Not(Box::new(query.normalize(policy)?))),
        }
    }
}

fn normalize_all(queries: &[Query], policy: OperandPolicy) -> QueryResult<Vec<Predicate>> {
    queries.iter().map(|q| q.normalize(policy)).collect()
}

fn normalize_compare(
    raw_path: &str,
    op: CompareOp,
    value: &Value,
    policy: OperandPolicy,
) -> QueryResult<Predicate> {
    let path = FieldPath::parse(raw_path)?;

    if let Some(scalar) = Scalar::from_value(value) {
        return Ok(Predicate::Compare {
            path,
            op,
            value: scalar,
        });
    }

    if value.is_null() {
        return match op {
            CompareOp::Eq => Ok(Predicate::Absent(path)),
            CompareOp::Ne => Ok(Predicate::Not(Box::new(Predicate::Absent(path)))),
            _ => Err(QueryError::NullRangeOperand(path.to_string())),
        };
    }

    if policy == OperandPolicy::Strict {
        return Err(QueryError::NonScalarOperand {
            path: path.to_string(),
            found: type_name(value),
        });
    }

    tracing::warn!(
        path = %path,
        op = %op,
        found = type_name(value),
        "non-scalar query operand rewritten to a null comparison"
    );
    let absent = Predicate::Absent(path);
    Ok(if op == CompareOp::Ne {
        Predicate::Not(Box::new(absent))
    } else {
        absent
    })
}
