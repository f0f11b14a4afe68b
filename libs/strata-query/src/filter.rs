//! In-memory predicate evaluation.
//!
//! This is the reference behavior the document and relational compilers are
//! tested against.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use crate::error::{QueryError, QueryResult};
use crate::path::FieldPath;
use crate::predicate::Predicate;
use crate::query::CompareOp;
use crate::value::Scalar;

pub(crate) fn build_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

#[derive(Debug)]
enum Node {
    Absent(FieldPath),
    Compare {
        path: FieldPath,
        op: CompareOp,
        value: Scalar,
    },
    Regex {
        path: FieldPath,
        regex: Regex,
        negated: bool,
    },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

/// A predicate with its patterns compiled, ready to test many documents.
#[derive(Debug)]
pub struct Filter {
    root: Node,
}

impl Filter {
    /// # Errors
    /// Returns [`QueryError::InvalidPattern`] if a pattern does not compile.
    pub fn compile(predicate: &Predicate) -> QueryResult<Self> {
        Ok(Self {
            root: compile_node(predicate)?,
        })
    }

    #[must_use]
    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        eval(&self.root, doc)
    }
}

fn compile_node(predicate: &Predicate) -> QueryResult<Node> {
    Ok(match predicate {
        Predicate::Absent(path) => Node::Absent(path.clone()),
        Predicate::Compare { path, op, value } => Node::Compare {
            path: path.clone(),
            op: *op,
            value: value.clone(),
        },
        Predicate::Regex {
            path,
            pattern,
            negated,
        } => Node::Regex {
            path: path.clone(),
            regex: build_regex(pattern).map_err(|e| QueryError::InvalidPattern {
                path: path.to_string(),
                message: e.to_string(),
            })?,
            negated: *negated,
        },
        Predicate::And(children) => Node::And(compile_children(children)?),
        Predicate::Or(children) => Node::Or(compile_children(children)?),
        Predicate::Not(inner) => Node::Not(Box::new(compile_node(inner)?)),
    })
}

fn compile_children(children: &[Predicate]) -> QueryResult<Vec<Node>> {
    children.iter().map(compile_node).collect()
}

fn eval(node: &Node, doc: &Map<String, Value>) -> bool {
    match node {
        Node::Absent(path) => path.lookup(doc).is_none(),
        Node::Compare { path, op, value } => {
            let ordering = path.lookup(doc).and_then(|v| value.compare_stored(v));
            compare_holds(*op, ordering)
        }
        Node::Regex {
            path,
            regex,
            negated,
        } => {
            let hit = path
                .lookup(doc)
                .and_then(Value::as_str)
                .is_some_and(|s| regex.is_match(s));
            hit != *negated
        }
        Node::And(children) => children.iter().all(|c| eval(c, doc)),
        Node::Or(children) => children.iter().any(|c| eval(c, doc)),
        Node::Not(inner) => !eval(inner, doc),
    }
}

fn compare_holds(op: CompareOp, ordering: Option<Ordering>) -> bool {
    match op {
        CompareOp::Eq => ordering == Some(Ordering::Equal),
        CompareOp::Ne => ordering != Some(Ordering::Equal),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Gte => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lte => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}
