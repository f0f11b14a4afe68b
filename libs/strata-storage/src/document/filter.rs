//! Predicate and ordering compilation to BSON filter and sort documents.

use mongodb::bson::{Bson, Document, doc};
use strata_query::{CompareOp, Predicate, Scalar, SortDir, SortKey};

/// Compile a normalized predicate into a `find`/`count_documents` filter.
///
/// The server's type bracketing restricts range operators to values of the
/// operand's type, which matches the in-memory evaluator.
#[must_use]
pub fn compile(predicate: &Predicate) -> Document {
    match predicate {
        Predicate::Absent(path) => doc! { path.as_str(): Bson::Null },
        Predicate::Compare { path, op, value } => {
            let operand = scalar(value);
            match op {
                CompareOp::Eq => doc! { path.as_str(): operand },
                _ => doc! { path.as_str(): { operator(*op): operand } },
            }
        }
        Predicate::Regex {
            path,
            pattern,
            negated,
        } => {
            let regex = doc! { "$regex": pattern.as_str(), "$options": "i" };
            if *negated {
                doc! { path.as_str(): { "$not": regex } }
            } else {
                doc! { path.as_str(): regex }
            }
        }
        Predicate::And(children) if children.is_empty() => Document::new(),
        Predicate::And(children) => doc! { "$and": compile_all(children) },
        Predicate::Or(children) if children.is_empty() => doc! { "$nor": [{}] },
        Predicate::Or(children) => doc! { "$or": compile_all(children) },
        Predicate::Not(inner) => doc! { "$nor": [compile(inner)] },
    }
}

fn compile_all(children: &[Predicate]) -> Vec<Document> {
    children.iter().map(compile).collect()
}

fn operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "$eq",
        CompareOp::Ne => "$ne",
        CompareOp::Gt => "$gt",
        CompareOp::Lt => "$lt",
        CompareOp::Gte => "$gte",
        CompareOp::Lte => "$lte",
    }
}

/// Integers that fit `i64` stay exact; everything else is a double.
fn scalar(value: &Scalar) -> Bson {
    match value {
        Scalar::Bool(b) => Bson::Boolean(*b),
        Scalar::Number(n) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => Bson::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Scalar::String(s) => Bson::String(s.clone()),
    }
}

/// Sort document; `_id` always breaks ties.
#[must_use]
pub fn sort(order: Option<&SortKey>) -> Document {
    let mut sort = Document::new();
    if let Some(key) = order {
        let direction = match key.direction {
            SortDir::Asc => 1,
            SortDir::Desc => -1,
        };
        sort.insert(key.path.as_str(), direction);
    }
    sort.insert("_id", 1);
    sort
}
