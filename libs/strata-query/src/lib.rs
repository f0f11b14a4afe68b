#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Portable predicate language for Strata storage backends.
//!
//! Callers build a [`Query`] (or decode its JSON wire form), and every
//! backend normalizes it into a [`Predicate`] before compiling it to its own
//! query mechanism. [`Filter`] evaluates predicates in memory and defines the
//! reference semantics:
//!
//! - a path that is missing or `null` is absent, and `eq(p, null)` matches it;
//! - comparisons only hold between values of the same JSON type;
//! - `ne` and `negex` are the exact negations of `eq` and `regex`;
//! - `regex` is a case-insensitive search over string values.

pub mod error;
pub mod filter;
pub mod list;
pub mod path;
pub mod predicate;
pub mod query;
pub mod value;

pub use error::{QueryError, QueryResult};
pub use filter::Filter;
pub use list::{ListOptions, PreparedList, SortDir, SortKey};
pub use path::FieldPath;
pub use predicate::{OperandPolicy, Predicate};
pub use query::{CompareOp, Query};
pub use value::Scalar;
