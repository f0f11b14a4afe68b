//! Per-call list options: filter, order and window.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueryResult;
use crate::path::FieldPath;
use crate::predicate::{OperandPolicy, Predicate};
use crate::query::Query;
use crate::value::compare_values;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDir {
    #[default]
    #[serde(rename = "asc")]
    Asc,
    #[serde(rename = "desc")]
    Desc,
}

/// Options for a `list` call. Built per call, never shared.
#[derive(Clone, Debug, Default, PartialEq)]
#[must_use]
pub struct ListOptions {
    pub query: Option<Query>,
    pub order_by: Option<String>,
    pub order_by_direction: SortDir,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_order_by(mut self, path: impl Into<String>, direction: SortDir) -> Self {
        self.order_by = Some(path.into());
        self.order_by_direction = direction;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Validate the query and order path.
    ///
    /// # Errors
    /// Returns the first [`QueryError`](crate::QueryError) found in the query
    /// or in the `order_by` path.
    pub fn prepare(&self, policy: OperandPolicy) -> QueryResult<PreparedList> {
        let predicate = self
            .query
            .as_ref()
            .map(|q| q.normalize(policy))
            .transpose()?;
        let order = self
            .order_by
            .as_deref()
            .map(FieldPath::parse)
            .transpose()?
            .map(|path| SortKey {
                path,
                direction: self.order_by_direction,
            });

        Ok(PreparedList {
            predicate,
            order,
            offset: self.offset,
            limit: self.limit,
        })
    }
}

/// Validated [`ListOptions`].
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedList {
    pub predicate: Option<Predicate>,
    pub order: Option<SortKey>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl PreparedList {
    /// Apply `offset` and `limit` to an already filtered and sorted sequence.
    #[must_use]
    pub fn window<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let items = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => items.take(limit).collect(),
            None => items.collect(),
        }
    }
}

/// A validated `order_by` path and direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub path: FieldPath,
    pub direction: SortDir,
}

impl SortKey {
    /// Compare two records; absent values first ascending, last descending,
    /// ties broken by id ascending.
    #[must_use]
    pub fn compare(
        &self,
        (a_id, a): (&str, &Map<String, Value>),
        (b_id, b): (&str, &Map<String, Value>),
    ) -> Ordering {
        let by_value = compare_values(self.path.lookup(a), self.path.lookup(b));
        let by_value = match self.direction {
            SortDir::Asc => by_value,
            SortDir::Desc => by_value.reverse(),
        };
        by_value.then_with(|| a_id.cmp(b_id))
    }
}
