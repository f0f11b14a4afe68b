//! Backend trait shared by all adapters.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use strata_query::{ListOptions, Query};

use crate::entity::{RawDocument, RawRecord};
use crate::error::{Result, StorageError};

/// Object-safe storage backend working on raw records.
///
/// Implementations validate `kind` before any I/O and create per-kind
/// resources (tables, collections) lazily. All of them accept operations
/// before `init` by initializing on first use.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Open connections or files. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Release pools and handles. Idempotent; later calls fail with
    /// [`StorageError::Disposed`].
    async fn dispose(&self) -> Result<()>;

    /// Fetch one record, `None` when absent.
    async fn get_raw(&self, kind: &str, id: &str) -> Result<Option<RawDocument>>;

    /// Insert or replace the record at `(kind, id)`.
    async fn save_raw(&self, kind: &str, id: &str, raw: &RawDocument) -> Result<()>;

    /// Remove the record at `(kind, id)`. Removing an absent record succeeds.
    async fn delete_raw(&self, kind: &str, id: &str) -> Result<()>;

    /// Filter, order and window the records of `kind`.
    async fn list_raw(&self, kind: &str, options: &ListOptions) -> Result<Vec<RawRecord>>;

    /// Number of records of `kind` matching `query`.
    async fn count(&self, kind: &str, query: Option<&Query>) -> Result<u64>;

    /// Remove every record of every kind.
    async fn clear(&self) -> Result<()>;
}

/// Disposal flag shared by the adapters.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    disposed: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(StorageError::Disposed);
        }
        Ok(())
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Returns `true` for the first caller only.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Report driver failures caused by a concurrent `dispose` as `Disposed`.
    pub(crate) fn settle<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(_) if self.is_disposed() => Err(StorageError::Disposed),
            other => other,
        }
    }
}
