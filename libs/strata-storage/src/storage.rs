//! Typed facade over a [`StorageBackend`].

use std::fmt;
use std::sync::Arc;

use strata_query::{ListOptions, Query};

use crate::backend::StorageBackend;
use crate::entity::{Entity, EntityType, RawRecord};
use crate::error::{Result, StorageError};

/// CRUD and query entry point for entities.
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Storage {
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    #[must_use]
    pub fn from_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// The raw backend, for callers that work on raw records.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    /// Open the backend. Idempotent.
    ///
    /// # Errors
    /// Returns [`StorageError::BackendUnavailable`] when the backend cannot be
    /// reached, or [`StorageError::Disposed`] after [`Storage::dispose`].
    pub async fn init(&self) -> Result<()> {
        self.backend.init().await
    }

    /// Release the backend. Idempotent.
    ///
    /// # Errors
    /// Propagates backend errors raised while closing.
    pub async fn dispose(&self) -> Result<()> {
        self.backend.dispose().await
    }

    /// Load an entity by id using its static kind.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if no record exists.
    pub async fn get<T: EntityType>(&self, id: &str) -> Result<T> {
        self.get_with(T::default(), id).await
    }

    /// Load an entity by id into `template`, whose `kind` selects the namespace.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if no record exists and
    /// [`StorageError::Serialization`] if the record cannot be reconstructed.
    pub async fn get_with<T: Entity>(&self, template: T, id: &str) -> Result<T> {
        let kind = template.kind().to_owned();
        let raw = self
            .backend
            .get_raw(&kind, id)
            .await?
            .ok_or_else(|| StorageError::not_found(&kind, id))?;
        template
            .from_raw(raw)
            .map_err(|e| StorageError::serialization(kind, id, e.to_string()))
    }

    /// Insert or replace `entity`; the last write wins.
    ///
    /// # Errors
    /// Returns [`StorageError::Serialization`] if the entity has no raw form,
    /// plus any backend error.
    pub async fn save<T: Entity>(&self, entity: &T) -> Result<()> {
        let raw = entity
            .to_raw()
            .map_err(|e| {
                StorageError::serialization(entity.kind(), entity.id(), e.to_string())
            })?;
        self.backend.save_raw(entity.kind(), entity.id(), &raw).await
    }

    /// Remove `entity`. Removing an absent entity succeeds.
    ///
    /// # Errors
    /// Propagates backend errors.
    pub async fn delete<T: Entity>(&self, entity: &T) -> Result<()> {
        self.backend.delete_raw(entity.kind(), entity.id()).await
    }

    /// # Errors
    /// Propagates backend errors.
    pub async fn delete_by_id(&self, kind: &str, id: &str) -> Result<()> {
        self.backend.delete_raw(kind, id).await
    }

    /// List entities of `T`'s kind.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidQuery`] before any I/O for a malformed
    /// query, plus any backend error.
    pub async fn list<T: EntityType>(&self, options: &ListOptions) -> Result<Vec<T>> {
        self.list_with(T::KIND, T::default, options).await
    }

    /// List entities of `kind`, reconstructing each from `template()`.
    ///
    /// Records that fail reconstruction are logged and skipped.
    ///
    /// # Errors
    /// Same as [`Storage::list`].
    pub async fn list_with<T, F>(
        &self,
        kind: &str,
        template: F,
        options: &ListOptions,
    ) -> Result<Vec<T>>
    where
        T: Entity,
        F: Fn() -> T + Send,
    {
        let records = self.backend.list_raw(kind, options).await?;
        Ok(records
            .into_iter()
            .filter_map(|RawRecord { id, raw }| match template().from_raw(raw) {
                Ok(entity) => Some(entity),
                Err(err) => {
                    tracing::warn!(kind, id = %id, error = %err, "skipping record that failed reconstruction");
                    None
                }
            })
            .collect())
    }

    /// Count entities of `T`'s kind matching `query`, ignoring any window.
    ///
    /// # Errors
    /// Same as [`Storage::list`].
    pub async fn count<T: EntityType>(&self, query: Option<&Query>) -> Result<u64> {
        self.backend.count(T::KIND, query).await
    }

    /// # Errors
    /// Same as [`Storage::list`].
    pub async fn count_kind(&self, kind: &str, query: Option<&Query>) -> Result<u64> {
        self.backend.count(kind, query).await
    }

    /// Remove every record. Only the memory and embedded backends support it.
    ///
    /// # Errors
    /// Returns [`StorageError::Unsupported`] on document and relational backends.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }
}
