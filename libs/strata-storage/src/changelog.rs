//! Change logging: a backend decorator that records every create, update and
//! delete into a separate change-log storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_query::{ListOptions, Query};
use uuid::Uuid;

use crate::backend::StorageBackend;
use crate::config::{ChangeLogSection, connect};
use crate::entity::{Entity, EntityType, RawDocument, RawRecord, raw};
use crate::error::{EntityError, Result};
use crate::storage::Storage;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    #[default]
    Create,
    Update,
    Delete,
}

/// One recorded change. Ids are UUID v7, so id order is time order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeLogEntry {
    pub id: String,
    pub time: DateTime<Utc>,
    pub action: ChangeAction,
    pub object_kind: String,
    pub object_id: String,
    pub before: Option<RawDocument>,
    pub after: Option<RawDocument>,
    /// Caller-provided context, e.g. the acting account and session.
    pub context: Option<Value>,
}

impl ChangeLogEntry {
    #[must_use]
    pub fn new(
        action: ChangeAction,
        object_kind: impl Into<String>,
        object_id: impl Into<String>,
        before: Option<RawDocument>,
        after: Option<RawDocument>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            time: Utc::now(),
            action,
            object_kind: object_kind.into(),
            object_id: object_id.into(),
            before,
            after,
            context: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Option<Value>) -> Self {
        self.context = context;
        self
    }
}

impl Entity for ChangeLogEntry {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn to_raw(&self) -> std::result::Result<RawDocument, EntityError> {
        raw::to_raw_document(self)
    }

    fn from_raw(self, raw: RawDocument) -> std::result::Result<Self, EntityError> {
        raw::from_raw_document(raw)
    }
}

impl EntityType for ChangeLogEntry {
    const KIND: &'static str = "change_log";
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChangeLoggerConfig {
    pub enabled: bool,
    /// Kinds whose changes are not recorded.
    pub exclude_kinds: Vec<String>,
}

impl ChangeLoggerConfig {
    fn records(&self, kind: &str) -> bool {
        self.enabled
            && kind != ChangeLogEntry::KIND
            && !self.exclude_kinds.iter().any(|k| k == kind)
    }
}

/// Wraps a primary backend; reads pass through, writes are recorded.
pub struct ChangeLoggingBackend {
    inner: Arc<dyn StorageBackend>,
    log: Storage,
    config: Arc<ChangeLoggerConfig>,
    context: Option<Value>,
}

impl std::fmt::Debug for ChangeLoggingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLoggingBackend")
            .field("inner", &self.inner.name())
            .field("log", &self.log)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChangeLoggingBackend {
    /// Failures writing the entry are logged; the primary write already
    /// succeeded.
    async fn record(&self, entry: ChangeLogEntry) {
        let entry = entry.with_context(self.context.clone());
        if let Err(err) = self.log.save(&entry).await {
            tracing::warn!(
                kind = %entry.object_kind,
                id = %entry.object_id,
                action = ?entry.action,
                error = %err,
                "failed to record change"
            );
        }
    }
}

#[async_trait]
impl StorageBackend for ChangeLoggingBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn dispose(&self) -> Result<()> {
        self.inner.dispose().await
    }

    async fn get_raw(&self, kind: &str, id: &str) -> Result<Option<RawDocument>> {
        self.inner.get_raw(kind, id).await
    }

    async fn save_raw(&self, kind: &str, id: &str, raw: &RawDocument) -> Result<()> {
        if !self.config.records(kind) {
            return self.inner.save_raw(kind, id, raw).await;
        }
        let before = self.inner.get_raw(kind, id).await?;
        self.inner.save_raw(kind, id, raw).await?;
        let action = if before.is_some() {
            ChangeAction::Update
        } else {
            ChangeAction::Create
        };
        self.record(ChangeLogEntry::new(action, kind, id, before, Some(raw.clone())))
            .await;
        Ok(())
    }

    async fn delete_raw(&self, kind: &str, id: &str) -> Result<()> {
        if !self.config.records(kind) {
            return self.inner.delete_raw(kind, id).await;
        }
        let before = self.inner.get_raw(kind, id).await?;
        self.inner.delete_raw(kind, id).await?;
        if before.is_some() {
            self.record(ChangeLogEntry::new(ChangeAction::Delete, kind, id, before, None))
                .await;
        }
        Ok(())
    }

    async fn list_raw(&self, kind: &str, options: &ListOptions) -> Result<Vec<RawRecord>> {
        self.inner.list_raw(kind, options).await
    }

    async fn count(&self, kind: &str, query: Option<&Query>) -> Result<u64> {
        self.inner.count(kind, query).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}

/// Owns the change-log storage and hands out recording wrappers.
#[derive(Clone, Debug)]
pub struct ChangeLogger {
    storage: Storage,
    config: Arc<ChangeLoggerConfig>,
}

impl ChangeLogger {
    #[must_use]
    pub fn new(storage: Storage, config: ChangeLoggerConfig) -> Self {
        Self {
            storage,
            config: Arc::new(config),
        }
    }

    /// Build the logger and its storage from a `change_log` config section.
    ///
    /// # Errors
    /// Returns configuration errors from [`connect`].
    pub fn from_config(section: &ChangeLogSection) -> Result<Self> {
        Ok(Self::new(
            connect(&section.storage)?,
            section.logger.clone(),
        ))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// # Errors
    /// Returns backend errors from the change-log storage.
    pub async fn init(&self) -> Result<()> {
        self.storage.init().await
    }

    /// # Errors
    /// Returns backend errors from the change-log storage.
    pub async fn dispose(&self) -> Result<()> {
        self.storage.dispose().await
    }

    /// # Errors
    /// Returns query and backend errors from the change-log storage.
    pub async fn list(&self, options: &ListOptions) -> Result<Vec<ChangeLogEntry>> {
        self.storage.list::<ChangeLogEntry>(options).await
    }

    /// # Errors
    /// Returns query and backend errors from the change-log storage.
    pub async fn count(&self, query: Option<&Query>) -> Result<u64> {
        self.storage.count::<ChangeLogEntry>(query).await
    }

    /// A storage that behaves like `storage` and records its writes, tagging
    /// each entry with `context`.
    #[must_use]
    pub fn wrap(&self, storage: &Storage, context: Option<Value>) -> Storage {
        Storage::new(ChangeLoggingBackend {
            inner: Arc::clone(storage.backend()),
            log: self.storage.clone(),
            config: Arc::clone(&self.config),
            context,
        })
    }
}
