//! Embedded key-value backend on a single `redb` database file.
//!
//! ```text
//! records table:  "{kind}_{id}"  ->  JSON bytes of the raw document
//!                  (`_` inside the kind is written `-`)
//! ```
//!
//! Queries are answered by a prefix range scan that decodes, filters, sorts
//! and windows in memory, so every list and count is O(records of kind).
//! Database work runs on the blocking thread pool.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, TableDefinition, TableError};
use strata_query::{ListOptions, OperandPolicy, PreparedList, Query};
use tokio::sync::OnceCell;

use crate::backend::{Lifecycle, StorageBackend};
use crate::config::EmbeddedConfig;
use crate::entity::{RawDocument, RawRecord, validate_id, validate_kind};
use crate::error::{Result, StorageError};
use crate::scan;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

fn db_err(err: impl Into<redb::Error>) -> StorageError {
    StorageError::from(err.into())
}

/// Bounds for [`EmbeddedBackend::list_range_raw`]: ids in `[from, until)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct IdRange {
    pub from: Option<String>,
    pub until: Option<String>,
}

impl IdRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_at(mut self, id: impl Into<String>) -> Self {
        self.from = Some(id.into());
        self
    }

    pub fn end_before(mut self, id: impl Into<String>) -> Self {
        self.until = Some(id.into());
        self
    }
}

pub struct EmbeddedBackend {
    path: PathBuf,
    policy: OperandPolicy,
    opened: OnceCell<()>,
    db: Mutex<Option<Arc<Database>>>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for EmbeddedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedBackend")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .field("opened", &self.opened.initialized())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl EmbeddedBackend {
    #[must_use]
    pub fn new(config: &EmbeddedConfig) -> Self {
        Self {
            path: config.path.clone(),
            policy: OperandPolicy::from_strict(config.strict_queries),
            opened: OnceCell::new(),
            db: Mutex::new(None),
            lifecycle: Lifecycle::default(),
        }
    }

    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    async fn open(&self) -> Result<()> {
        let path = self.path.clone();
        let db = tokio::task::spawn_blocking(move || -> Result<Database> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::BackendUnavailable(e.to_string()))?;
            }
            Database::create(&path).map_err(db_err)
        })
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))??;

        let mut slot = self.db.lock();
        if self.lifecycle.is_disposed() {
            // disposed while opening: the file closes when `db` drops here
            return Err(StorageError::Disposed);
        }
        *slot = Some(Arc::new(db));
        tracing::info!(backend = "embedded", "database opened");
        Ok(())
    }

    async fn handle(&self) -> Result<Arc<Database>> {
        self.lifecycle.ensure_open()?;
        self.opened.get_or_try_init(|| self.open()).await?;
        self.db.lock().clone().ok_or(StorageError::Disposed)
    }

    /// Run `work` against the database on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.handle().await?;
        tokio::task::spawn_blocking(move || work(&db))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
    }

    /// Like [`StorageBackend::list_raw`], bounded to ids in `range`.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidKind`] or [`StorageError::InvalidQuery`]
    /// before touching the database, and backend errors from the scan.
    pub async fn list_range_raw(
        &self,
        kind: &str,
        range: &IdRange,
        options: &ListOptions,
    ) -> Result<Vec<RawRecord>> {
        validate_kind(kind)?;
        let prepared = options.prepare(self.policy)?;
        let kind = kind.to_owned();
        let range = range.clone();
        self.blocking(move |db| scan_list(db, &kind, &range, &prepared))
            .await
    }
}

fn scan_entries(db: &Database, kind: &str, range: &IdRange) -> Result<Vec<(String, Vec<u8>)>> {
    let (start, end) = scan::key_range(kind, range.from.as_deref(), range.until.as_deref());
    let txn = db.begin_read().map_err(db_err)?;
    let table = match txn.open_table(RECORDS) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(err) => return Err(db_err(err)),
    };

    let mut entries = Vec::new();
    for item in table.range(start.as_str()..end.as_str()).map_err(db_err)? {
        let (key, value) = item.map_err(db_err)?;
        if let Some(id) = scan::id_from_key(kind, key.value().as_bytes()) {
            entries.push((id, value.value().to_vec()));
        }
    }
    Ok(entries)
}

fn scan_list(
    db: &Database,
    kind: &str,
    range: &IdRange,
    prepared: &PreparedList,
) -> Result<Vec<RawRecord>> {
    scan::list(kind, scan_entries(db, kind, range)?, prepared)
}

#[async_trait]
impl StorageBackend for EmbeddedBackend {
    fn name(&self) -> &'static str {
        "embedded"
    }

    async fn init(&self) -> Result<()> {
        self.handle().await.map(|_| ())
    }

    async fn dispose(&self) -> Result<()> {
        if !self.lifecycle.mark_disposed() {
            return Ok(());
        }
        // An open still in flight finishes first and sees the flag.
        self.opened
            .get_or_try_init(|| async { Err(StorageError::Disposed) })
            .await
            .ok();
        // Dropping the last handle closes the file; in-flight work keeps
        // its own clone until it finishes.
        self.db.lock().take();
        tracing::info!(backend = "embedded", path = %self.path.display(), "database closed");
        Ok(())
    }

    async fn get_raw(&self, kind: &str, id: &str) -> Result<Option<RawDocument>> {
        validate_kind(kind)?;
        let (kind, id) = (kind.to_owned(), id.to_owned());
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = match txn.open_table(RECORDS) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(err) => return Err(db_err(err)),
            };
            let key = scan::record_key(&kind, &id);
            let Some(value) = table.get(key.as_str()).map_err(db_err)? else {
                return Ok(None);
            };
            scan::decode(&kind, &id, value.value()).map(Some)
        })
        .await
    }

    async fn save_raw(&self, kind: &str, id: &str, raw: &RawDocument) -> Result<()> {
        validate_kind(kind)?;
        validate_id(id)?;
        let bytes = scan::encode(kind, id, raw)?;
        let key = scan::record_key(kind, id);
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(RECORDS).map_err(db_err)?;
                table.insert(key.as_str(), bytes.as_slice()).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)
        })
        .await?;
        tracing::debug!(backend = "embedded", kind, id, "record saved");
        Ok(())
    }

    async fn delete_raw(&self, kind: &str, id: &str) -> Result<()> {
        validate_kind(kind)?;
        let key = scan::record_key(kind, id);
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(RECORDS).map_err(db_err)?;
                table.remove(key.as_str()).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)
        })
        .await?;
        tracing::debug!(backend = "embedded", kind, id, "record deleted");
        Ok(())
    }

    async fn list_raw(&self, kind: &str, options: &ListOptions) -> Result<Vec<RawRecord>> {
        self.list_range_raw(kind, &IdRange::new(), options).await
    }

    async fn count(&self, kind: &str, query: Option<&Query>) -> Result<u64> {
        validate_kind(kind)?;
        let predicate = query.map(|q| q.normalize(self.policy)).transpose()?;
        let kind = kind.to_owned();
        self.blocking(move |db| {
            let entries = scan_entries(db, &kind, &IdRange::new())?;
            let matching = scan::matching(&kind, entries, predicate.as_ref())?;
            Ok(matching.len() as u64)
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.blocking(|db| {
            let txn = db.begin_write().map_err(db_err)?;
            txn.delete_table(RECORDS).map_err(db_err)?;
            txn.commit().map_err(db_err)
        })
        .await?;
        tracing::info!(backend = "embedded", "storage cleared");
        Ok(())
    }
}
