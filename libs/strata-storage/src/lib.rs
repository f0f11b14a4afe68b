#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Entity storage over interchangeable backends.
//!
//! [`Storage`] is the one CRUD and query contract callers use. Behind it a
//! [`StorageBackend`] keeps raw JSON documents in memory, in an embedded
//! `redb` file, in MongoDB or in `PostgreSQL`/`SQLite`, and every backend
//! answers the same [`Query`] with the same records in the same order.
//!
//! ```no_run
//! # async fn demo() -> strata_storage::Result<()> {
//! use strata_storage::{ListOptions, Query, StorageConfig, open};
//!
//! let storage = open(&StorageConfig::default()).await?;
//! let active = ListOptions::new()
//!     .with_query(Query::eq("active", true))
//!     .with_limit(10);
//! let records = storage.backend().list_raw("account", &active).await?;
//! # let _ = records;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod changelog;
pub mod config;
pub mod document;
pub mod embedded;
pub mod entity;
pub mod error;
pub mod memory;
pub mod relational;
mod scan;
pub mod storage;

pub use backend::StorageBackend;
pub use changelog::{
    ChangeAction, ChangeLogEntry, ChangeLogger, ChangeLoggerConfig, ChangeLoggingBackend,
};
pub use config::{StorageConfig, StrataConfig, connect, open};
pub use document::{DocumentBackend, DocumentOptions};
pub use embedded::{EmbeddedBackend, IdRange};
pub use entity::{Entity, EntityType, RawDocument, RawRecord};
pub use error::{EntityError, Result, StorageError};
pub use memory::MemoryBackend;
pub use relational::RelationalBackend;
pub use storage::Storage;

pub use strata_query::{ListOptions, OperandPolicy, Query, SortDir};
