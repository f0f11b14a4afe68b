//! Typed backend configuration, loaded with `figment` from YAML and
//! `STRATA__`-prefixed environment variables.
//!
//! ```yaml
//! storage:
//!   backend: relational
//!   dsn: postgres://strata@db/strata
//!   pool:
//!     max_conns: 16
//!     acquire_timeout: 5s
//! change_log:
//!   enabled: true
//!   exclude_kinds: [session]
//!   storage:
//!     backend: embedded
//!     path: data/changes.redb
//! ```
//!
//! `STRATA__STORAGE__POOL__MAX_CONNS=32` overrides a nested key.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use secrecy::SecretString;
use serde::Deserialize;

use crate::changelog::ChangeLoggerConfig;
use crate::document::DocumentBackend;
use crate::embedded::EmbeddedBackend;
use crate::error::{Result, StorageError};
use crate::memory::MemoryBackend;
use crate::relational::RelationalBackend;
use crate::storage::Storage;
use strata_query::OperandPolicy;

/// Environment prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "STRATA__";

/// Root configuration document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub storage: StorageConfig,
    pub change_log: Option<ChangeLogSection>,
}

/// Change logging settings plus the backend the entries are written to.
#[derive(Debug, Deserialize)]
pub struct ChangeLogSection {
    #[serde(flatten)]
    pub logger: ChangeLoggerConfig,
    pub storage: StorageConfig,
}

impl StrataConfig {
    /// Layered providers: the YAML file (when given), then the environment.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let figment = Figment::new();
        let figment = match path {
            Some(path) => figment.merge(Yaml::file(path)),
            None => figment,
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// # Errors
    /// Returns [`StorageError::Config`] if `path` does not exist or the merged
    /// configuration does not deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path.filter(|p| !p.exists()) {
            return Err(StorageError::Config(format!(
                "config file {} not found",
                path.display()
            )));
        }
        Self::figment(path)
            .extract()
            .map_err(|e| StorageError::Config(e.to_string()))
    }
}

/// Backend selection, tagged by `backend`.
#[derive(Debug, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory(MemoryConfig),
    Embedded(EmbeddedConfig),
    Document(DocumentConfig),
    Relational(RelationalConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(MemoryConfig::default())
    }
}

impl StorageConfig {
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Memory(_) => "memory",
            StorageConfig::Embedded(_) => "embedded",
            StorageConfig::Document(_) => "document",
            StorageConfig::Relational(_) => "relational",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub strict_queries: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    /// Database file; parent directories are created on open.
    pub path: PathBuf,
    pub strict_queries: bool,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/strata.redb"),
            strict_queries: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// `mongodb` or `mongodb+srv`.
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Database holding the credentials; defaults to `database`.
    pub auth_database: Option<String>,
    pub database: String,
    pub tls: bool,
    pub tls_ca_file: Option<PathBuf>,
    /// Default write concern: `w: 1` when true, `w: 0` otherwise.
    pub acknowledge_writes: bool,
    /// Create new collections capped to this many bytes.
    pub max_size: Option<u64>,
    /// Document limit for capped collections.
    pub max_documents: Option<u64>,
    #[serde(with = "humantime_serde")]
    pub server_selection_timeout: Option<Duration>,
    pub strict_queries: bool,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            protocol: "mongodb".to_owned(),
            host: "localhost".to_owned(),
            port: 27017,
            username: None,
            password: None,
            auth_database: None,
            database: "strata".to_owned(),
            tls: false,
            tls_ca_file: None,
            acknowledge_writes: true,
            max_size: None,
            max_documents: None,
            server_selection_timeout: None,
            strict_queries: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    /// `postgres://`, `postgresql://` or `sqlite:` DSN. When absent, the
    /// typed PostgreSQL fields below are used.
    pub dsn: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub database: Option<String>,
    pub tls: bool,
    pub tls_ca_file: Option<PathBuf>,
    /// Verify the server certificate when `tls` is on.
    pub tls_reject_unauthorized: bool,
    pub pool: PoolConfig,
    pub strict_queries: bool,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            host: "localhost".to_owned(),
            port: 5432,
            user: None,
            password: None,
            database: None,
            tls: false,
            tls_ca_file: None,
            tls_reject_unauthorized: true,
            pool: PoolConfig::default(),
            strict_queries: false,
        }
    }
}

/// Connection pool knobs; each unset value keeps the driver default.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_conns: Option<u32>,
    /// Minimum number of connections in the pool.
    pub min_conns: Option<u32>,
    /// Timeout to acquire a connection from the pool.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    /// Idle timeout before a connection is closed.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Maximum lifetime for a connection.
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Option<Duration>,
}

/// Build (but do not initialize) the backend named by `config`.
///
/// # Errors
/// Returns [`StorageError::Config`] for an unrecognized relational DSN.
pub fn connect(config: &StorageConfig) -> Result<Storage> {
    tracing::debug!(backend = config.backend_name(), "building storage backend");
    let storage = match config {
        StorageConfig::Memory(cfg) => Storage::new(
            MemoryBackend::new()
                .with_operand_policy(OperandPolicy::from_strict(cfg.strict_queries)),
        ),
        StorageConfig::Embedded(cfg) => Storage::new(EmbeddedBackend::new(cfg)),
        StorageConfig::Document(cfg) => Storage::new(DocumentBackend::new(cfg)),
        StorageConfig::Relational(cfg) => Storage::new(RelationalBackend::new(cfg)?),
    };
    Ok(storage)
}

/// [`connect`] followed by [`Storage::init`].
///
/// # Errors
/// Returns configuration errors and [`StorageError::BackendUnavailable`]
/// when the backend cannot be reached.
pub async fn open(config: &StorageConfig) -> Result<Storage> {
    let storage = connect(config)?;
    storage.init().await?;
    Ok(storage)
}
