//! Engine detection, typed connect options and pool construction.

use std::str::FromStr;

use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::sql::Dialect;
use crate::config::{PoolConfig, RelationalConfig};
use crate::error::{Result, StorageError};

/// Typed connect options for the detected engine.
#[derive(Debug, Clone)]
pub enum ConnectOptions {
    Postgres(PgConnectOptions),
    Sqlite(SqliteConnectOptions),
}

impl ConnectOptions {
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        match self {
            ConnectOptions::Postgres(_) => Dialect::Postgres,
            ConnectOptions::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// Build options from `config`: a DSN when given, otherwise the typed
    /// `PostgreSQL` fields.
    ///
    /// # Errors
    /// Returns [`StorageError::Config`] for an unknown DSN scheme or a DSN the
    /// driver cannot parse.
    pub fn from_config(config: &RelationalConfig) -> Result<Self> {
        let Some(dsn) = config.dsn.as_deref() else {
            return Ok(ConnectOptions::Postgres(postgres_options(config)));
        };
        match dialect_from_dsn(dsn)? {
            Dialect::Postgres => PgConnectOptions::from_str(dsn)
                .map(ConnectOptions::Postgres)
                .map_err(|e| StorageError::Config(e.to_string())),
            Dialect::Sqlite => SqliteConnectOptions::from_str(dsn)
                .map(|opts| ConnectOptions::Sqlite(opts.create_if_missing(true).with_regexp()))
                .map_err(|e| StorageError::Config(e.to_string())),
        }
    }
}

/// Infer the engine from the DSN scheme.
///
/// # Errors
/// Returns [`StorageError::Config`] for schemes other than `postgres://`,
/// `postgresql://` and `sqlite:`.
pub fn dialect_from_dsn(dsn: &str) -> Result<Dialect> {
    let s = dsn.trim_start();
    if s.starts_with("postgres://") || s.starts_with("postgresql://") {
        Ok(Dialect::Postgres)
    } else if s.starts_with("sqlite:") {
        Ok(Dialect::Sqlite)
    } else {
        Err(StorageError::Config(format!(
            "unsupported DSN scheme: {}",
            redact_credentials_in_dsn(Some(dsn))
        )))
    }
}

fn postgres_options(config: &RelationalConfig) -> PgConnectOptions {
    let mut opts = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port);
    if let Some(user) = &config.user {
        opts = opts.username(user);
    }
    if let Some(password) = &config.password {
        opts = opts.password(password.expose_secret());
    }
    if let Some(database) = &config.database {
        opts = opts.database(database);
    }
    if config.tls {
        let mode = if config.tls_reject_unauthorized {
            PgSslMode::VerifyFull
        } else {
            PgSslMode::Require
        };
        opts = opts.ssl_mode(mode);
        if let Some(ca) = &config.tls_ca_file {
            opts = opts.ssl_root_cert(ca);
        }
    } else {
        opts = opts.ssl_mode(PgSslMode::Disable);
    }
    opts
}

/// Applies [`PoolConfig`] to a driver pool builder.
pub trait ApplyPoolOpts {
    #[must_use]
    fn apply(self, opts: &PoolConfig) -> Self;
}

impl ApplyPoolOpts for PgPoolOptions {
    fn apply(mut self, opts: &PoolConfig) -> Self {
        if let Some(n) = opts.max_conns {
            self = self.max_connections(n);
        }
        if let Some(n) = opts.min_conns {
            self = self.min_connections(n);
        }
        if let Some(t) = opts.acquire_timeout {
            self = self.acquire_timeout(t);
        }
        if let Some(t) = opts.idle_timeout {
            self = self.idle_timeout(t);
        }
        if let Some(t) = opts.max_lifetime {
            self = self.max_lifetime(t);
        }
        self
    }
}

impl ApplyPoolOpts for SqlitePoolOptions {
    fn apply(mut self, opts: &PoolConfig) -> Self {
        if let Some(n) = opts.max_conns {
            self = self.max_connections(n);
        }
        if let Some(n) = opts.min_conns {
            self = self.min_connections(n);
        }
        if let Some(t) = opts.acquire_timeout {
            self = self.acquire_timeout(t);
        }
        if let Some(t) = opts.idle_timeout {
            self = self.idle_timeout(t);
        }
        if let Some(t) = opts.max_lifetime {
            self = self.max_lifetime(t);
        }
        self
    }
}

/// A connected pool for either engine.
#[derive(Debug, Clone)]
pub enum SqlPool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl SqlPool {
    /// # Errors
    /// Returns [`StorageError::BackendUnavailable`] when no connection can be
    /// established.
    pub async fn connect(options: &ConnectOptions, pool: &PoolConfig) -> Result<Self> {
        let connected = match options {
            ConnectOptions::Postgres(opts) => PgPoolOptions::new()
                .apply(pool)
                .connect_with(opts.clone())
                .await
                .map(SqlPool::Postgres),
            ConnectOptions::Sqlite(opts) => SqlitePoolOptions::new()
                .apply(pool)
                .connect_with(opts.clone())
                .await
                .map(SqlPool::Sqlite),
        };
        connected.map_err(|e| StorageError::BackendUnavailable(e.to_string()))
    }

    pub async fn close(&self) {
        match self {
            SqlPool::Postgres(pool) => pool.close().await,
            SqlPool::Sqlite(pool) => pool.close().await,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            SqlPool::Postgres(pool) => pool.is_closed(),
            SqlPool::Sqlite(pool) => pool.is_closed(),
        }
    }
}

/// Mask the password of a DSN for logging.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: Option<&str>) -> String {
    match dsn {
        Some(dsn) if dsn.contains('@') => {
            if let Ok(mut parsed) = url::Url::parse(dsn) {
                if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                    return "***".to_owned();
                }
                parsed.to_string()
            } else {
                "***".to_owned()
            }
        }
        Some(dsn) => dsn.to_owned(),
        None => "none".to_owned(),
    }
}
