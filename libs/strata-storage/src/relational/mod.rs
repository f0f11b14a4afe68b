//! Relational backend on `sqlx`, for `PostgreSQL` and `SQLite`.
//!
//! One `(id, data)` table per kind, created on first use. Queries are
//! compiled to a single parameterized statement by [`sql`].

pub mod pool;
pub mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::Row;
use strata_query::{ListOptions, OperandPolicy, Query};
use tokio::sync::OnceCell;

use self::pool::{ConnectOptions, SqlPool, redact_credentials_in_dsn};
use self::sql::{Bind, Dialect, Statement};
use crate::backend::{Lifecycle, StorageBackend};
use crate::config::{PoolConfig, RelationalConfig};
use crate::entity::{RawDocument, RawRecord, validate_id, validate_kind};
use crate::error::{Result, StorageError};

type BoundQuery<'q, DB> = sqlx::query::Query<'q, DB, <DB as sqlx::Database>::Arguments<'q>>;

fn bind_all<'q, DB>(query: BoundQuery<'q, DB>, binds: &'q [Bind]) -> BoundQuery<'q, DB>
where
    DB: sqlx::Database,
    &'q str: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    i64: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    f64: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    bool: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    binds.iter().fold(query, |query, bind| match bind {
        Bind::Text(s) => query.bind(s.as_str()),
        Bind::Int(i) => query.bind(*i),
        Bind::Float(f) => query.bind(*f),
        Bind::Bool(b) => query.bind(*b),
    })
}

pub struct RelationalBackend {
    dialect: Dialect,
    options: ConnectOptions,
    pool_config: PoolConfig,
    /// Connection target with credentials masked.
    target: String,
    policy: OperandPolicy,
    pool: OnceCell<SqlPool>,
    tables: DashMap<String, Arc<OnceCell<()>>>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for RelationalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalBackend")
            .field("dialect", &self.dialect)
            .field("target", &self.target)
            .field("policy", &self.policy)
            .field("tables", &self.tables.len())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl RelationalBackend {
    /// # Errors
    /// Returns [`StorageError::Config`] for an unsupported or malformed DSN.
    pub fn new(config: &RelationalConfig) -> Result<Self> {
        let options = ConnectOptions::from_config(config)?;
        let target = match config.dsn.as_deref() {
            Some(dsn) => redact_credentials_in_dsn(Some(dsn)),
            None => format!(
                "postgres://{}:{}/{}",
                config.host,
                config.port,
                config.database.as_deref().unwrap_or_default()
            ),
        };
        Ok(Self {
            dialect: options.dialect(),
            options,
            pool_config: config.pool.clone(),
            target,
            policy: OperandPolicy::from_strict(config.strict_queries),
            pool: OnceCell::new(),
            tables: DashMap::new(),
            lifecycle: Lifecycle::default(),
        })
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[tracing::instrument(skip_all, fields(target = %self.target))]
    async fn connect(&self) -> Result<SqlPool> {
        let pool = SqlPool::connect(&self.options, &self.pool_config).await?;
        if self.lifecycle.is_disposed() {
            pool.close().await;
            return Err(StorageError::Disposed);
        }
        tracing::info!(backend = "relational", dialect = ?self.dialect, "pool connected");
        Ok(pool)
    }

    async fn pool(&self) -> Result<SqlPool> {
        self.lifecycle.ensure_open()?;
        let pool = self.pool.get_or_try_init(|| self.connect()).await?;
        Ok(pool.clone())
    }

    /// Pool with the table for `kind` in place.
    async fn table(&self, kind: &str) -> Result<SqlPool> {
        validate_kind(kind)?;
        let pool = self.pool().await?;
        let cell = self.tables.entry(kind.to_owned()).or_default().clone();
        cell.get_or_try_init(|| self.create_table(&pool, kind))
            .await?;
        Ok(pool)
    }

    #[tracing::instrument(skip(self, pool))]
    async fn create_table(&self, pool: &SqlPool, kind: &str) -> Result<()> {
        let ddl = sql::create_table(self.dialect, kind);
        let stmt = Statement {
            sql: ddl,
            binds: Vec::new(),
        };
        self.execute(pool, &stmt).await?;
        tracing::info!(backend = "relational", kind, "table ensured");
        Ok(())
    }

    async fn execute(&self, pool: &SqlPool, stmt: &Statement) -> Result<u64> {
        let result = match pool {
            SqlPool::Postgres(pool) => bind_all(sqlx::query(&stmt.sql), &stmt.binds)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            SqlPool::Sqlite(pool) => bind_all(sqlx::query(&stmt.sql), &stmt.binds)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        };
        self.lifecycle.settle(result.map_err(StorageError::from))
    }

    async fn fetch_data(&self, pool: &SqlPool, stmt: &Statement) -> Result<Option<String>> {
        let result = match pool {
            SqlPool::Postgres(pool) => bind_all(sqlx::query(&stmt.sql), &stmt.binds)
                .fetch_optional(pool)
                .await
                .and_then(|row| row.map(|r| r.try_get::<String, _>("data")).transpose()),
            SqlPool::Sqlite(pool) => bind_all(sqlx::query(&stmt.sql), &stmt.binds)
                .fetch_optional(pool)
                .await
                .and_then(|row| row.map(|r| r.try_get::<String, _>("data")).transpose()),
        };
        self.lifecycle.settle(result.map_err(StorageError::from))
    }

    async fn fetch_records(
        &self,
        pool: &SqlPool,
        stmt: &Statement,
    ) -> Result<Vec<(String, String)>> {
        let result = match pool {
            SqlPool::Postgres(pool) => bind_all(sqlx::query(&stmt.sql), &stmt.binds)
                .fetch_all(pool)
                .await
                .and_then(|rows| {
                    rows.iter()
                        .map(|r| {
                            Ok::<_, sqlx::Error>((
                                r.try_get::<String, _>("id")?,
                                r.try_get::<String, _>("data")?,
                            ))
                        })
                        .collect()
                }),
            SqlPool::Sqlite(pool) => bind_all(sqlx::query(&stmt.sql), &stmt.binds)
                .fetch_all(pool)
                .await
                .and_then(|rows| {
                    rows.iter()
                        .map(|r| {
                            Ok::<_, sqlx::Error>((
                                r.try_get::<String, _>("id")?,
                                r.try_get::<String, _>("data")?,
                            ))
                        })
                        .collect()
                }),
        };
        self.lifecycle.settle(result.map_err(StorageError::from))
    }

    async fn fetch_count(&self, pool: &SqlPool, stmt: &Statement) -> Result<u64> {
        let result = match pool {
            SqlPool::Postgres(pool) => bind_all(sqlx::query(&stmt.sql), &stmt.binds)
                .fetch_one(pool)
                .await
                .and_then(|row| row.try_get::<i64, _>(0)),
            SqlPool::Sqlite(pool) => bind_all(sqlx::query(&stmt.sql), &stmt.binds)
                .fetch_one(pool)
                .await
                .and_then(|row| row.try_get::<i64, _>(0)),
        };
        let count = self.lifecycle.settle(result.map_err(StorageError::from))?;
        u64::try_from(count).map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl StorageBackend for RelationalBackend {
    fn name(&self) -> &'static str {
        "relational"
    }

    async fn init(&self) -> Result<()> {
        self.pool().await.map(|_| ())
    }

    async fn dispose(&self) -> Result<()> {
        if !self.lifecycle.mark_disposed() {
            return Ok(());
        }
        self.tables.clear();
        // A connect still in flight finishes first and sees the flag.
        let pool = self
            .pool
            .get_or_try_init(|| async { Err(StorageError::Disposed) })
            .await;
        if let Ok(pool) = pool {
            pool.close().await;
            tracing::info!(backend = "relational", target = %self.target, "pool closed");
        }
        Ok(())
    }

    async fn get_raw(&self, kind: &str, id: &str) -> Result<Option<RawDocument>> {
        let pool = self.table(kind).await?;
        let data = self
            .fetch_data(&pool, &sql::select_one(self.dialect, kind, id))
            .await?;
        data.map(|data| {
            serde_json::from_str(&data)
                .map_err(|e| StorageError::serialization(kind, id, e.to_string()))
        })
        .transpose()
    }

    async fn save_raw(&self, kind: &str, id: &str, raw: &RawDocument) -> Result<()> {
        validate_kind(kind)?;
        validate_id(id)?;
        let data = serde_json::to_string(raw)
            .map_err(|e| StorageError::serialization(kind, id, e.to_string()))?;
        let pool = self.table(kind).await?;
        self.execute(&pool, &sql::upsert(self.dialect, kind, id, data))
            .await?;
        tracing::debug!(backend = "relational", kind, id, "record saved");
        Ok(())
    }

    async fn delete_raw(&self, kind: &str, id: &str) -> Result<()> {
        let pool = self.table(kind).await?;
        self.execute(&pool, &sql::delete(self.dialect, kind, id))
            .await?;
        tracing::debug!(backend = "relational", kind, id, "record deleted");
        Ok(())
    }

    async fn list_raw(&self, kind: &str, options: &ListOptions) -> Result<Vec<RawRecord>> {
        validate_kind(kind)?;
        let prepared = options.prepare(self.policy)?;
        let stmt = sql::select(self.dialect, kind, &prepared);
        let pool = self.table(kind).await?;
        let rows = self.fetch_records(&pool, &stmt).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, data)| match serde_json::from_str(&data) {
                Ok(raw) => Some(RawRecord::new(id, raw)),
                Err(err) => {
                    tracing::warn!(backend = "relational", kind, id = %id, error = %err, "skipping undecodable record");
                    None
                }
            })
            .collect())
    }

    async fn count(&self, kind: &str, query: Option<&Query>) -> Result<u64> {
        validate_kind(kind)?;
        let predicate = query.map(|q| q.normalize(self.policy)).transpose()?;
        let stmt = sql::count(self.dialect, kind, predicate.as_ref());
        let pool = self.table(kind).await?;
        self.fetch_count(&pool, &stmt).await
    }

    async fn clear(&self) -> Result<()> {
        Err(StorageError::Unsupported(
            "clear is not supported by the relational backend",
        ))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    fn sqlite(dir: &tempfile::TempDir) -> RelationalBackend {
        let path = dir.path().join("strata.db");
        RelationalBackend::new(&RelationalConfig {
            dsn: Some(format!("sqlite://{}?mode=rwc", path.display())),
            ..RelationalConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_target_masks_password() {
        let backend = RelationalBackend::new(&RelationalConfig {
            dsn: Some("postgres://strata:secret@db:5432/strata".to_owned()),
            ..RelationalConfig::default()
        })
        .unwrap();
        assert_eq!(backend.dialect(), Dialect::Postgres);
        assert!(!format!("{backend:?}").contains("secret"));
    }

    #[test]
    fn test_unknown_scheme_is_a_config_error() {
        let err = RelationalBackend::new(&RelationalConfig {
            dsn: Some("mysql://localhost/db".to_owned()),
            ..RelationalConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_sqlite_upsert_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sqlite(&dir);
        let first = json!({"name": "Ann"}).as_object().unwrap().clone();
        let second = json!({"name": "Bea"}).as_object().unwrap().clone();

        backend.save_raw("account", "a1", &first).await.unwrap();
        backend.save_raw("account", "a1", &second).await.unwrap();

        assert_eq!(backend.count("account", None).await.unwrap(), 1);
        let raw = backend.get_raw("account", "a1").await.unwrap().unwrap();
        assert_eq!(raw["name"], json!("Bea"));
    }

    #[tokio::test]
    async fn test_sqlite_regex_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sqlite(&dir);
        for (id, email) in [("1", "Admin@Example.com"), ("2", "user@other.org")] {
            let raw = json!({"email": email}).as_object().unwrap().clone();
            backend.save_raw("account", id, &raw).await.unwrap();
        }

        let query = Query::regex("email", "example\\.COM");
        assert_eq!(backend.count("account", Some(&query)).await.unwrap(), 1);
        let query = Query::negex("email", "example\\.COM");
        assert_eq!(backend.count("account", Some(&query)).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispose_during_connect_closes_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..8 {
            let backend = Arc::new(sqlite(&dir));
            let connecting = {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move { backend.init().await })
            };
            tokio::task::yield_now().await;
            backend.dispose().await.unwrap();

            match connecting.await.unwrap() {
                Ok(()) | Err(StorageError::Disposed) => {}
                Err(err) => panic!("unexpected init failure: {err}"),
            }
            assert!(backend.pool.get().is_none_or(SqlPool::is_closed));
            assert!(matches!(backend.init().await, Err(StorageError::Disposed)));
        }
    }

    #[tokio::test]
    async fn test_dispose_closes_pool() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sqlite(&dir);
        backend.init().await.unwrap();
        backend.dispose().await.unwrap();
        backend.dispose().await.unwrap();
        assert!(matches!(
            backend.get_raw("account", "a1").await,
            Err(StorageError::Disposed)
        ));
    }
}
