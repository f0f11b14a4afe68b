//! Document-store backend on MongoDB.
//!
//! One collection per kind, created lazily (capped when configured). Records
//! are stored as the raw document plus `_id`; `_id` is stripped on read.

pub mod filter;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{
    Acknowledgment, ClientOptions, CreateCollectionOptions, Credential, DeleteOptions, FindOptions,
    ReplaceOptions, Tls, TlsOptions, WriteConcern,
};
use mongodb::{Client, Collection, Database};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use strata_query::{ListOptions, OperandPolicy, Query};
use tokio::sync::OnceCell;

use crate::backend::{Lifecycle, StorageBackend};
use crate::config::DocumentConfig;
use crate::entity::{RawDocument, RawRecord, validate_id, validate_kind};
use crate::error::{Result, StorageError};

/// Server error code for "collection already exists".
const NAMESPACE_EXISTS: i32 = 48;

/// Per-call options for [`DocumentBackend::get_with_options`] and friends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DocumentOptions {
    /// Address the record by a native `ObjectId` parsed from the id.
    pub use_object_id: bool,
    /// Write concern `w: 1` when true, `w: 0` when false; the configured
    /// default when unset.
    pub acknowledge: Option<bool>,
}

/// Capped collection limits.
#[derive(Clone, Copy, Debug)]
struct Capped {
    size: u64,
    max_documents: Option<u64>,
}

struct Connection {
    client: Client,
    database: Database,
}

pub struct DocumentBackend {
    uri: String,
    username: Option<String>,
    password: Option<SecretString>,
    auth_database: Option<String>,
    database: String,
    tls_ca_file: Option<PathBuf>,
    tls: bool,
    server_selection_timeout: Option<Duration>,
    acknowledge_writes: bool,
    capped: Option<Capped>,
    policy: OperandPolicy,
    connection: OnceCell<Connection>,
    collections: DashMap<String, Arc<OnceCell<Collection<Document>>>>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for DocumentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBackend")
            .field("uri", &self.uri)
            .field("database", &self.database)
            .field("tls", &self.tls)
            .field("capped", &self.capped)
            .field("policy", &self.policy)
            .field("collections", &self.collections.len())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl DocumentBackend {
    #[must_use]
    pub fn new(config: &DocumentConfig) -> Self {
        let uri = if config.protocol == "mongodb+srv" {
            format!("{}://{}/", config.protocol, config.host)
        } else {
            format!("{}://{}:{}/", config.protocol, config.host, config.port)
        };
        Self {
            uri,
            username: config.username.clone(),
            password: config
                .password
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_owned())),
            auth_database: config.auth_database.clone(),
            database: config.database.clone(),
            tls_ca_file: config.tls_ca_file.clone(),
            tls: config.tls,
            server_selection_timeout: config.server_selection_timeout,
            acknowledge_writes: config.acknowledge_writes,
            capped: config.max_size.map(|size| Capped {
                size,
                max_documents: config.max_documents,
            }),
            policy: OperandPolicy::from_strict(config.strict_queries),
            connection: OnceCell::new(),
            collections: DashMap::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    async fn client_options(&self) -> Result<ClientOptions> {
        let mut options = ClientOptions::parse(&self.uri)
            .await
            .map_err(|e| StorageError::Config(e.to_string()))?;
        options.app_name = Some("strata".to_owned());
        if self.username.is_some() || self.password.is_some() {
            options.credential = Some(
                Credential::builder()
                    .username(self.username.clone())
                    .password(self.password.as_ref().map(|p| p.expose_secret().to_owned()))
                    .source(
                        self.auth_database
                            .clone()
                            .unwrap_or_else(|| self.database.clone()),
                    )
                    .build(),
            );
        }
        if self.tls {
            options.tls = Some(Tls::Enabled(
                TlsOptions::builder()
                    .ca_file_path(self.tls_ca_file.clone())
                    .build(),
            ));
        }
        if let Some(timeout) = self.server_selection_timeout {
            options.server_selection_timeout = Some(timeout);
        }
        Ok(options)
    }

    #[tracing::instrument(skip_all, fields(uri = %self.uri, database = %self.database))]
    async fn connect(&self) -> Result<Connection> {
        let client = Client::with_options(self.client_options().await?)?;
        let database = client.database(&self.database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StorageError::BackendUnavailable(e.to_string()))?;
        if self.lifecycle.is_disposed() {
            client.shutdown().await;
            return Err(StorageError::Disposed);
        }
        tracing::info!(backend = "document", "connected");
        Ok(Connection { client, database })
    }

    async fn database(&self) -> Result<Database> {
        self.lifecycle.ensure_open()?;
        let connection = self.connection.get_or_try_init(|| self.connect()).await?;
        Ok(connection.database.clone())
    }

    /// Collection for `kind`, created once per backend instance.
    async fn collection(&self, kind: &str) -> Result<Collection<Document>> {
        validate_kind(kind)?;
        let database = self.database().await?;
        let cell = self.collections.entry(kind.to_owned()).or_default().clone();
        let collection = cell
            .get_or_try_init(|| self.create_collection(&database, kind))
            .await?;
        Ok(collection.clone())
    }

    #[tracing::instrument(skip(self, database))]
    async fn create_collection(
        &self,
        database: &Database,
        kind: &str,
    ) -> Result<Collection<Document>> {
        let options = self.capped.map(|capped| {
            CreateCollectionOptions::builder()
                .capped(true)
                .size(capped.size)
                .max(capped.max_documents)
                .build()
        });
        match database.create_collection(kind).with_options(options).await {
            Ok(()) => tracing::info!(
                backend = "document",
                kind,
                "collection created"
            ),
            Err(err) if is_namespace_exists(&err) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(database.collection::<Document>(kind))
    }

    fn write_concern(&self, options: DocumentOptions) -> WriteConcern {
        let nodes = if options.acknowledge.unwrap_or(self.acknowledge_writes) {
            1
        } else {
            0
        };
        WriteConcern::builder()
            .w(Acknowledgment::Nodes(nodes))
            .build()
    }

    /// [`StorageBackend::get_raw`] with per-call options.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidId`] when `use_object_id` is set and
    /// `id` is not a valid `ObjectId`, plus driver errors.
    pub async fn get_with_options(
        &self,
        kind: &str,
        id: &str,
        options: DocumentOptions,
    ) -> Result<Option<RawDocument>> {
        let filter = doc! { "_id": id_bson(id, options)? };
        let collection = self.collection(kind).await?;
        let found = self.lifecycle.settle(
            collection
                .find_one(filter)
                .await
                .map_err(StorageError::from),
        )?;
        found.map(|d| into_raw(kind, id, d)).transpose()
    }

    /// [`StorageBackend::save_raw`] with per-call options.
    ///
    /// # Errors
    /// Same as [`DocumentBackend::get_with_options`], plus
    /// [`StorageError::Serialization`] if the document has no BSON form.
    pub async fn save_with_options(
        &self,
        kind: &str,
        id: &str,
        raw: &RawDocument,
        options: DocumentOptions,
    ) -> Result<()> {
        validate_id(id)?;
        let id_value = id_bson(id, options)?;
        let mut document = bson::to_document(raw)
            .map_err(|e| StorageError::serialization(kind, id, e.to_string()))?;
        document.insert("_id", id_value.clone());

        let collection = self.collection(kind).await?;
        let replace = ReplaceOptions::builder()
            .upsert(true)
            .write_concern(self.write_concern(options))
            .build();
        self.lifecycle.settle(
            collection
                .replace_one(doc! { "_id": id_value }, document)
                .with_options(replace)
                .await
                .map_err(StorageError::from),
        )?;
        tracing::debug!(backend = "document", kind, id, "record saved");
        Ok(())
    }

    /// [`StorageBackend::delete_raw`] with per-call options.
    ///
    /// # Errors
    /// Same as [`DocumentBackend::get_with_options`].
    pub async fn delete_with_options(
        &self,
        kind: &str,
        id: &str,
        options: DocumentOptions,
    ) -> Result<()> {
        let filter = doc! { "_id": id_bson(id, options)? };
        let collection = self.collection(kind).await?;
        let delete = DeleteOptions::builder()
            .write_concern(self.write_concern(options))
            .build();
        self.lifecycle.settle(
            collection
                .delete_one(filter)
                .with_options(delete)
                .await
                .map_err(StorageError::from),
        )?;
        tracing::debug!(backend = "document", kind, id, "record deleted");
        Ok(())
    }
}

async fn find_all(
    collection: &Collection<Document>,
    filter: Document,
    options: FindOptions,
) -> Result<Vec<Document>> {
    let cursor = collection.find(filter).with_options(options).await?;
    Ok(cursor.try_collect().await?)
}

fn is_namespace_exists(err: &mongodb::error::Error) -> bool {
    matches!(&*err.kind, ErrorKind::Command(command) if command.code == NAMESPACE_EXISTS)
}

fn id_bson(id: &str, options: DocumentOptions) -> Result<Bson> {
    if options.use_object_id {
        ObjectId::parse_str(id)
            .map(Bson::ObjectId)
            .map_err(|e| StorageError::InvalidId(format!("{id}: {e}")))
    } else {
        Ok(Bson::String(id.to_owned()))
    }
}

fn id_string(id: &Bson) -> Option<String> {
    match id {
        Bson::String(s) => Some(s.clone()),
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        _ => None,
    }
}

/// Strip `_id` and convert to relaxed extended JSON.
fn into_raw(kind: &str, id: &str, mut document: Document) -> Result<RawDocument> {
    document.remove("_id");
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(raw) => Ok(raw),
        other => Err(StorageError::serialization(
            kind,
            id,
            format!("expected an object, found {other}"),
        )),
    }
}

#[async_trait]
impl StorageBackend for DocumentBackend {
    fn name(&self) -> &'static str {
        "document"
    }

    async fn init(&self) -> Result<()> {
        self.database().await.map(|_| ())
    }

    async fn dispose(&self) -> Result<()> {
        if !self.lifecycle.mark_disposed() {
            return Ok(());
        }
        self.collections.clear();
        // A connect still in flight finishes first and sees the flag.
        let connection = self
            .connection
            .get_or_try_init(|| async { Err(StorageError::Disposed) })
            .await;
        if let Ok(connection) = connection {
            connection.client.clone().shutdown().await;
            tracing::info!(backend = "document", "client shut down");
        }
        Ok(())
    }

    async fn get_raw(&self, kind: &str, id: &str) -> Result<Option<RawDocument>> {
        self.get_with_options(kind, id, DocumentOptions::default())
            .await
    }

    async fn save_raw(&self, kind: &str, id: &str, raw: &RawDocument) -> Result<()> {
        self.save_with_options(kind, id, raw, DocumentOptions::default())
            .await
    }

    async fn delete_raw(&self, kind: &str, id: &str) -> Result<()> {
        self.delete_with_options(kind, id, DocumentOptions::default())
            .await
    }

    async fn list_raw(&self, kind: &str, options: &ListOptions) -> Result<Vec<RawRecord>> {
        validate_kind(kind)?;
        let prepared = options.prepare(self.policy)?;
        if prepared.limit == Some(0) {
            return Ok(Vec::new());
        }
        let filter = prepared
            .predicate
            .as_ref()
            .map(filter::compile)
            .unwrap_or_default();
        let find = FindOptions::builder()
            .sort(filter::sort(prepared.order.as_ref()))
            .skip(u64::try_from(prepared.offset).ok())
            .limit(prepared.limit.and_then(|l| i64::try_from(l).ok()))
            .build();

        let collection = self.collection(kind).await?;
        let documents = self
            .lifecycle
            .settle(find_all(&collection, filter, find).await)?;

        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            let Some(id) = document.get("_id").and_then(id_string) else {
                tracing::warn!(backend = "document", kind, "skipping record with unsupported _id");
                continue;
            };
            match into_raw(kind, &id, document) {
                Ok(raw) => records.push(RawRecord::new(id, raw)),
                Err(err) => {
                    tracing::warn!(backend = "document", kind, id = %id, error = %err, "skipping undecodable record");
                }
            }
        }
        Ok(records)
    }

    async fn count(&self, kind: &str, query: Option<&Query>) -> Result<u64> {
        validate_kind(kind)?;
        let filter = query
            .map(|q| q.normalize(self.policy))
            .transpose()?
            .as_ref()
            .map(filter::compile)
            .unwrap_or_default();
        let collection = self.collection(kind).await?;
        self.lifecycle.settle(
            collection
                .count_documents(filter)
                .await
                .map_err(StorageError::from),
        )
    }

    async fn clear(&self) -> Result<()> {
        Err(StorageError::Unsupported(
            "clear is not supported by the document backend",
        ))
    }
}
