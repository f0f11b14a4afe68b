//! Entity contract and raw documents.
//!
//! Every persisted type is an [`Entity`]: it names its `kind` (the
//! table/collection/key-prefix namespace), its caller-assigned `id`, and
//! converts to and from a JSON object. Backends only ever see the raw form.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{EntityError, Result, StorageError};

/// Raw form of an entity: a JSON object with preserved key order.
pub type RawDocument = Map<String, Value>;

/// A raw document together with its id, as returned by `list_raw`.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    pub id: String,
    pub raw: RawDocument,
}

impl RawRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, raw: RawDocument) -> Self {
        Self { id: id.into(), raw }
    }
}

/// A persistable value.
///
/// `from_raw` consumes a template instance so callers without a static kind
/// (see [`crate::Storage::get_with`]) can still reconstruct values.
/// `template.from_raw(e.to_raw()?)` must reproduce `e`, and unknown or
/// missing fields must not fail reconstruction.
pub trait Entity: Send + Sync + Sized {
    fn kind(&self) -> &str;

    fn id(&self) -> &str;

    /// # Errors
    /// Returns [`EntityError`] if the entity cannot be represented as an object.
    fn to_raw(&self) -> std::result::Result<RawDocument, EntityError>;

    /// # Errors
    /// Returns [`EntityError`] if `raw` does not describe this entity.
    fn from_raw(self, raw: RawDocument) -> std::result::Result<Self, EntityError>;
}

/// An entity type with a static kind, usable as a type tag.
pub trait EntityType: Entity + Default {
    const KIND: &'static str;
}

/// Serde helpers for implementing [`Entity`] on derived types.
pub mod raw {
    use super::{DeserializeOwned, EntityError, RawDocument, Serialize, Value};

    /// # Errors
    /// Fails if `value` does not serialize to a JSON object.
    pub fn to_raw_document<T: Serialize>(value: &T) -> Result<RawDocument, EntityError> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(map),
            _ => Err(EntityError::NotAnObject),
        }
    }

    /// # Errors
    /// Fails if `raw` cannot be deserialized into `T`.
    pub fn from_raw_document<T: DeserializeOwned>(raw: RawDocument) -> Result<T, EntityError> {
        Ok(serde_json::from_value(Value::Object(raw))?)
    }
}

const MAX_KIND_LEN: usize = 63;

/// Kinds become table and collection names, so they must be plain identifiers.
///
/// # Errors
/// Returns [`StorageError::InvalidKind`] for anything outside
/// `[A-Za-z_][A-Za-z0-9_]*` or longer than 63 bytes.
pub fn validate_kind(kind: &str) -> Result<()> {
    let mut chars = kind.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_head && valid_tail && kind.len() <= MAX_KIND_LEN {
        Ok(())
    } else {
        Err(StorageError::InvalidKind(kind.to_owned()))
    }
}

/// # Errors
/// Returns [`StorageError::InvalidId`] for an empty id.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StorageError::InvalidId(id.to_owned()));
    }
    Ok(())
}
