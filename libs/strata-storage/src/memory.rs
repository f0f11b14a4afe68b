//! In-process backend for tests and ephemeral use.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use strata_query::{ListOptions, OperandPolicy, Query};

use crate::backend::{Lifecycle, StorageBackend};
use crate::entity::{RawDocument, RawRecord, validate_id, validate_kind};
use crate::error::Result;
use crate::scan;

/// `BTreeMap` of JSON-encoded records keyed `"{kind}_{id}"`.
///
/// Records are stored encoded so reads never hand out shared state, matching
/// what a persistent backend returns.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
    policy: OperandPolicy,
    lifecycle: Lifecycle,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_operand_policy(mut self, policy: OperandPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn snapshot(&self, kind: &str) -> Vec<(String, Vec<u8>)> {
        let (start, end) = scan::key_range(kind, None, None);
        self.records
            .read()
            .range(start..end)
            .filter_map(|(key, bytes)| {
                scan::id_from_key(kind, key.as_bytes()).map(|id| (id, bytes.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(&self) -> Result<()> {
        self.lifecycle.ensure_open()
    }

    async fn dispose(&self) -> Result<()> {
        if self.lifecycle.mark_disposed() {
            self.records.write().clear();
            tracing::info!(backend = "memory", "storage disposed");
        }
        Ok(())
    }

    async fn get_raw(&self, kind: &str, id: &str) -> Result<Option<RawDocument>> {
        self.lifecycle.ensure_open()?;
        validate_kind(kind)?;
        let key = scan::record_key(kind, id);
        let bytes = self.records.read().get(&key).cloned();
        bytes.map(|b| scan::decode(kind, id, &b)).transpose()
    }

    async fn save_raw(&self, kind: &str, id: &str, raw: &RawDocument) -> Result<()> {
        self.lifecycle.ensure_open()?;
        validate_kind(kind)?;
        validate_id(id)?;
        let bytes = scan::encode(kind, id, raw)?;
        self.records
            .write()
            .insert(scan::record_key(kind, id), bytes);
        tracing::debug!(backend = "memory", kind, id, "record saved");
        Ok(())
    }

    async fn delete_raw(&self, kind: &str, id: &str) -> Result<()> {
        self.lifecycle.ensure_open()?;
        validate_kind(kind)?;
        self.records.write().remove(&scan::record_key(kind, id));
        tracing::debug!(backend = "memory", kind, id, "record deleted");
        Ok(())
    }

    async fn list_raw(&self, kind: &str, options: &ListOptions) -> Result<Vec<RawRecord>> {
        self.lifecycle.ensure_open()?;
        validate_kind(kind)?;
        let prepared = options.prepare(self.policy)?;
        scan::list(kind, self.snapshot(kind), &prepared)
    }

    async fn count(&self, kind: &str, query: Option<&Query>) -> Result<u64> {
        self.lifecycle.ensure_open()?;
        validate_kind(kind)?;
        let predicate = query.map(|q| q.normalize(self.policy)).transpose()?;
        let matching = scan::matching(kind, self.snapshot(kind), predicate.as_ref())?;
        Ok(matching.len() as u64)
    }

    async fn clear(&self) -> Result<()> {
        self.lifecycle.ensure_open()?;
        self.records.write().clear();
        tracing::info!(backend = "memory", "storage cleared");
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> RawDocument {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let backend = MemoryBackend::new();
        backend
            .save_raw("a", "1", &doc(json!({"x": 1})))
            .await
            .unwrap();
        backend
            .save_raw("b", "1", &doc(json!({"x": 2})))
            .await
            .unwrap();

        assert_eq!(backend.count("a", None).await.unwrap(), 1);
        let a = backend.get_raw("a", "1").await.unwrap().unwrap();
        assert_eq!(a["x"], json!(1));
    }

    #[tokio::test]
    async fn test_underscore_kinds_do_not_collide() {
        let backend = MemoryBackend::new();
        let first = doc(json!({"who": "change_log/x"}));
        let second = doc(json!({"who": "change/log_x"}));
        backend.save_raw("change_log", "x", &first).await.unwrap();
        backend.save_raw("change", "log_x", &second).await.unwrap();

        assert_eq!(
            backend.get_raw("change_log", "x").await.unwrap(),
            Some(first)
        );
        assert_eq!(
            backend.get_raw("change", "log_x").await.unwrap(),
            Some(second)
        );
        assert_eq!(backend.count("change_log", None).await.unwrap(), 1);
        let listed = backend
            .list_raw("change", &ListOptions::new())
            .await
            .unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["log_x"]);
    }

    #[tokio::test]
    async fn test_invalid_kind_fails_before_io() {
        let backend = MemoryBackend::new();
        let err = backend
            .save_raw("bad kind", "1", &RawDocument::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKind(_)));
    }

    #[tokio::test]
    async fn test_disposed_backend_rejects_operations() {
        let backend = MemoryBackend::new();
        backend.init().await.unwrap();
        backend.dispose().await.unwrap();
        backend.dispose().await.unwrap();

        let err = backend.get_raw("a", "1").await.unwrap_err();
        assert!(matches!(err, StorageError::Disposed));
    }
}
