//! Key scheme and in-memory list pipeline shared by the memory and embedded
//! adapters: decode, filter, sort, window.

use strata_query::{Filter, PreparedList, Predicate};

use crate::entity::{RawDocument, RawRecord};
use crate::error::{Result, StorageError};

/// Kind segment of a record key. Kinds never contain `-`, so writing their
/// `_` as `-` leaves the first `_` of every key as the kind/id separator:
/// `("change_log", "x")` and `("change", "log_x")` get distinct keys.
fn key_kind(kind: &str) -> String {
    kind.replace('_', "-")
}

/// `"{kind}_{id}"`, with the kind segment from [`key_kind`].
pub fn record_key(kind: &str, id: &str) -> String {
    format!("{}_{id}", key_kind(kind))
}

/// Half-open key range covering every record of `kind`, optionally narrowed
/// to ids in `[from, until)`.
pub fn key_range(kind: &str, from: Option<&str>, until: Option<&str>) -> (String, String) {
    let start = record_key(kind, from.unwrap_or_default());
    // '`' is the byte right after '_', so this bounds the whole prefix.
    let end = until.map_or_else(
        || format!("{}`", key_kind(kind)),
        |until| record_key(kind, until),
    );
    (start, end)
}

pub fn decode(kind: &str, id: &str, bytes: &[u8]) -> Result<RawDocument> {
    serde_json::from_slice(bytes)
        .map_err(|e| StorageError::serialization(kind, id, e.to_string()))
}

pub fn encode(kind: &str, id: &str, raw: &RawDocument) -> Result<Vec<u8>> {
    serde_json::to_vec(raw)
        .map_err(|e| StorageError::serialization(kind, id, e.to_string()))
}

/// Decode and filter `(id, bytes)` entries; undecodable entries are logged
/// and skipped.
pub fn matching<I, B>(
    kind: &str,
    entries: I,
    predicate: Option<&Predicate>,
) -> Result<Vec<RawRecord>>
where
    I: IntoIterator<Item = (String, B)>,
    B: AsRef<[u8]>,
{
    let filter = predicate.map(Filter::compile).transpose()?;
    let mut records = Vec::new();
    for (id, bytes) in entries {
        let raw = match decode(kind, &id, bytes.as_ref()) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(kind, id = %id, error = %err, "skipping undecodable record");
                continue;
            }
        };
        if filter.as_ref().is_none_or(|f| f.matches(&raw)) {
            records.push(RawRecord::new(id, raw));
        }
    }
    Ok(records)
}

/// Full list pipeline over a key-ordered scan.
pub fn list<I, B>(kind: &str, entries: I, prepared: &PreparedList) -> Result<Vec<RawRecord>>
where
    I: IntoIterator<Item = (String, B)>,
    B: AsRef<[u8]>,
{
    let mut records = matching(kind, entries, prepared.predicate.as_ref())?;
    if let Some(order) = &prepared.order {
        records.sort_by(|a, b| order.compare((a.id.as_str(), &a.raw), (b.id.as_str(), &b.raw)));
    } else {
        records.sort_by(|a, b| a.id.cmp(&b.id));
    }
    Ok(prepared.window(records))
}

/// Strip the `"{kind}_"` prefix from a stored key.
pub fn id_from_key(kind: &str, key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    key.strip_prefix(key_kind(kind).as_str())?
        .strip_prefix('_')
        .map(str::to_owned)
}
