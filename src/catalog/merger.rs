//! EK-021: Catalog merger.
//!
//! The external community index is keyed by repository URL (`reference`);
//! overlays are keyed by component identifier and carry their own `url`.
//! For each overlay entry the matching external record is laid underneath
//! it, overlay fields winning field-by-field. Later overlays replace earlier
//! ones per identifier.
//!
//! Missing input files are fatal. Malformed records are skipped.

use crate::core::error::{EngineError, Result};
use crate::core::state::write_atomic;
use crate::core::types::{Catalog, CatalogEntry};
use crate::tripwire::hasher::hash_string;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Result of a merge that has been written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    pub path: PathBuf,
    pub entries: usize,
    pub skipped: usize,
    pub hash: String,
}

/// Canonical form for URL matching: trailing `/` and `.git` removed.
pub fn normalize_url(url: &str) -> String {
    let mut s = url.trim().trim_end_matches('/');
    if let Some(stripped) = s.strip_suffix(".git") {
        s = stripped.trim_end_matches('/');
    }
    s.to_string()
}

fn read_json(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(EngineError::Merge {
            path: path.to_path_buf(),
            reason: "file not found".to_string(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| EngineError::Merge {
        path: path.to_path_buf(),
        reason: format!("invalid JSON: {}", e),
    })
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Build `normalized reference → record` from an external index document.
///
/// Accepts a bare array or `{"custom_nodes": [...]}`. A record is kept when
/// it is an object whose `reference` is a non-empty string. Returns the
/// index and the count of records skipped.
pub fn index_external(doc: &Value, origin: &Path) -> Result<(HashMap<String, Map<String, Value>>, usize)> {
    let records = match doc {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("custom_nodes") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(EngineError::Merge {
                    path: origin.to_path_buf(),
                    reason: "expected an array or an object with a 'custom_nodes' array"
                        .to_string(),
                })
            }
        },
        _ => {
            return Err(EngineError::Merge {
                path: origin.to_path_buf(),
                reason: "expected an array of records".to_string(),
            })
        }
    };

    let mut index = HashMap::new();
    let mut skipped = 0;
    for (i, record) in records.iter().enumerate() {
        let Some(obj) = record.as_object() else {
            skipped += 1;
            continue;
        };
        let Some(reference) = non_empty_str(obj, "reference") else {
            skipped += 1;
            continue;
        };
        let mut fields = obj.clone();
        fields.remove("reference");
        if index.insert(normalize_url(reference), fields).is_some() {
            tracing::debug!("duplicate reference at record {} in {}", i, origin.display());
        }
    }
    if skipped > 0 {
        warn!(
            "{}: skipped {} external record(s) without a string 'reference'",
            origin.display(),
            skipped
        );
    }
    Ok((index, skipped))
}

/// Entries of one overlay document, in document order.
///
/// Accepts `{id: {...}}` or `{"custom_nodes": {id: {...}}}`. An entry is
/// kept when it is an object whose `url` is a non-empty string.
pub fn overlay_entries(doc: &Value, origin: &Path) -> Result<(Vec<(String, Map<String, Value>)>, usize)> {
    let Some(root) = doc.as_object() else {
        return Err(EngineError::Merge {
            path: origin.to_path_buf(),
            reason: "expected an object keyed by component identifier".to_string(),
        });
    };
    let table = match root.get("custom_nodes") {
        Some(Value::Object(nodes)) => nodes,
        Some(_) => {
            return Err(EngineError::Merge {
                path: origin.to_path_buf(),
                reason: "'custom_nodes' must be an object".to_string(),
            })
        }
        None => root,
    };

    let mut entries = Vec::new();
    let mut skipped = 0;
    for (id, value) in table {
        match value.as_object() {
            Some(obj) if non_empty_str(obj, "url").is_some() => {
                entries.push((id.clone(), obj.clone()))
            }
            _ => {
                warn!("{}: skipping malformed overlay entry '{}'", origin.display(), id);
                skipped += 1;
            }
        }
    }
    Ok((entries, skipped))
}

/// Merge an external index document with overlay documents (in order).
pub fn merge_documents(
    external: &Value,
    external_origin: &Path,
    overlays: &[(PathBuf, Value)],
) -> Result<(Catalog, usize)> {
    let (index, mut skipped) = index_external(external, external_origin)?;
    let mut merged: IndexMap<String, Map<String, Value>> = IndexMap::new();

    for (origin, doc) in overlays {
        let (entries, bad) = overlay_entries(doc, origin)?;
        skipped += bad;
        for (id, overlay) in entries {
            let url = non_empty_str(&overlay, "url").map(normalize_url).unwrap_or_default();
            let mut record = index.get(&url).cloned().unwrap_or_default();
            for (k, v) in overlay {
                record.insert(k, v);
            }
            // Later overlays win per identifier; keep first-seen position.
            merged.insert(id, record);
        }
    }

    let mut catalog = Catalog::default();
    for (id, record) in merged {
        match serde_json::from_value::<CatalogEntry>(Value::Object(record)) {
            Ok(entry) => {
                catalog.entries.insert(id, entry);
            }
            Err(e) => {
                warn!("catalog entry '{}' dropped: {}", id, e);
                skipped += 1;
            }
        }
    }
    Ok((catalog, skipped))
}

/// Merge the index file and overlay files, then write the merged catalog.
///
/// Nothing is written unless every input was read successfully.
pub fn merge_files(external: &Path, overlays: &[PathBuf], out: &Path) -> Result<MergeSummary> {
    let external_doc = read_json(external)?;
    let overlay_docs = overlays
        .iter()
        .map(|p| read_json(p).map(|doc| (p.clone(), doc)))
        .collect::<Result<Vec<_>>>()?;

    let (catalog, skipped) = merge_documents(&external_doc, external, &overlay_docs)?;

    let json = serde_json::to_string_pretty(&catalog).map_err(|e| EngineError::Serialize {
        what: "merged catalog".to_string(),
        reason: e.to_string(),
    })?;
    write_atomic(out, json.as_bytes())?;

    Ok(MergeSummary {
        path: out.to_path_buf(),
        entries: catalog.len(),
        skipped,
        hash: hash_string(&json),
    })
}
