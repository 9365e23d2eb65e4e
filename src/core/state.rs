//! EK-013: Persistent state: environment locks and the run history record.
//!
//! Both files are small YAML documents written atomically (temp + rename)
//! so an interrupted run never leaves a truncated record behind.

use super::error::{EngineError, Result};
use super::types::{InstallState, RetryStrategy};
use crate::tripwire::eventlog::now_iso8601;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Atomic writes
// ============================================================================

/// Write `bytes` to `path` via a sibling temp file and rename.
/// Creates parent directories as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
    }
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    std::fs::write(&tmp_path, bytes).map_err(|e| EngineError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        EngineError::io(path, e)
    })?;
    Ok(())
}

fn to_yaml<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_yaml_ng::to_string(value).map_err(|e| EngineError::Serialize {
        what: what.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Environment lock
// ============================================================================

/// Convergence record for one named environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvLock {
    pub schema: String,
    pub environment: String,
    pub generated_at: String,
    pub generator: String,
    pub components: IndexMap<String, ComponentLock>,
}

/// Per-component (or per-batch) lock entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentLock {
    pub kind: String,
    pub applied_at: String,
    pub hash: String,
    #[serde(default)]
    pub details: IndexMap<String, String>,
}

impl EnvLock {
    pub fn new(environment: &str) -> Self {
        Self {
            schema: "1.0".to_string(),
            environment: environment.to_string(),
            generated_at: now_iso8601(),
            generator: format!("envkiln {}", env!("CARGO_PKG_VERSION")),
            components: IndexMap::new(),
        }
    }

    /// Hash recorded for `key`, if any.
    pub fn hash_of(&self, key: &str) -> Option<&str> {
        self.components.get(key).map(|c| c.hash.as_str())
    }

    pub fn record(&mut self, key: &str, kind: &str, hash: String, details: IndexMap<String, String>) {
        self.components.insert(
            key.to_string(),
            ComponentLock {
                kind: kind.to_string(),
                applied_at: now_iso8601(),
                hash,
                details,
            },
        );
    }
}

/// Derive the lock file path for an environment within the state directory.
pub fn lock_file_path(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir.join(environment).join("state.lock.yaml")
}

/// Load an environment lock. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, environment: &str) -> Result<Option<EnvLock>> {
    let path = lock_file_path(state_dir, environment);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
    let lock: EnvLock = serde_yaml_ng::from_str(&content).map_err(|e| EngineError::Config {
        path: path.clone(),
        reason: format!("invalid lock file: {}", e),
    })?;
    Ok(Some(lock))
}

/// Save an environment lock atomically.
pub fn save_lock(state_dir: &Path, lock: &EnvLock) -> Result<()> {
    let path = lock_file_path(state_dir, &lock.environment);
    let yaml = to_yaml(lock, "environment lock")?;
    write_atomic(&path, yaml.as_bytes())
}

// ============================================================================
// History record
// ============================================================================

/// Record carried between invocations while a retry is pending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(flatten)]
    pub state: InstallState,

    /// Strategy chosen for the next attempt
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Attempts made so far
    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub updated_at: Option<String>,
}

pub fn history_path(state_dir: &Path) -> PathBuf {
    state_dir.join("history.yaml")
}

/// Load the history record. Returns None if absent; a corrupt record is
/// discarded with a warning rather than blocking the run.
pub fn load_history(state_dir: &Path) -> Result<Option<History>> {
    let path = history_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
    match serde_yaml_ng::from_str(&content) {
        Ok(history) => Ok(Some(history)),
        Err(e) => {
            tracing::warn!("ignoring unreadable history {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

pub fn save_history(state_dir: &Path, history: &History) -> Result<()> {
    let mut history = history.clone();
    history.updated_at = Some(now_iso8601());
    let yaml = to_yaml(&history, "history record")?;
    write_atomic(&history_path(state_dir), yaml.as_bytes())
}

/// Delete the history record; absent is fine.
pub fn clear_history(state_dir: &Path) -> Result<()> {
    let path = history_path(state_dir);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io(&path, e)),
    }
}
