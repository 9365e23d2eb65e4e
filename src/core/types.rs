//! EK-001: Domain types: manifests, components, catalog entries, run state.
//!
//! Manifests arrive as untyped documents (YAML or JSON) and are lowered into
//! closed Rust types here. Component kinds form a sum type so the dispatcher
//! matches exhaustively; unknown kinds are dropped at the parse boundary.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Pipeline stages
// ============================================================================

/// A stage of one resolution run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Merge,
    Resolve,
    Materialize,
    Dispatch,
    Assets,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::Merge => write!(f, "merge"),
            Self::Resolve => write!(f, "resolve"),
            Self::Materialize => write!(f, "materialize"),
            Self::Dispatch => write!(f, "dispatch"),
            Self::Assets => write!(f, "assets"),
        }
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// One merged catalog record, keyed by component identifier in [`Catalog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Repository URL the component is cloned from
    pub url: String,

    /// Optional version/branch pin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Everything else the external index or overlay carried
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Merged lookup table: component identifier → entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    pub entries: IndexMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Components
// ============================================================================

/// A single installable unit declared by a manifest.
///
/// The legacy tags (`conda`, `pip`, `git-clone`, `custom-node`) are accepted
/// as aliases of the canonical kebab-case kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ComponentSpec {
    /// Package installed by the environment manager itself.
    #[serde(alias = "conda")]
    IsolatedEnvPackage {
        source: String,
        #[serde(default, deserialize_with = "de_version")]
        version: Option<String>,
        #[serde(default)]
        channel: Option<String>,
    },

    /// Package installed by the interpreter's package installer.
    #[serde(alias = "pip")]
    InterpreterPackage {
        source: String,
        #[serde(default, deserialize_with = "de_version")]
        version: Option<String>,
    },

    /// Repository cloned to an explicit path.
    #[serde(alias = "git-clone")]
    RepositoryClone {
        source: String,
        #[serde(default, deserialize_with = "de_version")]
        version: Option<String>,
        #[serde(deserialize_with = "de_target_path")]
        path: PathBuf,
    },

    /// Component looked up in the merged catalog by identifier (or URL).
    #[serde(alias = "custom-node")]
    CatalogComponent {
        source: String,
        #[serde(default, deserialize_with = "de_version")]
        version: Option<String>,
    },
}

impl ComponentSpec {
    /// Canonical kind tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IsolatedEnvPackage { .. } => "isolated-env-package",
            Self::InterpreterPackage { .. } => "interpreter-package",
            Self::RepositoryClone { .. } => "repository-clone",
            Self::CatalogComponent { .. } => "catalog-component",
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::IsolatedEnvPackage { source, .. }
            | Self::InterpreterPackage { source, .. }
            | Self::RepositoryClone { source, .. }
            | Self::CatalogComponent { source, .. } => source,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            Self::IsolatedEnvPackage { version, .. }
            | Self::InterpreterPackage { version, .. }
            | Self::RepositoryClone { version, .. }
            | Self::CatalogComponent { version, .. } => version.as_deref(),
        }
    }

    /// Stable key used for inheritance merges and lock entries.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind(), self.source())
    }
}

impl fmt::Display for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version() {
            Some(v) => write!(f, "{} {}@{}", self.kind(), self.source(), v),
            None => write!(f, "{} {}", self.kind(), self.source()),
        }
    }
}

/// Accept `version: "3.10"` as well as unquoted numbers.
///
/// Unquoted YAML floats lose trailing zeros (`3.10` → `3.1`); manifests
/// should quote versions.
fn de_version<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// Clone targets must name a path; blank strings are rejected.
fn de_target_path<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(serde::de::Error::custom("repository-clone needs a non-empty 'path'"));
    }
    Ok(PathBuf::from(trimmed))
}

// ============================================================================
// Manifest
// ============================================================================

/// A resolved use-case manifest. Immutable for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentManifest {
    /// Use-case identifier the manifest was resolved from
    pub use_case: String,

    /// Runtime environment name
    pub name: String,

    /// Extra package channels for the environment manager
    pub channels: Vec<String>,

    /// Packages the environment is created with
    pub environment: Vec<ComponentSpec>,

    /// Application-level components, in manifest order
    pub components: Vec<ComponentSpec>,

    /// Asset sub-manifest reference
    pub assets: Option<String>,

    /// Component tags that were not understood and skipped
    pub skipped: Vec<String>,
}

// ============================================================================
// Run state
// ============================================================================

/// Failure context captured for the retry/escalation controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Stage that failed
    pub stage: Stage,

    /// One-line human summary
    pub summary: String,

    /// Constructed argument list of the failing tool call, if any
    #[serde(default)]
    pub args: Vec<String>,

    /// Tail of the underlying tool's error output
    #[serde(default)]
    pub stderr: String,
}

impl FailureContext {
    pub fn new(stage: Stage, summary: impl Into<String>) -> Self {
        Self {
            stage,
            summary: summary.into(),
            args: Vec::new(),
            stderr: String::new(),
        }
    }
}

/// Mutable state of one orchestrated run, handed to each attempt explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallState {
    /// Selected use-case identifier
    #[serde(default)]
    pub use_case: Option<String>,

    /// Active environment name
    #[serde(default)]
    pub env_name: Option<String>,

    /// Last captured failure
    #[serde(default)]
    pub last_failure: Option<FailureContext>,
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure(FailureContext),
    FatalFailure(FailureContext),
    UserAbort,
}

/// Adjustment applied to the next attempt after a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry unchanged
    #[default]
    Standard,
    /// Bypass installer caches
    NoCache,
    /// Double network timeouts and retry counts
    ExtendedTimeouts,
    /// Skip the remote index fetch and use the cached catalog
    OfflineCatalog,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::NoCache => write!(f, "no-cache"),
            Self::ExtendedTimeouts => write!(f, "extended-timeouts"),
            Self::OfflineCatalog => write!(f, "offline-catalog"),
        }
    }
}

// ============================================================================
// Dispatch outcomes
// ============================================================================

/// Why a component was not acted upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A valid clone is already in place
    AlreadyPresent,
    /// The target holds unrelated data; never touched
    ProtectedPath,
    /// Batch hash matches the lock
    Unchanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyPresent => write!(f, "already present"),
            Self::ProtectedPath => write!(f, "protected path"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Outcome of converging one component or batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentOutcome {
    Cloned,
    Updated,
    Installed,
    Skipped(SkipReason),
}

impl fmt::Display for ComponentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cloned => write!(f, "CLONED"),
            Self::Updated => write!(f, "UPDATED"),
            Self::Installed => write!(f, "INSTALLED"),
            Self::Skipped(reason) => write!(f, "SKIPPED ({})", reason),
        }
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        use_case: String,
        run_id: String,
        strategy: RetryStrategy,
        envkiln_version: String,
    },
    CatalogMerged {
        entries: usize,
        /// Fingerprint of the cached remote index the merge started from
        index_hash: String,
        hash: String,
    },
    EnvironmentReused {
        environment: String,
    },
    EnvironmentCreated {
        environment: String,
        packages: Vec<String>,
        duration_seconds: f64,
    },
    ComponentConverged {
        component: String,
        outcome: String,
    },
    BatchInstalled {
        batch: String,
        packages: Vec<String>,
        hash: String,
    },
    AttemptFailed {
        stage: Stage,
        error: String,
    },
    RunCompleted {
        run_id: String,
        outcome: String,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Tests
// ============================================================================
