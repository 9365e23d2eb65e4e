//! EK-002: Error taxonomy.
//!
//! Every variant names the file, URL or identifier involved so the operator
//! knows what to fix. Fetch failures are absorbed by the caller when a
//! cached index exists; only materialization and dispatch failures are
//! retryable. Everything else is fatal for the run.

use super::types::{FailureContext, Stage};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot fetch catalog index {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("catalog merge failed on {}: {reason}", path.display())]
    Merge { path: PathBuf, reason: String },

    #[error("recipe '{name}' not found (searched: {searched})")]
    Resolution { name: String, searched: String },

    #[error("invalid manifest {origin}: {reason}")]
    Manifest { origin: String, reason: String },

    #[error("environment '{env}' could not be created: {}", context.summary)]
    Materialization {
        env: String,
        context: Box<FailureContext>,
    },

    #[error("{component}: {}", context.summary)]
    Dispatch {
        component: String,
        context: Box<FailureContext>,
    },

    #[error("config error in {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("cannot start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("advisor unavailable: {reason}")]
    Advisor { reason: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize {what}: {reason}")]
    Serialize { what: String, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Pipeline stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Fetch { .. } => Stage::Fetch,
            Self::Merge { .. } => Stage::Merge,
            Self::Resolution { .. } | Self::Manifest { .. } | Self::Config { .. } => {
                Stage::Resolve
            }
            Self::Materialization { context, .. } | Self::Dispatch { context, .. } => {
                context.stage
            }
            Self::Spawn { .. } | Self::Advisor { .. } | Self::Io { .. } | Self::Serialize { .. } => {
                Stage::Dispatch
            }
        }
    }

    /// Whether a retry with the same inputs can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Materialization { .. } | Self::Dispatch { .. })
    }

    /// Captured context for escalation; synthesized when the error carries none.
    pub fn failure_context(&self) -> FailureContext {
        match self {
            Self::Materialization { context, .. } | Self::Dispatch { context, .. } => {
                (**context).clone()
            }
            other => FailureContext::new(other.stage(), other.to_string()),
        }
    }
}
