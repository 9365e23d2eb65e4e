//! EK-003: Engine configuration (envkiln.yaml).
//!
//! Every field has a default so an empty or absent file is a valid config.

use super::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "envkiln.yaml";

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root holding one directory per namespace
    pub meta_root: PathBuf,

    /// Namespace search order, override layer first
    pub namespaces: Vec<String>,

    pub catalog: CatalogConfig,

    pub environment: EnvironmentConfig,

    /// Where catalog components are cloned
    pub components_dir: PathBuf,

    /// History record, environment locks, event logs
    pub state_dir: PathBuf,

    /// Failure reports written on "report and stop"
    pub reports_dir: PathBuf,

    pub advisor: AdvisorConfig,

    pub assets: AssetsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            meta_root: PathBuf::from("meta"),
            namespaces: vec!["enterprise".to_string(), "core".to_string()],
            catalog: CatalogConfig::default(),
            environment: EnvironmentConfig::default(),
            components_dir: PathBuf::from("custom_nodes"),
            state_dir: PathBuf::from("state"),
            reports_dir: PathBuf::from("reports"),
            advisor: AdvisorConfig::default(),
            assets: AssetsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Remote community index; no fetch when unset
    pub index_url: Option<String>,

    /// Local copy of the remote index
    pub index_cache: PathBuf,

    /// Overlay files, merged in order (later wins). Relative paths are
    /// looked up under each namespace's `catalogs/` directory.
    pub overlays: Vec<PathBuf>,

    /// Output of the merge, consumed by the dispatcher
    pub merged_path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            index_url: None,
            index_cache: PathBuf::from("state/cache/index.json"),
            overlays: vec![PathBuf::from("overlay.json")],
            merged_path: PathBuf::from("state/cache/catalog.json"),
        }
    }
}

/// Interpreter-level package installer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Installer {
    #[default]
    Pip,
    Uv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Environment manager binary (conda, mamba, micromamba)
    pub tool: String,

    pub installer: Installer,

    /// Temporary network policy applied around environment creation
    pub resilience: ResilienceConfig,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            tool: "conda".to_string(),
            installer: Installer::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_retries: 5,
        }
    }
}

impl ResilienceConfig {
    /// Policy used by the extended-timeouts retry strategy.
    pub fn doubled(self) -> Self {
        Self {
            timeout_secs: self.timeout_secs.saturating_mul(2),
            max_retries: self.max_retries.saturating_mul(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub enabled: bool,
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:11434/api/generate".to_string(),
            model: "gemma3:4b".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// Command run inside the environment with the asset manifest path
    /// appended, e.g. `["python", "-m", "fetch_models"]`
    pub command: Option<Vec<String>>,
}

/// Parse a config from YAML text.
pub fn parse_config(yaml: &str, origin: &Path) -> Result<EngineConfig> {
    if yaml.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_yaml_ng::from_str(yaml).map_err(|e| EngineError::Config {
        path: origin.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Load a config file. An absent file yields the defaults.
pub fn load(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        tracing::debug!("no config at {}, using defaults", path.display());
        return Ok(EngineConfig::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    parse_config(&content, path)
}

/// Template written by `envkiln init`.
pub const CONFIG_TEMPLATE: &str = r#"# envkiln configuration
meta_root: meta
namespaces: [enterprise, core]   # override layer first

catalog:
  # index_url: https://example.org/custom-node-list.json
  index_cache: state/cache/index.json
  overlays: [overlay.json]
  merged_path: state/cache/catalog.json

environment:
  tool: conda          # or mamba / micromamba
  installer: pip       # or uv
  resilience:
    timeout_secs: 120
    max_retries: 5

components_dir: custom_nodes
state_dir: state
reports_dir: reports

advisor:
  enabled: true
  url: http://localhost:11434/api/generate
  model: gemma3:4b
  timeout_secs: 60

# assets:
#   command: [python, -m, fetch_models]
"#;
