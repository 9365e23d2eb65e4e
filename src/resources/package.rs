//! EK-030: Package batches: version normalization, requirement harvesting,
//! installer invocations.
//!
//! Packages are never installed one by one. The dispatcher accumulates two
//! batches (environment-manager packages and interpreter packages) and runs
//! one installer call per batch, so a conflict surfaces once.

use crate::core::config::Installer;
use crate::core::types::{ComponentSpec, RetryStrategy};
use crate::transport::envtool::EnvTool;
use crate::transport::Invocation;
use crate::tripwire::hasher::hash_items;
use indexmap::IndexMap;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Version operators passed through untouched. Longest first.
const OPERATORS: &[&str] = &["===", "==", "!=", "~=", ">=", "<=", ">", "<", "="];

/// Turn a (name, version) pair into an installer requirement string.
///
/// - no version, `*` or `latest` → `name`
/// - version starting with an operator → `name` + version, unchanged
/// - anything else (`3.10`, `2`, `1.0.0rc1`) → `name==version`
pub fn normalize_requirement(name: &str, version: Option<&str>) -> String {
    let name = name.trim();
    match version.map(str::trim) {
        None | Some("") | Some("*") | Some("latest") => name.to_string(),
        Some(v) if OPERATORS.iter().any(|op| v.starts_with(op)) => format!("{}{}", name, v),
        Some(v) => format!("{}=={}", name, v),
    }
}

/// Requirement for a package component; None for clone-type components.
pub fn component_requirement(spec: &ComponentSpec) -> Option<String> {
    match spec {
        ComponentSpec::IsolatedEnvPackage { source, version, .. }
        | ComponentSpec::InterpreterPackage { source, version } => {
            Some(normalize_requirement(source, version.as_deref()))
        }
        ComponentSpec::RepositoryClone { .. } | ComponentSpec::CatalogComponent { .. } => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchEntry {
    requirement: String,
    explicit: bool,
}

/// Ordered, de-duplicated package batch keyed by lower-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageBatch {
    entries: IndexMap<String, BatchEntry>,
}

impl PackageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package declared in the manifest. Replaces any earlier entry.
    pub fn add_explicit(&mut self, name: &str, requirement: String) {
        self.entries.insert(
            name.trim().to_lowercase(),
            BatchEntry {
                requirement,
                explicit: true,
            },
        );
    }

    /// Add a harvested package. Last harvested wins; never overrides an
    /// explicit entry.
    pub fn add_harvested(&mut self, name: &str, requirement: String) {
        let key = name.trim().to_lowercase();
        if self.entries.get(&key).is_some_and(|e| e.explicit) {
            return;
        }
        self.entries.insert(
            key,
            BatchEntry {
                requirement,
                explicit: false,
            },
        );
    }

    pub fn requirements(&self) -> Vec<String> {
        self.entries.values().map(|e| e.requirement.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fingerprint of the batch contents, in install order.
    pub fn hash(&self) -> String {
        hash_items(&self.requirements())
    }
}

static REQUIREMENT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-]+)(\[[^\]]*\])?\s*(.*)$").expect("invalid regex")
});

/// Parse requirements.txt text into `(name, requirement)` pairs.
///
/// Comments, blank lines and option lines (`-r`, `--index-url`, ...) are
/// skipped. Direct URL requirements are keyed by the whole line.
pub fn parse_requirements(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in text.lines() {
        let line = match raw.find(" #") {
            Some(i) => &raw[..i],
            None => raw,
        }
        .trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        if line.contains("://") {
            out.push((line.to_lowercase(), line.to_string()));
            continue;
        }
        if let Some(caps) = REQUIREMENT_LINE.captures(line) {
            let name = caps.get(1).map_or("", |m| m.as_str());
            let extras = caps.get(2).map_or("", |m| m.as_str());
            let spec = caps.get(3).map_or("", |m| m.as_str()).trim();
            out.push((name.to_lowercase(), format!("{}{}{}", name, extras, spec)));
        }
    }
    out
}

/// Every requirements.txt below `root`, sorted for determinism.
pub fn find_requirement_files(root: &Path) -> Vec<PathBuf> {
    let pattern = root.join("**").join("requirements.txt");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
        Err(e) => {
            tracing::warn!("bad requirements glob {}: {}", pattern, e);
            Vec::new()
        }
    };
    files.sort();
    files
}

/// Harvest requirements from the given clone directories into `batch`.
/// Returns the number of files read.
pub fn harvest_requirements(dirs: &[PathBuf], batch: &mut PackageBatch) -> usize {
    let mut read = 0;
    for dir in dirs {
        for file in find_requirement_files(dir) {
            match std::fs::read_to_string(&file) {
                Ok(text) => {
                    read += 1;
                    for (name, req) in parse_requirements(&text) {
                        batch.add_harvested(&name, req);
                    }
                }
                Err(e) => tracing::warn!("cannot read {}: {}", file.display(), e),
            }
        }
    }
    read
}

/// Interpreter batch install, run inside the environment.
pub fn interpreter_install(
    tool: &EnvTool,
    env: &str,
    installer: Installer,
    strategy: RetryStrategy,
    requirements: &[String],
) -> Invocation {
    let mut cmd: Vec<String> = match installer {
        Installer::Pip => ["python", "-m", "pip", "install"].map(String::from).to_vec(),
        Installer::Uv => ["uv", "pip", "install", "--system"].map(String::from).to_vec(),
    };
    match (installer, strategy) {
        (Installer::Pip, RetryStrategy::NoCache) => cmd.push("--no-cache-dir".to_string()),
        (Installer::Uv, RetryStrategy::NoCache) => cmd.push("--no-cache".to_string()),
        (Installer::Pip, RetryStrategy::ExtendedTimeouts) => {
            cmd.extend(["--timeout", "120", "--retries", "10"].map(String::from));
        }
        _ => {}
    }
    cmd.extend(requirements.iter().cloned());

    let inv = tool.run_in(env, cmd);
    match installer {
        Installer::Uv => inv
            .env("UV_CONCURRENT_DOWNLOADS", "4")
            .env("UV_LINK_MODE", "copy"),
        Installer::Pip => inv,
    }
}

/// Environment-manager batch install into an existing environment.
pub fn environment_install(
    tool: &EnvTool,
    env: &str,
    channels: &[String],
    requirements: &[String],
) -> Invocation {
    tool.install(env, channels, requirements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ek030_normalize_bare_version_pins() {
        assert_eq!(normalize_requirement("toolkit", Some("3.12")), "toolkit==3.12");
        assert_eq!(normalize_requirement("python", Some("3.10")), "python==3.10");
    }

    #[test]
    fn test_ek030_normalize_operator_passthrough() {
        assert_eq!(normalize_requirement("libX", Some(">=1.0")), "libX>=1.0");
        assert_eq!(normalize_requirement("a", Some("==2.1.0")), "a==2.1.0");
        assert_eq!(normalize_requirement("a", Some("~=1.4")), "a~=1.4");
        assert_eq!(normalize_requirement("a", Some("!=1.3")), "a!=1.3");
        assert_eq!(normalize_requirement("a", Some("<3")), "a<3");
        assert_eq!(normalize_requirement("a", Some("===1.0")), "a===1.0");
    }

    #[test]
    fn test_ek030_normalize_unconstrained() {
        assert_eq!(normalize_requirement("numpy", None), "numpy");
        assert_eq!(normalize_requirement("numpy", Some("")), "numpy");
        assert_eq!(normalize_requirement("numpy", Some("latest")), "numpy");
    }

    #[test]
    fn test_ek030_batch_explicit_wins() {
        let mut batch = PackageBatch::new();
        batch.add_explicit("Torch", "torch==2.1.0".to_string());
        batch.add_harvested("torch", "torch>=1.0".to_string());
        batch.add_harvested("numpy", "numpy<2".to_string());
        batch.add_harvested("NumPy", "numpy>=1.24".to_string());
        assert_eq!(batch.requirements(), vec!["torch==2.1.0", "numpy>=1.24"]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_ek030_batch_hash_tracks_content() {
        let mut a = PackageBatch::new();
        a.add_explicit("libX", "libX>=2.0".to_string());
        let mut b = a.clone();
        assert_eq!(a.hash(), b.hash());
        b.add_harvested("numpy", "numpy".to_string());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_ek030_parse_requirements() {
        let text = "\
# comment
numpy>=1.24
Pillow

-r other.txt
--extra-index-url https://x
opencv-python[contrib] ==4.8.0  # pinned
git+https://github.com/o/r.git
";
        let reqs = parse_requirements(text);
        assert_eq!(
            reqs,
            vec![
                ("numpy".to_string(), "numpy>=1.24".to_string()),
                ("pillow".to_string(), "Pillow".to_string()),
                (
                    "opencv-python".to_string(),
                    "opencv-python[contrib]==4.8.0".to_string()
                ),
                (
                    "git+https://github.com/o/r.git".to_string(),
                    "git+https://github.com/o/r.git".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_ek030_harvest_from_clones() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("node-a");
        let b = dir.path().join("node-b").join("sub");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(a.join("requirements.txt"), "numpy<2\nscipy\n").unwrap();
        std::fs::write(b.join("requirements.txt"), "numpy>=1.26\n").unwrap();

        let mut batch = PackageBatch::new();
        let read = harvest_requirements(
            &[dir.path().join("node-a"), dir.path().join("node-b")],
            &mut batch,
        );
        assert_eq!(read, 2);
        assert_eq!(batch.requirements(), vec!["numpy>=1.26", "scipy"]);
    }

    #[test]
    fn test_ek030_pip_invocation() {
        let tool = EnvTool::new("conda");
        let inv = interpreter_install(
            &tool,
            "envA",
            Installer::Pip,
            RetryStrategy::NoCache,
            &["libX>=2.0".to_string()],
        );
        assert_eq!(
            inv.to_string(),
            "conda run -n envA python -m pip install --no-cache-dir libX>=2.0"
        );
        assert!(inv.env.is_empty());
    }

    #[test]
    fn test_ek030_pip_extended_timeouts() {
        let tool = EnvTool::new("conda");
        let inv = interpreter_install(
            &tool,
            "envA",
            Installer::Pip,
            RetryStrategy::ExtendedTimeouts,
            &["a".to_string()],
        );
        assert!(inv.to_string().contains("--timeout 120 --retries 10 a"));
    }

    #[test]
    fn test_ek030_uv_invocation() {
        let tool = EnvTool::new("micromamba");
        let inv = interpreter_install(
            &tool,
            "envA",
            Installer::Uv,
            RetryStrategy::Standard,
            &["a".to_string(), "b==1".to_string()],
        );
        assert_eq!(
            inv.to_string(),
            "micromamba run -n envA uv pip install --system a b==1"
        );
        assert!(inv
            .env
            .contains(&("UV_LINK_MODE".to_string(), "copy".to_string())));
    }

    #[test]
    fn test_ek030_component_requirement() {
        let spec = ComponentSpec::IsolatedEnvPackage {
            source: "toolkit".to_string(),
            version: Some("3.12".to_string()),
            channel: None,
        };
        assert_eq!(component_requirement(&spec).as_deref(), Some("toolkit==3.12"));
        let clone = ComponentSpec::CatalogComponent {
            source: "x".to_string(),
            version: None,
        };
        assert!(component_requirement(&clone).is_none());
    }
}
