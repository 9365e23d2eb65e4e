//! EK-004: Manifest parsing and validation.
//!
//! Manifests are JSON or YAML (chosen by extension) with a top-level
//! `environment` block (name, channels, components) and an application
//! `components` list. Components are lowered into [`ComponentSpec`]:
//! - a known `type` that fails to deserialize is an error
//! - an unknown `type` is logged and recorded in `skipped`

use super::error::{EngineError, Result};
use super::types::*;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    environment: Option<RawEnvironment>,
    #[serde(default)]
    components: Vec<Value>,
    #[serde(default)]
    assets: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvironment {
    name: String,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default, alias = "packages")]
    components: Vec<Value>,
}

/// Canonical kind for a component `type` tag, legacy aliases included.
pub fn canonical_tag(tag: &str) -> Option<&'static str> {
    match tag {
        "isolated-env-package" | "conda" => Some("isolated-env-package"),
        "interpreter-package" | "pip" => Some("interpreter-package"),
        "repository-clone" | "git-clone" => Some("repository-clone"),
        "catalog-component" | "custom-node" => Some("catalog-component"),
        _ => None,
    }
}

/// Parse document text into an untyped value, format by `origin` extension.
pub fn parse_document(content: &str, origin: &Path) -> Result<Value> {
    let manifest_err = |reason: String| EngineError::Manifest {
        origin: origin.display().to_string(),
        reason,
    };
    match origin.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            serde_json::from_str(content).map_err(|e| manifest_err(format!("JSON parse error: {}", e)))
        }
        _ => serde_yaml_ng::from_str(content)
            .map_err(|e| manifest_err(format!("YAML parse error: {}", e))),
    }
}

/// Read and parse a manifest document from disk.
pub fn load_document(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    parse_document(&content, path)
}

fn lower_components(
    values: &[Value],
    section: &str,
    origin: &str,
    skipped: &mut Vec<String>,
) -> Result<Vec<ComponentSpec>> {
    let mut specs = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        let tag = value.get("type").and_then(Value::as_str).unwrap_or("");
        if canonical_tag(tag).is_none() {
            let label = if tag.is_empty() { "<missing type>" } else { tag };
            warn!("{}: {}[{}] has unknown type '{}', skipping", origin, section, i, label);
            skipped.push(label.to_string());
            continue;
        }
        let spec: ComponentSpec =
            serde_json::from_value(value.clone()).map_err(|e| EngineError::Manifest {
                origin: origin.to_string(),
                reason: format!("{}[{}] ({}): {}", section, i, tag, e),
            })?;
        specs.push(spec);
    }
    Ok(specs)
}

/// Lower an untyped manifest document.
pub fn manifest_from_value(use_case: &str, doc: &Value, origin: &str) -> Result<EnvironmentManifest> {
    let raw: RawManifest =
        serde_json::from_value(doc.clone()).map_err(|e| EngineError::Manifest {
            origin: origin.to_string(),
            reason: e.to_string(),
        })?;
    let env = raw.environment.ok_or_else(|| EngineError::Manifest {
        origin: origin.to_string(),
        reason: "missing 'environment' section".to_string(),
    })?;

    let mut skipped = Vec::new();
    let environment = lower_components(&env.components, "environment.components", origin, &mut skipped)?;
    let components = lower_components(&raw.components, "components", origin, &mut skipped)?;

    Ok(EnvironmentManifest {
        use_case: use_case.to_string(),
        name: env.name.trim().to_string(),
        channels: env.channels,
        environment,
        components,
        assets: raw.assets.filter(|a| !a.trim().is_empty()),
        skipped,
    })
}

/// Parse a manifest file; the use case is named after the file stem.
pub fn parse_manifest_file(path: &Path) -> Result<EnvironmentManifest> {
    let doc = load_document(path)?;
    let use_case = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    manifest_from_value(&use_case, &doc, &path.display().to_string())
}

/// Environment names become directory names under the state dir and the
/// `-n` argument of the environment tool.
pub fn is_safe_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Validate, failing with every problem listed in one `Manifest` error.
pub fn ensure_valid(manifest: &EnvironmentManifest, origin: &str) -> Result<()> {
    let errors = validate_manifest(manifest);
    if errors.is_empty() {
        return Ok(());
    }
    Err(EngineError::Manifest {
        origin: origin.to_string(),
        reason: errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; "),
    })
}

/// Validate a parsed manifest. Returns a list of errors (empty = valid).
pub fn validate_manifest(manifest: &EnvironmentManifest) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut error = |message: String| errors.push(ValidationError { message });

    if manifest.name.is_empty() {
        error("environment name must not be empty".to_string());
    } else if !is_safe_env_name(&manifest.name) {
        error(format!(
            "environment name '{}' must start with a letter or digit and hold only letters, digits, '.', '_' or '-'",
            manifest.name
        ));
    }

    for ch in &manifest.channels {
        if ch.trim().is_empty() {
            error("channel list contains an empty entry".to_string());
        }
    }

    let mut targets = HashSet::new();
    let all = manifest.environment.iter().chain(manifest.components.iter());
    for spec in all {
        if spec.source().trim().is_empty() {
            error(format!("{} has an empty source", spec.kind()));
        }
        if let ComponentSpec::RepositoryClone { source, path, .. } = spec {
            if path.as_os_str().is_empty() {
                error(format!("repository-clone '{}' has no target path", source));
            } else if !targets.insert(path.clone()) {
                error(format!(
                    "repository-clone target {} is used more than once",
                    path.display()
                ));
            }
        }
    }

    for spec in &manifest.environment {
        if matches!(
            spec,
            ComponentSpec::RepositoryClone { .. } | ComponentSpec::CatalogComponent { .. }
        ) {
            error(format!(
                "environment.components may only hold packages, found {}",
                spec.kind()
            ));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const DEMO: &str = r#"
environment:
  name: envA
  channels: [conda-forge]
  components:
    - type: isolated-env-package
      source: toolkit
      version: "3.12"
components:
  - type: interpreter-package
    source: libX
    version: ">=2.0"
  - type: repository-clone
    source: https://example/repo.git
    path: /work/repo
"#;

    fn parse_yaml(yaml: &str) -> Result<EnvironmentManifest> {
        let doc = parse_document(yaml, Path::new("demo.yaml"))?;
        manifest_from_value("demo", &doc, "demo.yaml")
    }

    #[test]
    fn test_ek004_parse_valid() {
        let m = parse_yaml(DEMO).unwrap();
        assert_eq!(m.name, "envA");
        assert_eq!(m.channels, vec!["conda-forge"]);
        assert_eq!(m.environment.len(), 1);
        assert_eq!(m.components.len(), 2);
        assert!(m.skipped.is_empty());
        let errors = validate_manifest(&m);
        assert!(
            errors.is_empty(),
            "unexpected errors: {:?}",
            errors.iter().map(|e| &e.message).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_ek004_unknown_kind_skipped() {
        let yaml = r#"
environment: {name: envA}
components:
  - type: hologram
    source: future-thing
  - source: untyped
  - type: pip
    source: numpy
"#;
        let m = parse_yaml(yaml).unwrap();
        assert_eq!(m.components.len(), 1);
        assert_eq!(m.skipped, vec!["hologram", "<missing type>"]);
    }

    #[test]
    fn test_ek004_clone_without_path_rejected() {
        let yaml = r#"
environment: {name: envA}
components:
  - type: repository-clone
    source: https://x/y.git
"#;
        let err = parse_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Manifest { .. }));
        assert!(err.to_string().contains("components[0]"));
    }

    #[test]
    fn test_ek004_missing_environment() {
        let err = parse_yaml("components: []").unwrap_err();
        assert!(err.to_string().contains("missing 'environment'"));
        assert!(err.to_string().contains("demo.yaml"));
    }

    #[test]
    fn test_ek004_json_by_extension() {
        let json = r#"{"environment": {"name": "envB", "packages": [{"type": "conda", "source": "python", "version": "3.10"}]}}"#;
        let doc = parse_document(json, Path::new("x.json")).unwrap();
        let m = manifest_from_value("x", &doc, "x.json").unwrap();
        assert_eq!(m.name, "envB");
        assert_eq!(m.environment[0].version(), Some("3.10"));
    }

    #[test]
    fn test_ek004_validate_bad_name_and_duplicates() {
        let yaml = r#"
environment: {name: "my env"}
components:
  - {type: repository-clone, source: "https://a/x.git", path: /w/x}
  - {type: repository-clone, source: "https://b/x.git", path: /w/x}
  - {type: interpreter-package, source: ""}
"#;
        let m = parse_yaml(yaml).unwrap();
        let errors = validate_manifest(&m);
        assert!(errors.iter().any(|e| e.message.contains("'my env'")));
        assert!(errors.iter().any(|e| e.message.contains("more than once")));
        assert!(errors.iter().any(|e| e.message.contains("empty source")));
    }

    #[test]
    fn test_ek004_blank_clone_path_rejected() {
        let yaml = r#"
environment: {name: envA}
components:
  - {type: repository-clone, source: "https://x/y.git", path: "  "}
"#;
        let err = parse_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("non-empty 'path'"));
    }

    #[test]
    fn test_ek004_env_name_rules() {
        assert!(is_safe_env_name("envA"));
        assert!(is_safe_env_name("sd-cuda_12.1"));
        assert!(!is_safe_env_name("../../escape"));
        assert!(!is_safe_env_name(".hidden"));
        assert!(!is_safe_env_name("a/b"));
        assert!(!is_safe_env_name("my env"));
    }

    #[test]
    fn test_ek004_ensure_valid_lists_every_error() {
        let yaml = r#"
environment: {name: "../../escape"}
components:
  - {type: interpreter-package, source: ""}
"#;
        let m = parse_yaml(yaml).unwrap();
        let err = ensure_valid(&m, "demo.yaml").unwrap_err();
        assert!(matches!(err, EngineError::Manifest { .. }));
        let text = err.to_string();
        assert!(text.contains("demo.yaml"));
        assert!(text.contains("../../escape"));
        assert!(text.contains("empty source"));
    }

    #[test]
    fn test_ek004_validate_environment_packages_only() {
        let m = EnvironmentManifest {
            use_case: "x".to_string(),
            name: "envA".to_string(),
            channels: vec![],
            environment: vec![ComponentSpec::RepositoryClone {
                source: "https://x/y.git".to_string(),
                version: None,
                path: PathBuf::from("/w/y"),
            }],
            components: vec![],
            assets: None,
            skipped: vec![],
        };
        let errors = validate_manifest(&m);
        assert!(errors.iter().any(|e| e.message.contains("may only hold packages")));
    }

    #[test]
    fn test_ek004_parse_file_uses_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video-gen.yaml");
        std::fs::write(&path, DEMO).unwrap();
        let m = parse_manifest_file(&path).unwrap();
        assert_eq!(m.use_case, "video-gen");
    }

    #[test]
    fn test_ek004_parse_invalid_yaml() {
        let result = parse_document("not: [valid: yaml: {{", Path::new("bad.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_ek004_canonical_tag() {
        assert_eq!(canonical_tag("git-clone"), Some("repository-clone"));
        assert_eq!(canonical_tag("custom-node"), Some("catalog-component"));
        assert_eq!(canonical_tag("npm"), None);
    }
}
