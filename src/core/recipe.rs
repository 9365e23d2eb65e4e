//! EK-005: Recipe resolution across layered namespaces.
//!
//! Layout: `<meta_root>/<namespace>/<category>/<name>.{yaml,yml,json}`.
//! Namespaces are searched in configured order (override layer first) and
//! the first match wins. A recipe may name a `base_recipe`; components are
//! merged by `type:source` with the child winning. The result can then be
//! fused with a hardware-profile fragment that supplies defaults.

use super::config::EngineConfig;
use super::error::{EngineError, Result};
use super::parser::{canonical_tag, ensure_valid, load_document, manifest_from_value};
use super::types::EnvironmentManifest;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Content categories under each namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Recipes,
    Profiles,
    Assets,
    Prompts,
    Catalogs,
}

impl Category {
    pub fn dir(self) -> &'static str {
        match self {
            Self::Recipes => "recipes",
            Self::Profiles => "profiles",
            Self::Assets => "assets",
            Self::Prompts => "prompts",
            Self::Catalogs => "catalogs",
        }
    }
}

/// A file found in a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub namespace: String,
    pub path: PathBuf,
}

/// Ordered namespace search path.
#[derive(Debug, Clone)]
pub struct Namespaces {
    root: PathBuf,
    order: Vec<String>,
}

impl Namespaces {
    pub fn new(root: impl Into<PathBuf>, order: Vec<String>) -> Self {
        Self {
            root: root.into(),
            order,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.meta_root.clone(), config.namespaces.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Human-readable search order for error messages.
    pub fn searched(&self) -> String {
        self.order.join(", ")
    }

    /// Find `<name>.{yaml,yml,json}` in the first namespace that has it.
    pub fn find(&self, category: Category, name: &str) -> Result<Located> {
        let not_found = || EngineError::Resolution {
            name: name.to_string(),
            searched: format!("{} in {}", self.searched(), category.dir()),
        };
        if name.is_empty() || Path::new(name).components().any(|c| !matches!(c, std::path::Component::Normal(_))) {
            return Err(not_found());
        }
        for ns in &self.order {
            let dir = self.root.join(ns).join(category.dir());
            for ext in EXTENSIONS {
                let path = dir.join(format!("{}.{}", name, ext));
                if path.is_file() {
                    debug!(name, namespace = %ns, "resolved {}", path.display());
                    return Ok(Located {
                        namespace: ns.clone(),
                        path,
                    });
                }
            }
        }
        Err(not_found())
    }

    /// Find an exact file name (e.g. `capabilities.txt`), override first.
    pub fn find_file(&self, category: Category, file_name: &str) -> Option<Located> {
        self.order.iter().find_map(|ns| {
            let path = self.root.join(ns).join(category.dir()).join(file_name);
            path.is_file().then(|| Located {
                namespace: ns.clone(),
                path,
            })
        })
    }

    /// Every entry of a category, sorted by name; an override-layer entry
    /// shadows the base-layer entry of the same name.
    pub fn list(&self, category: Category) -> Vec<(String, Located)> {
        let mut found: BTreeMap<String, Located> = BTreeMap::new();
        for ns in self.order.iter().rev() {
            let dir = self.root.join(ns).join(category.dir());
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let is_doc = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e));
                if !path.is_file() || !is_doc {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    found.insert(
                        stem.to_string(),
                        Located {
                            namespace: ns.clone(),
                            path,
                        },
                    );
                }
            }
        }
        found.into_iter().collect()
    }
}

/// Normalize a recipe reference to a namespace-relative name.
///
/// Legacy absolute references (`/app/config/meta/recipes/foundation/sd.json`)
/// lose everything up to the `recipes/` root; a leading `/` and a document
/// extension are dropped.
pub fn normalize_recipe_ref(reference: &str) -> String {
    let mut r = reference.trim();
    if r.starts_with('/') {
        if let Some(i) = r.find("/recipes/") {
            r = &r[i + "/recipes/".len()..];
        }
    }
    let r = r.trim_start_matches('/');
    for ext in EXTENSIONS {
        if let Some(stem) = r.strip_suffix(&format!(".{}", ext)) {
            return stem.to_string();
        }
    }
    r.to_string()
}

/// Recursive merge: objects merge key by key, anything else is replaced
/// by the override.
pub fn deep_merge(defaults: &Value, overrides: &Value) -> Value {
    match (defaults, overrides) {
        (Value::Object(base), Value::Object(over)) => {
            let mut out = base.clone();
            for (k, v) in over {
                let merged = match base.get(k) {
                    Some(b) => deep_merge(b, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (_, over) => over.clone(),
    }
}

fn component_key(c: &Value) -> String {
    let tag = c.get("type").and_then(Value::as_str).unwrap_or("");
    let kind = canonical_tag(tag).unwrap_or(tag);
    let source = c.get("source").and_then(Value::as_str).unwrap_or("unknown");
    format!("{}:{}", kind, source)
}

/// Merge component lists by `type:source`. Child entries replace base
/// entries in place; new child entries are appended.
pub fn merge_components(base: &[Value], child: &[Value]) -> Vec<Value> {
    let mut merged: IndexMap<String, Value> = IndexMap::new();
    for c in base.iter().chain(child) {
        merged.insert(component_key(c), c.clone());
    }
    merged.into_values().collect()
}

fn load_with_inheritance(
    namespaces: &Namespaces,
    name: &str,
    chain: &mut Vec<String>,
) -> Result<(Value, Located)> {
    if chain.iter().any(|n| n == name) {
        chain.push(name.to_string());
        return Err(EngineError::Resolution {
            name: name.to_string(),
            searched: format!("base_recipe cycle: {}", chain.join(" -> ")),
        });
    }
    chain.push(name.to_string());

    let located = namespaces.find(Category::Recipes, name)?;
    let mut doc = load_document(&located.path)?;

    let base_ref = doc
        .get("base_recipe")
        .and_then(Value::as_str)
        .map(normalize_recipe_ref);
    if let Some(base_name) = base_ref {
        let (base_doc, base_loc) = load_with_inheritance(namespaces, &base_name, chain)?;
        debug!(recipe = name, base = %base_name, "inheriting from {}", base_loc.path.display());

        let empty = Vec::new();
        let base_components = base_doc
            .get("components")
            .and_then(Value::as_array)
            .unwrap_or(&empty);
        let child_components = doc
            .get("components")
            .and_then(Value::as_array)
            .unwrap_or(&empty);
        let components = merge_components(base_components, child_components);

        if let Value::Object(obj) = &mut doc {
            obj.insert("components".to_string(), Value::Array(components));
            if !obj.contains_key("environment") {
                if let Some(env) = base_doc.get("environment") {
                    obj.insert("environment".to_string(), env.clone());
                }
            }
        }
    }
    Ok((doc, located))
}

/// A manifest resolved for one run.
#[derive(Debug, Clone)]
pub struct ResolvedRecipe {
    pub manifest: EnvironmentManifest,
    /// Fully merged document (after inheritance and profile fusion)
    pub document: Value,
    pub source: PathBuf,
    pub namespace: String,
    /// Profile fragment actually fused, if any
    pub profile: Option<String>,
}

/// Resolve a use case into a manifest, optionally fused with a profile.
///
/// A missing profile fragment is not an error; the manifest is used as is.
pub fn resolve(namespaces: &Namespaces, use_case: &str, profile: Option<&str>) -> Result<ResolvedRecipe> {
    let name = normalize_recipe_ref(use_case);
    let mut chain = Vec::new();
    let (mut document, located) = load_with_inheritance(namespaces, &name, &mut chain)?;

    let mut fused = None;
    if let Some(profile) = profile {
        match namespaces.find(Category::Profiles, profile) {
            Ok(loc) => {
                let fragment = load_document(&loc.path)?;
                document = deep_merge(&fragment, &document);
                fused = Some(profile.to_string());
            }
            Err(_) => debug!(profile, "no profile fragment, using manifest unfused"),
        }
    }

    let origin = located.path.display().to_string();
    let manifest = manifest_from_value(&name, &document, &origin)?;
    ensure_valid(&manifest, &origin)?;
    Ok(ResolvedRecipe {
        manifest,
        document,
        source: located.path,
        namespace: located.namespace,
        profile: fused,
    })
}
