//! Catalog: remote index fetch, overlay merge, merged-table lookup.

pub mod fetcher;
pub mod merger;

use crate::core::config::EngineConfig;
use crate::core::error::{EngineError, Result};
use crate::core::types::Catalog;
use std::path::{Path, PathBuf};

/// Load a merged catalog written by [`merger::merge_files`].
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    if !path.exists() {
        return Err(EngineError::Merge {
            path: path.to_path_buf(),
            reason: "merged catalog not found; run `envkiln catalog merge`".to_string(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| EngineError::Merge {
        path: path.to_path_buf(),
        reason: format!("invalid merged catalog: {}", e),
    })
}

/// Expand configured overlays into concrete files, in merge order.
///
/// Absolute paths are used as-is. A relative overlay is looked up under
/// `<meta_root>/<ns>/catalogs/` for every namespace, base layer first so
/// the override layer is merged last and wins. A relative overlay found in
/// no namespace is a merge failure.
pub fn overlay_paths(config: &EngineConfig) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for overlay in &config.catalog.overlays {
        if overlay.is_absolute() {
            paths.push(overlay.clone());
            continue;
        }
        let found: Vec<PathBuf> = config
            .namespaces
            .iter()
            .rev()
            .map(|ns| config.meta_root.join(ns).join("catalogs").join(overlay))
            .filter(|p| p.is_file())
            .collect();
        if found.is_empty() {
            return Err(EngineError::Merge {
                path: overlay.clone(),
                reason: format!(
                    "overlay not found in any namespace ({})",
                    config.namespaces.join(", ")
                ),
            });
        }
        paths.extend(found);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(root: &Path) -> EngineConfig {
        EngineConfig {
            meta_root: root.join("meta"),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_ek022_overlay_paths_base_first() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        for ns in ["enterprise", "core"] {
            let d = cfg.meta_root.join(ns).join("catalogs");
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join("overlay.json"), "{}").unwrap();
        }
        let paths = overlay_paths(&cfg).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].starts_with(cfg.meta_root.join("core")));
        assert!(paths[1].starts_with(cfg.meta_root.join("enterprise")));
    }

    #[test]
    fn test_ek022_overlay_missing_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let err = overlay_paths(&cfg).unwrap_err();
        assert!(err.to_string().contains("overlay.json"));
    }

    #[test]
    fn test_ek022_load_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        assert!(load_catalog(&path).is_err());
        std::fs::write(&path, r#"{"n": {"url": "https://g/n"}}"#).unwrap();
        let catalog = load_catalog(&path).unwrap();
        assert_eq!(catalog.get("n").unwrap().url, "https://g/n");
    }
}
