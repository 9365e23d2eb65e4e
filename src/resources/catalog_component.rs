//! EK-033: Catalog component handler.
//!
//! The source is either a direct repository URL or an identifier looked up
//! in the merged catalog. Clones land in `components_dir/<repo name>`; an
//! existing clone is updated in place rather than re-cloned.

use super::repository::{
    checkout_invocation, ensure_clone, inspect_target, pull_invocation, run_checked, TargetState,
};
use crate::core::error::{EngineError, Result};
use crate::core::types::{Catalog, ComponentOutcome, FailureContext, SkipReason, Stage};
use crate::transport::CommandRunner;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where a catalog component comes from, after lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub url: String,
    pub version: Option<String>,
}

/// Whether `source` is already a repository location.
pub fn looks_like_url(source: &str) -> bool {
    const PREFIXES: &[&str] = &["http://", "https://", "git@", "ssh://", "file://"];
    PREFIXES.iter().any(|p| source.starts_with(p)) || source.ends_with(".git")
}

/// Directory name for a clone of `url`: last path segment without `.git`.
pub fn repo_dir_name(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// Resolve a source to a URL. A manifest version overrides the catalog pin.
pub fn resolve_source(
    catalog: &Catalog,
    source: &str,
    version: Option<&str>,
) -> Result<ResolvedSource> {
    if looks_like_url(source) {
        return Ok(ResolvedSource {
            url: source.to_string(),
            version: version.map(str::to_string),
        });
    }
    let entry = catalog.get(source).ok_or_else(|| EngineError::Dispatch {
        component: source.to_string(),
        context: Box::new(FailureContext::new(
            Stage::Dispatch,
            format!("'{}' is not in the merged catalog ({} entries)", source, catalog.len()),
        )),
    })?;
    Ok(ResolvedSource {
        url: entry.url.clone(),
        version: version
            .map(str::to_string)
            .or_else(|| entry.version.clone()),
    })
}

/// Converge one catalog component. Returns the outcome and clone directory.
pub fn converge(
    runner: &dyn CommandRunner,
    catalog: &Catalog,
    components_dir: &Path,
    source: &str,
    version: Option<&str>,
) -> Result<(ComponentOutcome, PathBuf)> {
    let resolved = resolve_source(catalog, source, version)?;
    let name = repo_dir_name(&resolved.url).ok_or_else(|| EngineError::Dispatch {
        component: source.to_string(),
        context: Box::new(FailureContext::new(
            Stage::Dispatch,
            format!("cannot derive a directory name from '{}'", resolved.url),
        )),
    })?;
    let dest = components_dir.join(&name);

    match inspect_target(&dest) {
        TargetState::Valid => {
            run_checked(runner, source, &pull_invocation(&dest))?;
            if let Some(ref v) = resolved.version {
                run_checked(runner, source, &checkout_invocation(&dest, v))?;
            }
            Ok((ComponentOutcome::Updated, dest))
        }
        TargetState::Protected => {
            warn!(
                "{}: {} exists without a repository; leaving it untouched",
                source,
                dest.display()
            );
            Ok((ComponentOutcome::Skipped(SkipReason::ProtectedPath), dest))
        }
        TargetState::Absent => {
            let outcome = ensure_clone(
                runner,
                source,
                &resolved.url,
                resolved.version.as_deref(),
                &dest,
            )?;
            Ok((outcome, dest))
        }
    }
}
