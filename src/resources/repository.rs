//! EK-032: Repository clone handler.
//!
//! Target inspection decides everything: a valid clone is left alone, a
//! non-empty directory without a repository marker is treated as a user
//! mount and never touched, anything else is cloned fresh.

use crate::core::error::{EngineError, Result};
use crate::core::types::{ComponentOutcome, FailureContext, SkipReason, Stage};
use crate::transport::{CommandRunner, Invocation};
use std::path::Path;
use tracing::{info, warn};

/// Marker whose presence makes a directory a valid clone.
pub const REPO_MARKER: &str = ".git";

/// What currently occupies a clone target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Missing, or an empty directory
    Absent,
    /// Contains the repository marker
    Valid,
    /// Exists and holds other data (or is a file)
    Protected,
}

/// Classify a clone target path.
pub fn inspect_target(path: &Path) -> TargetState {
    if path.join(REPO_MARKER).exists() {
        return TargetState::Valid;
    }
    if !path.exists() {
        return TargetState::Absent;
    }
    match std::fs::read_dir(path).map(|mut entries| entries.next().is_none()) {
        Ok(true) => TargetState::Absent,
        _ => TargetState::Protected,
    }
}

pub fn clone_invocation(source: &str, dest: &Path) -> Invocation {
    Invocation::new("git")
        .args(["clone", source])
        .arg(dest.to_string_lossy())
        .env("GIT_TERMINAL_PROMPT", "0")
}

pub fn checkout_invocation(dest: &Path, version: &str) -> Invocation {
    Invocation::new("git")
        .arg("-C")
        .arg(dest.to_string_lossy())
        .args(["checkout", version])
}

pub fn rev_parse_invocation(dest: &Path, rev: &str) -> Invocation {
    Invocation::new("git")
        .arg("-C")
        .arg(dest.to_string_lossy())
        .args(["rev-parse", "--verify", "--quiet"])
        .arg(rev)
}

pub fn pull_invocation(dest: &Path) -> Invocation {
    Invocation::new("git")
        .arg("-C")
        .arg(dest.to_string_lossy())
        .args(["pull", "--ff-only"])
        .env("GIT_TERMINAL_PROMPT", "0")
}

/// Run `inv`, turning a non-zero exit into a dispatch failure for `component`.
pub fn run_checked(runner: &dyn CommandRunner, component: &str, inv: &Invocation) -> Result<()> {
    let out = runner.run(inv)?;
    if out.success() {
        return Ok(());
    }
    let mut context = FailureContext::new(
        Stage::Dispatch,
        format!("`{} {}` exited {}", inv.program, inv.args.first().map_or("", String::as_str), out.exit_code),
    );
    context.args = inv.argv();
    context.stderr = out.stderr_tail();
    Err(EngineError::Dispatch {
        component: component.to_string(),
        context: Box::new(context),
    })
}

/// Whether the clone at `dest` already has `version` checked out.
/// Any lookup failure counts as "no".
pub fn at_revision(runner: &dyn CommandRunner, dest: &Path, version: &str) -> Result<bool> {
    let head = runner.run(&rev_parse_invocation(dest, "HEAD"))?;
    let wanted = runner.run(&rev_parse_invocation(dest, &format!("{}^{{commit}}", version)))?;
    if !head.success() || !wanted.success() {
        return Ok(false);
    }
    let head = head.stdout.trim();
    Ok(!head.is_empty() && head == wanted.stdout.trim())
}

/// Clone `source` into `dest` unless a clone or protected data is there.
pub fn ensure_clone(
    runner: &dyn CommandRunner,
    component: &str,
    source: &str,
    version: Option<&str>,
    dest: &Path,
) -> Result<ComponentOutcome> {
    match inspect_target(dest) {
        TargetState::Valid => match version {
            // A clone interrupted before its checkout resumes here.
            Some(version) if !at_revision(runner, dest, version)? => {
                info!(component, version, "checking out pinned revision");
                run_checked(runner, component, &checkout_invocation(dest, version))?;
                Ok(ComponentOutcome::Updated)
            }
            _ => {
                info!(component, path = %dest.display(), "already cloned");
                Ok(ComponentOutcome::Skipped(SkipReason::AlreadyPresent))
            }
        },
        TargetState::Protected => {
            warn!(
                "{}: {} exists with foreign content and no {}; leaving it untouched",
                component,
                dest.display(),
                REPO_MARKER
            );
            Ok(ComponentOutcome::Skipped(SkipReason::ProtectedPath))
        }
        TargetState::Absent => {
            if let Some(parent) = dest.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
                }
            }
            run_checked(runner, component, &clone_invocation(source, dest))?;
            if let Some(version) = version {
                run_checked(runner, component, &checkout_invocation(dest, version))?;
            }
            Ok(ComponentOutcome::Cloned)
        }
    }
}
