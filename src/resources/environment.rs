//! EK-031: Environment materializer.
//!
//! An existing environment with the manifest's name is reused as-is. It is
//! never deleted, recreated or modified here. An absent one is created in a
//! single call wrapped by a temporary network resilience policy.

use crate::core::config::ResilienceConfig;
use crate::core::error::{EngineError, Result};
use crate::core::types::{ComponentSpec, EnvironmentManifest, FailureContext, Stage};
use crate::resources::package::component_requirement;
use crate::transport::envtool::{parse_env_list, EnvTool};
use crate::transport::{CommandRunner, ExecOutput, Invocation};
use std::time::Instant;
use tracing::{info, warn};

const TIMEOUT_KEY: &str = "remote_read_timeout_secs";
const RETRIES_KEY: &str = "remote_max_retries";

/// Result of materializing one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialization {
    pub env: String,
    /// False when an existing environment was reused
    pub created: bool,
    /// Package list passed to the create call (empty when reused)
    pub packages: Vec<String>,
    pub duration_seconds: f64,
}

/// Temporary environment-manager network policy.
///
/// Applied on construction; the keys are removed again on drop, whichever
/// way the guarded call exits.
pub struct ResilienceGuard<'a> {
    runner: &'a dyn CommandRunner,
    tool: &'a EnvTool,
    applied: Vec<&'static str>,
}

impl<'a> ResilienceGuard<'a> {
    pub fn apply(runner: &'a dyn CommandRunner, tool: &'a EnvTool, policy: ResilienceConfig) -> Self {
        let mut guard = Self {
            runner,
            tool,
            applied: Vec::new(),
        };
        let settings = [
            (TIMEOUT_KEY, policy.timeout_secs.to_string()),
            (RETRIES_KEY, policy.max_retries.to_string()),
        ];
        for (key, value) in settings {
            match runner.run(&tool.config_set(key, &value)) {
                Ok(out) if out.success() => guard.applied.push(key),
                Ok(out) => warn!("cannot set {}={}: {}", key, value, out.stderr_tail()),
                Err(e) => warn!("cannot set {}={}: {}", key, value, e),
            }
        }
        guard
    }
}

impl Drop for ResilienceGuard<'_> {
    fn drop(&mut self) {
        for key in self.applied.drain(..) {
            match self.runner.run(&self.tool.config_remove(key)) {
                Ok(out) if out.success() => {}
                Ok(out) => warn!("cannot restore {}: {}", key, out.stderr_tail()),
                Err(e) => warn!("cannot restore {}: {}", key, e),
            }
        }
    }
}

fn failure(env: &str, summary: String, inv: &Invocation, out: Option<&ExecOutput>) -> EngineError {
    let mut context = FailureContext::new(Stage::Materialize, summary);
    context.args = inv.argv();
    context.stderr = out.map(ExecOutput::stderr_tail).unwrap_or_default();
    EngineError::Materialization {
        env: env.to_string(),
        context: Box::new(context),
    }
}

/// Whether an environment named `name` exists.
pub fn environment_exists(runner: &dyn CommandRunner, tool: &EnvTool, name: &str) -> Result<bool> {
    let inv = tool.list_envs();
    let out = runner.run(&inv)?;
    if !out.success() {
        return Err(failure(
            name,
            format!("listing environments failed (exit {})", out.exit_code),
            &inv,
            Some(&out),
        ));
    }
    let names = parse_env_list(&out.stdout).map_err(|reason| failure(name, reason, &inv, Some(&out)))?;
    Ok(names.iter().any(|n| n == name))
}

/// Normalized requirements for the environment's own packages.
pub fn build_package_list(manifest: &EnvironmentManifest) -> Vec<String> {
    manifest
        .environment
        .iter()
        .filter_map(component_requirement)
        .collect()
}

/// Manifest channels plus per-package channels, first occurrence kept.
pub fn collect_channels(manifest: &EnvironmentManifest) -> Vec<String> {
    let per_package = manifest.environment.iter().filter_map(|c| match c {
        ComponentSpec::IsolatedEnvPackage {
            channel: Some(ch), ..
        } => Some(ch.clone()),
        _ => None,
    });
    let mut channels: Vec<String> = Vec::new();
    for ch in manifest.channels.iter().cloned().chain(per_package) {
        let ch = ch.trim().to_string();
        if !ch.is_empty() && !channels.contains(&ch) {
            channels.push(ch);
        }
    }
    channels
}

/// Create the manifest's environment unless it already exists.
pub fn materialize(
    runner: &dyn CommandRunner,
    tool: &EnvTool,
    manifest: &EnvironmentManifest,
    policy: ResilienceConfig,
) -> Result<Materialization> {
    let start = Instant::now();
    let name = &manifest.name;

    if environment_exists(runner, tool, name)? {
        info!(environment = %name, "environment exists, reusing");
        return Ok(Materialization {
            env: name.clone(),
            created: false,
            packages: Vec::new(),
            duration_seconds: start.elapsed().as_secs_f64(),
        });
    }

    let packages = build_package_list(manifest);
    let channels = collect_channels(manifest);
    let inv = tool.create(name, &channels, &packages);
    info!(environment = %name, packages = packages.len(), "creating environment");

    let out = {
        let _policy = ResilienceGuard::apply(runner, tool, policy);
        runner.run(&inv)
    };
    let out = out.map_err(|e| failure(name, e.to_string(), &inv, None))?;
    if !out.success() {
        return Err(failure(
            name,
            format!(
                "'{}' exited {} while creating with [{}]",
                tool.program(),
                out.exit_code,
                packages.join(", ")
            ),
            &inv,
            Some(&out),
        ));
    }

    Ok(Materialization {
        env: name.clone(),
        created: true,
        packages,
        duration_seconds: start.elapsed().as_secs_f64(),
    })
}
