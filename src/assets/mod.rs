//! EK-050: Asset acquisition (model weights and other large downloads).
//!
//! The engine only hands over the asset sub-manifest path and the target
//! environment, then waits for pass/fail.

use crate::core::error::{EngineError, Result};
use crate::core::types::{FailureContext, Stage};
use crate::transport::envtool::EnvTool;
use crate::transport::CommandRunner;
use std::path::Path;

/// Result of an acquisition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetOutcome {
    Acquired,
    /// No acquisition command configured
    Skipped,
}

pub trait AssetAcquirer {
    fn acquire(&self, manifest: &Path, environment: &str) -> Result<AssetOutcome>;
}

/// Runs the configured command inside the environment with the
/// sub-manifest path appended.
pub struct CommandAcquirer<'a> {
    pub runner: &'a dyn CommandRunner,
    pub tool: &'a EnvTool,
    pub command: Option<Vec<String>>,
}

impl AssetAcquirer for CommandAcquirer<'_> {
    fn acquire(&self, manifest: &Path, environment: &str) -> Result<AssetOutcome> {
        let command = match self.command.as_deref() {
            Some(cmd) if !cmd.is_empty() => cmd,
            _ => {
                tracing::warn!(
                    "no assets.command configured, skipping {}",
                    manifest.display()
                );
                return Ok(AssetOutcome::Skipped);
            }
        };

        let inv = self.tool.run_in(
            environment,
            command
                .iter()
                .cloned()
                .chain(std::iter::once(manifest.display().to_string())),
        );
        tracing::info!(manifest = %manifest.display(), environment, "acquiring assets");

        let failed = |summary: String, stderr: String| {
            let mut context = FailureContext::new(Stage::Assets, summary);
            context.args = inv.argv();
            context.stderr = stderr;
            EngineError::Dispatch {
                component: format!("assets:{}", manifest.display()),
                context: Box::new(context),
            }
        };

        let out = self
            .runner
            .run(&inv)
            .map_err(|e| failed(e.to_string(), String::new()))?;
        if !out.success() {
            return Err(failed(
                format!("asset command exited {}", out.exit_code),
                out.stderr_tail(),
            ));
        }
        Ok(AssetOutcome::Acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{failed, ScriptedRunner};

    fn fetch_cmd() -> Option<Vec<String>> {
        Some(vec!["python".into(), "-m".into(), "fetch_models".into()])
    }

    #[test]
    fn test_ek050_runs_inside_environment() {
        let runner = ScriptedRunner::ok();
        let tool = EnvTool::new("conda");
        let acq = CommandAcquirer {
            runner: &runner,
            tool: &tool,
            command: fetch_cmd(),
        };
        let outcome = acq.acquire(Path::new("/meta/core/assets/sd.yaml"), "envA").unwrap();
        assert_eq!(outcome, AssetOutcome::Acquired);
        assert_eq!(
            runner.calls()[0].argv(),
            vec![
                "conda", "run", "-n", "envA", "python", "-m", "fetch_models",
                "/meta/core/assets/sd.yaml"
            ]
        );
    }

    #[test]
    fn test_ek050_no_command_skips() {
        let runner = ScriptedRunner::ok();
        let tool = EnvTool::new("conda");
        let acq = CommandAcquirer {
            runner: &runner,
            tool: &tool,
            command: None,
        };
        assert_eq!(
            acq.acquire(Path::new("a.yaml"), "envA").unwrap(),
            AssetOutcome::Skipped
        );
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_ek050_failure_is_retryable_assets_stage() {
        let runner = ScriptedRunner::new(|_| failed(1, "HTTP 503 from model host"));
        let tool = EnvTool::new("conda");
        let acq = CommandAcquirer {
            runner: &runner,
            tool: &tool,
            command: fetch_cmd(),
        };
        let err = acq.acquire(Path::new("a.yaml"), "envA").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.stage(), Stage::Assets);
        assert!(err.failure_context().stderr.contains("503"));
    }
}
