//! EK-009: Failure report written when the operator chooses "report and stop".
//!
//! The report is a local JSON file; shipping it anywhere is up to the
//! operator. Home directory paths are masked before anything is written.

use super::error::{EngineError, Result};
use super::recipe::{resolve, Namespaces};
use super::state::write_atomic;
use super::types::{FailureContext, InstallState};
use crate::transport::envtool::EnvTool;
use crate::transport::{CommandRunner, Invocation};
use crate::tripwire::eventlog::{now_iso8601, tail_events};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Event-log lines included in a report.
pub const EVENT_TAIL_LINES: usize = 100;

/// Persists diagnostics for a failed run; returns where they went.
pub trait FailureReporter {
    fn report(&self, state: &InstallState) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub family: String,
    pub arch: String,
}

impl SystemInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub event_type: String,
    pub timestamp: String,
    pub run_id: String,
    pub envkiln_version: String,
    pub system_info: SystemInfo,
    pub gpu_info: Vec<String>,
    pub packages: Vec<String>,
    pub use_case: Option<String>,
    pub environment: Option<String>,
    pub failure: Option<FailureContext>,
    pub event_log: Vec<String>,
    pub target_recipe: Option<Value>,
}

/// Replace the home directory prefix with `/home/<USER>`.
pub fn sanitize_home(text: &str, home: Option<&str>) -> String {
    match home {
        Some(h) if h.len() > 1 => text.replace(h.trim_end_matches('/'), "/home/<USER>"),
        _ => text.to_string(),
    }
}

fn sanitize_failure(ctx: &FailureContext, home: Option<&str>) -> FailureContext {
    FailureContext {
        stage: ctx.stage,
        summary: sanitize_home(&ctx.summary, home),
        args: ctx.args.iter().map(|a| sanitize_home(a, home)).collect(),
        stderr: sanitize_home(&ctx.stderr, home),
    }
}

fn output_lines(runner: &dyn CommandRunner, inv: &Invocation) -> std::result::Result<Vec<String>, String> {
    match runner.run(inv) {
        Ok(out) if out.success() => Ok(out.stdout.lines().map(str::to_string).collect()),
        Ok(out) => Err(format!("exit {}: {}", out.exit_code, out.stderr_tail())),
        Err(e) => Err(e.to_string()),
    }
}

/// Writes reports under `reports_dir/failure-<run id>.json`.
pub struct FileReporter<'a> {
    pub runner: &'a dyn CommandRunner,
    pub tool: &'a EnvTool,
    pub namespaces: &'a Namespaces,
    pub state_dir: &'a Path,
    pub reports_dir: &'a Path,
    pub run_id: String,
    pub home: Option<String>,
}

impl FileReporter<'_> {
    /// Gather everything the report carries.
    pub fn collect(&self, state: &InstallState) -> FailureReport {
        let home = self.home.as_deref();

        let gpu_info = output_lines(
            self.runner,
            &Invocation::new("nvidia-smi").args([
                "--query-gpu=name,memory.total,driver_version",
                "--format=csv,noheader",
            ]),
        )
        .unwrap_or_else(|_| vec!["GPU info unavailable (CPU only or nvidia-smi missing)".to_string()]);

        let packages = match state.env_name.as_deref() {
            Some(env) => output_lines(
                self.runner,
                &self.tool.run_in(env, ["python", "-m", "pip", "freeze"]),
            )
            .unwrap_or_else(|e| vec![format!("Error getting packages: {}", e)]),
            None => Vec::new(),
        };

        let event_log = state
            .env_name
            .as_deref()
            .map(|env| tail_events(self.state_dir, env, EVENT_TAIL_LINES))
            .unwrap_or_default()
            .iter()
            .map(|l| sanitize_home(l, home))
            .collect();

        let target_recipe = state
            .use_case
            .as_deref()
            .and_then(|uc| resolve(self.namespaces, uc, None).ok())
            .map(|r| r.document);

        FailureReport {
            event_type: "install_failure".to_string(),
            timestamp: now_iso8601(),
            run_id: self.run_id.clone(),
            envkiln_version: env!("CARGO_PKG_VERSION").to_string(),
            system_info: SystemInfo::current(),
            gpu_info,
            packages: packages.iter().map(|p| sanitize_home(p, home)).collect(),
            use_case: state.use_case.clone(),
            environment: state.env_name.clone(),
            failure: state.last_failure.as_ref().map(|f| sanitize_failure(f, home)),
            event_log,
            target_recipe,
        }
    }
}

impl FailureReporter for FileReporter<'_> {
    fn report(&self, state: &InstallState) -> Result<PathBuf> {
        let report = self.collect(state);
        let json = serde_json::to_string_pretty(&report).map_err(|e| EngineError::Serialize {
            what: "failure report".to_string(),
            reason: e.to_string(),
        })?;
        let path = self.reports_dir.join(format!("failure-{}.json", self.run_id));
        write_atomic(&path, json.as_bytes())?;
        Ok(path)
    }
}
