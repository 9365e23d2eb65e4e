//! EK-007: Component dispatcher.
//!
//! Walks a manifest's application components in order:
//! 1. clones and catalog components converge immediately
//! 2. requirements.txt files in catalog clones are harvested
//! 3. environment-manager packages install as one batch
//! 4. interpreter packages install as one batch
//!
//! A batch whose hash matches the environment lock is skipped unless the
//! environment was created during this run or `force` is set.

use super::config::Installer;
use super::error::{EngineError, Result};
use super::state::{load_lock, save_lock, EnvLock};
use super::types::*;
use crate::resources::{catalog_component, package, repository};
use crate::resources::package::PackageBatch;
use crate::transport::envtool::EnvTool;
use crate::transport::{CommandRunner, Invocation};
use crate::tripwire::eventlog::RunLog;
use crate::tripwire::hasher::hash_string;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Lock key of the environment-manager package batch.
pub const ENV_BATCH_KEY: &str = "batch:environment";
/// Lock key of the interpreter package batch.
pub const INTERPRETER_BATCH_KEY: &str = "batch:interpreter";

/// Everything a dispatch pass needs, handed in explicitly.
pub struct DispatchContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub tool: &'a EnvTool,
    /// Merged catalog; None means identifiers cannot be resolved
    pub catalog: Option<&'a Catalog>,
    pub components_dir: &'a Path,
    pub state_dir: &'a Path,
    pub installer: Installer,
    pub strategy: RetryStrategy,
    pub force: bool,
    /// The environment was created by this run
    pub env_created: bool,
    pub log: &'a RunLog,
}

/// Outcome of one converged component or batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEntry {
    pub component: String,
    pub outcome: ComponentOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub entries: Vec<DispatchEntry>,
    /// requirements.txt files folded into the interpreter batch
    pub harvested_files: usize,
}

impl DispatchReport {
    fn push(&mut self, component: String, outcome: ComponentOutcome) {
        self.entries.push(DispatchEntry { component, outcome });
    }

    /// Entries whose outcome satisfies `pred`.
    pub fn count(&self, pred: impl Fn(&ComponentOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }

    pub fn changed(&self) -> usize {
        self.count(|o| !matches!(o, ComponentOutcome::Skipped(_)))
    }
}

/// Accumulated package batches.
#[derive(Debug, Default)]
struct Batches {
    environment: PackageBatch,
    environment_channels: Vec<String>,
    interpreter: PackageBatch,
}

/// Converge every application component of `manifest`.
pub fn dispatch(ctx: &DispatchContext, manifest: &EnvironmentManifest) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();
    let mut batches = Batches {
        environment_channels: manifest.channels.clone(),
        ..Batches::default()
    };
    let mut clone_dirs: Vec<PathBuf> = Vec::new();
    let empty_catalog = Catalog::default();
    let catalog = ctx.catalog.unwrap_or(&empty_catalog);

    // A freshly created environment makes any previous lock meaningless;
    // the empty lock hits disk before any component runs.
    let mut lock = if ctx.env_created {
        let fresh = EnvLock::new(&manifest.name);
        save_lock(ctx.state_dir, &fresh)?;
        fresh
    } else {
        load_lock(ctx.state_dir, &manifest.name)?.unwrap_or_else(|| EnvLock::new(&manifest.name))
    };

    for spec in &manifest.components {
        let key = spec.key();
        match spec {
            ComponentSpec::RepositoryClone {
                source,
                version,
                path,
            } => {
                let outcome =
                    repository::ensure_clone(ctx.runner, &key, source, version.as_deref(), path)?;
                if outcome == ComponentOutcome::Cloned {
                    let mut details = IndexMap::new();
                    details.insert("path".to_string(), path.display().to_string());
                    lock.record(&key, spec.kind(), hash_string(&spec.to_string()), details);
                }
                converged(ctx, &mut report, key, outcome);
            }
            ComponentSpec::CatalogComponent { source, version } => {
                let (outcome, dest) = catalog_component::converge(
                    ctx.runner,
                    catalog,
                    ctx.components_dir,
                    source,
                    version.as_deref(),
                )?;
                if outcome != ComponentOutcome::Skipped(SkipReason::ProtectedPath) {
                    clone_dirs.push(dest);
                }
                converged(ctx, &mut report, key, outcome);
            }
            ComponentSpec::IsolatedEnvPackage {
                source, channel, ..
            } => {
                if let Some(req) = package::component_requirement(spec) {
                    batches.environment.add_explicit(source, req);
                }
                if let Some(ch) = channel {
                    if !batches.environment_channels.contains(ch) {
                        batches.environment_channels.push(ch.clone());
                    }
                }
            }
            ComponentSpec::InterpreterPackage { source, .. } => {
                if let Some(req) = package::component_requirement(spec) {
                    batches.interpreter.add_explicit(source, req);
                }
            }
        }
    }

    report.harvested_files = package::harvest_requirements(&clone_dirs, &mut batches.interpreter);
    if report.harvested_files > 0 {
        info!(
            files = report.harvested_files,
            "harvested component requirements"
        );
    }

    if !batches.environment.is_empty() {
        let inv = package::environment_install(
            ctx.tool,
            &manifest.name,
            &batches.environment_channels,
            &batches.environment.requirements(),
        );
        let outcome = converge_batch(
            ctx,
            &mut lock,
            ENV_BATCH_KEY,
            "isolated-env-package",
            &batches.environment,
            &inv,
        )?;
        converged(ctx, &mut report, ENV_BATCH_KEY.to_string(), outcome);
    }

    if !batches.interpreter.is_empty() {
        let inv = package::interpreter_install(
            ctx.tool,
            &manifest.name,
            ctx.installer,
            ctx.strategy,
            &batches.interpreter.requirements(),
        );
        let outcome = converge_batch(
            ctx,
            &mut lock,
            INTERPRETER_BATCH_KEY,
            "interpreter-package",
            &batches.interpreter,
            &inv,
        )?;
        converged(ctx, &mut report, INTERPRETER_BATCH_KEY.to_string(), outcome);
    }

    save_lock(ctx.state_dir, &lock)?;
    Ok(report)
}

fn converged(
    ctx: &DispatchContext,
    report: &mut DispatchReport,
    component: String,
    outcome: ComponentOutcome,
) {
    info!(component = %component, outcome = %outcome, "converged");
    ctx.log.record(ProvenanceEvent::ComponentConverged {
        component: component.clone(),
        outcome: outcome.to_string(),
    });
    report.push(component, outcome);
}

/// Install one batch unless the lock says it is already in place.
fn converge_batch(
    ctx: &DispatchContext,
    lock: &mut EnvLock,
    key: &str,
    kind: &str,
    batch: &PackageBatch,
    inv: &Invocation,
) -> Result<ComponentOutcome> {
    let hash = batch.hash();
    if !ctx.force && !ctx.env_created && lock.hash_of(key) == Some(hash.as_str()) {
        return Ok(ComponentOutcome::Skipped(SkipReason::Unchanged));
    }

    info!(batch = key, packages = batch.len(), "installing batch");
    let out = ctx.runner.run(inv)?;
    if !out.success() {
        let mut context = FailureContext::new(
            Stage::Dispatch,
            format!(
                "batch install of {} package(s) exited {}",
                batch.len(),
                out.exit_code
            ),
        );
        context.args = inv.argv();
        context.stderr = out.stderr_tail();
        return Err(EngineError::Dispatch {
            component: key.to_string(),
            context: Box::new(context),
        });
    }

    let requirements = batch.requirements();
    let mut details = IndexMap::new();
    details.insert("packages".to_string(), requirements.join(" "));
    lock.record(key, kind, hash.clone(), details);
    // Persist right away so a later failure keeps this batch's progress.
    save_lock(ctx.state_dir, lock)?;

    ctx.log.record(ProvenanceEvent::BatchInstalled {
        batch: key.to_string(),
        packages: requirements,
        hash,
    });
    Ok(ComponentOutcome::Installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{failed, ok, simulate_clone, ScriptedRunner};
    use crate::transport::ExecOutput;
    use pretty_assertions::assert_eq;

    struct Fixture {
        dir: tempfile::TempDir,
        tool: EnvTool,
        log: RunLog,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut log = RunLog::new(&dir.path().join("state"), "r-test");
            log.bind("envA");
            Self {
                dir,
                tool: EnvTool::new("conda"),
                log,
            }
        }

        fn state_dir(&self) -> PathBuf {
            self.dir.path().join("state")
        }

        fn components_dir(&self) -> PathBuf {
            self.dir.path().join("custom_nodes")
        }
    }

    fn manifest(components: Vec<ComponentSpec>) -> EnvironmentManifest {
        EnvironmentManifest {
            use_case: "demo".to_string(),
            name: "envA".to_string(),
            channels: vec![],
            environment: vec![],
            components,
            assets: None,
            skipped: vec![],
        }
    }

    fn run(
        fx: &Fixture,
        runner: &ScriptedRunner,
        catalog: Option<&Catalog>,
        m: &EnvironmentManifest,
        env_created: bool,
        force: bool,
    ) -> Result<DispatchReport> {
        let state_dir = fx.state_dir();
        let components_dir = fx.components_dir();
        let ctx = DispatchContext {
            runner,
            tool: &fx.tool,
            catalog,
            components_dir: &components_dir,
            state_dir: &state_dir,
            installer: Installer::Pip,
            strategy: RetryStrategy::Standard,
            force,
            env_created,
            log: &fx.log,
        };
        dispatch(&ctx, m)
    }

    fn cloning_runner() -> ScriptedRunner {
        ScriptedRunner::new(|inv| {
            simulate_clone(inv);
            ok("")
        })
    }

    #[test]
    fn test_ek007_clones_before_batches() {
        let fx = Fixture::new();
        let target = fx.dir.path().join("work").join("repo");
        let m = manifest(vec![
            ComponentSpec::InterpreterPackage {
                source: "libX".to_string(),
                version: Some(">=2.0".to_string()),
            },
            ComponentSpec::RepositoryClone {
                source: "https://example/repo.git".to_string(),
                version: None,
                path: target.clone(),
            },
        ]);
        let runner = cloning_runner();
        let report = run(&fx, &runner, None, &m, true, false).unwrap();

        let programs: Vec<String> = runner.calls().iter().map(|c| c.program.clone()).collect();
        assert_eq!(programs, vec!["git", "conda"]);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].outcome, ComponentOutcome::Cloned);
        assert_eq!(report.entries[1].component, INTERPRETER_BATCH_KEY);
        assert_eq!(report.entries[1].outcome, ComponentOutcome::Installed);
        assert!(runner.calls()[1].args.contains(&"libX>=2.0".to_string()));
    }

    #[test]
    fn test_ek007_unchanged_batch_skipped_on_rerun() {
        let fx = Fixture::new();
        let m = manifest(vec![ComponentSpec::InterpreterPackage {
            source: "libX".to_string(),
            version: Some(">=2.0".to_string()),
        }]);
        let runner = ScriptedRunner::ok();
        run(&fx, &runner, None, &m, true, false).unwrap();
        assert_eq!(runner.count(&["pip", "install"]), 1);

        let report = run(&fx, &runner, None, &m, false, false).unwrap();
        assert_eq!(runner.count(&["pip", "install"]), 1);
        assert_eq!(
            report.entries[0].outcome,
            ComponentOutcome::Skipped(SkipReason::Unchanged)
        );

        // force reinstalls
        run(&fx, &runner, None, &m, false, true).unwrap();
        assert_eq!(runner.count(&["pip", "install"]), 2);
    }

    #[test]
    fn test_ek007_recreated_env_failure_keeps_no_stale_lock() {
        let fx = Fixture::new();
        let m = manifest(vec![ComponentSpec::InterpreterPackage {
            source: "libX".to_string(),
            version: Some(">=2.0".to_string()),
        }]);
        run(&fx, &ScriptedRunner::ok(), None, &m, true, false).unwrap();

        // environment recreated, then the batch fails
        let failing = ScriptedRunner::new(|_| failed(1, "ERROR: connection reset"));
        run(&fx, &failing, None, &m, true, false).unwrap_err();
        let lock = load_lock(&fx.state_dir(), "envA").unwrap().unwrap();
        assert_eq!(lock.hash_of(INTERPRETER_BATCH_KEY), None);

        // environment reused: the batch was never installed into it
        let runner = ScriptedRunner::ok();
        let report = run(&fx, &runner, None, &m, false, false).unwrap();
        assert_eq!(runner.count(&["pip", "install"]), 1);
        assert_eq!(report.entries[0].outcome, ComponentOutcome::Installed);
    }

    #[test]
    fn test_ek007_changed_batch_reinstalls() {
        let fx = Fixture::new();
        let runner = ScriptedRunner::ok();
        let m1 = manifest(vec![ComponentSpec::InterpreterPackage {
            source: "libX".to_string(),
            version: None,
        }]);
        run(&fx, &runner, None, &m1, true, false).unwrap();
        let m2 = manifest(vec![ComponentSpec::InterpreterPackage {
            source: "libX".to_string(),
            version: Some("2.1".to_string()),
        }]);
        run(&fx, &runner, None, &m2, false, false).unwrap();
        assert_eq!(runner.count(&["pip", "install"]), 2);
        assert_eq!(runner.count(&["libX==2.1"]), 1);
    }

    #[test]
    fn test_ek007_env_package_batch_with_channels() {
        let fx = Fixture::new();
        let runner = ScriptedRunner::ok();
        let m = manifest(vec![
            ComponentSpec::IsolatedEnvPackage {
                source: "ffmpeg".to_string(),
                version: None,
                channel: Some("conda-forge".to_string()),
            },
            ComponentSpec::IsolatedEnvPackage {
                source: "cudnn".to_string(),
                version: Some("8.9".to_string()),
                channel: Some("nvidia".to_string()),
            },
        ]);
        run(&fx, &runner, None, &m, true, false).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].to_string(),
            "conda install -y -n envA -c conda-forge -c nvidia ffmpeg cudnn==8.9"
        );
    }

    #[test]
    fn test_ek007_batch_failure_carries_context() {
        let fx = Fixture::new();
        let runner = ScriptedRunner::new(|inv: &crate::transport::Invocation| -> ExecOutput {
            if inv.args.contains(&"install".to_string()) {
                failed(1, "ERROR: ResolutionImpossible")
            } else {
                ok("")
            }
        });
        let m = manifest(vec![ComponentSpec::InterpreterPackage {
            source: "libX".to_string(),
            version: None,
        }]);
        let err = run(&fx, &runner, None, &m, true, false).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with(INTERPRETER_BATCH_KEY));
        let ctx = err.failure_context();
        assert!(ctx.stderr.contains("ResolutionImpossible"));
        assert!(ctx.args.contains(&"libX".to_string()));
    }

    #[test]
    fn test_ek007_catalog_requirements_harvested() {
        let fx = Fixture::new();
        let mut catalog = Catalog::default();
        catalog.entries.insert(
            "impact".to_string(),
            CatalogEntry {
                url: "https://g/o/impact.git".to_string(),
                version: None,
                metadata: Default::default(),
            },
        );
        let reqs_dir = fx.components_dir().join("impact");
        let runner = ScriptedRunner::new(move |inv| {
            simulate_clone(inv);
            if inv.args.first().map(String::as_str) == Some("clone") {
                std::fs::write(reqs_dir.join("requirements.txt"), "segment-anything\nlibX<3\n").unwrap();
            }
            ok("")
        });
        let m = manifest(vec![
            ComponentSpec::CatalogComponent {
                source: "impact".to_string(),
                version: None,
            },
            ComponentSpec::InterpreterPackage {
                source: "libX".to_string(),
                version: Some(">=2.0".to_string()),
            },
        ]);
        let report = run(&fx, &runner, Some(&catalog), &m, false, false).unwrap();
        assert_eq!(report.harvested_files, 1);

        let install = runner.calls().last().unwrap().clone();
        let tail: Vec<&str> = install.args.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, vec!["segment-anything", "libX>=2.0"]);
    }

    #[test]
    fn test_ek007_unknown_catalog_id_fails() {
        let fx = Fixture::new();
        let runner = ScriptedRunner::ok();
        let m = manifest(vec![ComponentSpec::CatalogComponent {
            source: "ghost".to_string(),
            version: None,
        }]);
        let err = run(&fx, &runner, Some(&Catalog::default()), &m, false, false).unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_ek007_events_recorded() {
        let fx = Fixture::new();
        let runner = ScriptedRunner::ok();
        let m = manifest(vec![ComponentSpec::InterpreterPackage {
            source: "numpy".to_string(),
            version: None,
        }]);
        run(&fx, &runner, None, &m, true, false).unwrap();
        let events = crate::tripwire::eventlog::tail_events(&fx.state_dir(), "envA", 10);
        assert!(events.iter().any(|e| e.contains("\"event\":\"batch_installed\"")));
        assert!(events.iter().any(|e| e.contains("\"event\":\"component_converged\"")));
    }
}
