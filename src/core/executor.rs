//! EK-012: Executor: one provisioning attempt.
//!
//! fetch → merge → resolve → materialize → dispatch → assets
//!
//! Every stage is safe to re-enter from scratch, so an interrupted attempt
//! is simply run again. Errors are lowered to an [`AttemptOutcome`] for the
//! controller; nothing is retried here.

use super::config::EngineConfig;
use super::controller::AttemptRunner;
use super::dispatcher::{self, DispatchContext, DispatchReport};
use super::error::{EngineError, Result};
use super::hardware::HardwareProbe;
use super::recipe::{self, Category, Namespaces};
use super::types::*;
use crate::assets::AssetAcquirer;
use crate::catalog::fetcher::{refresh_index, IndexFetcher};
use crate::catalog::merger::{merge_files, MergeSummary};
use crate::catalog::{load_catalog, overlay_paths};
use crate::resources::catalog_component::looks_like_url;
use crate::resources::environment;
use crate::transport::envtool::EnvTool;
use crate::transport::CommandRunner;
use crate::tripwire::eventlog::RunLog;
use crate::tripwire::hasher::hash_file;
use std::cell::RefCell;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What a successful attempt did.
#[derive(Debug, Clone)]
pub struct AttemptSummary {
    pub use_case: String,
    pub environment: String,
    pub env_created: bool,
    pub profile: Option<String>,
    pub dispatch: DispatchReport,
    pub duration_seconds: f64,
}

/// Collaborators for provisioning attempts, injected by the caller.
pub struct Engine<'a> {
    pub config: &'a EngineConfig,
    pub namespaces: &'a Namespaces,
    pub runner: &'a dyn CommandRunner,
    pub fetcher: &'a dyn IndexFetcher,
    pub probe: &'a dyn HardwareProbe,
    pub assets: &'a dyn AssetAcquirer,
    pub run_id: String,
    /// Reinstall batches even when the lock says they are current
    pub force: bool,
    tool: EnvTool,
    last: RefCell<Option<AttemptSummary>>,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a EngineConfig,
        namespaces: &'a Namespaces,
        runner: &'a dyn CommandRunner,
        fetcher: &'a dyn IndexFetcher,
        probe: &'a dyn HardwareProbe,
        assets: &'a dyn AssetAcquirer,
        run_id: String,
    ) -> Self {
        Self {
            config,
            namespaces,
            runner,
            fetcher,
            probe,
            assets,
            run_id,
            force: false,
            tool: EnvTool::new(&config.environment.tool),
            last: RefCell::new(None),
        }
    }

    pub fn tool(&self) -> &EnvTool {
        &self.tool
    }

    /// Summary of the most recent successful attempt.
    pub fn last_summary(&self) -> Option<AttemptSummary> {
        self.last.borrow().clone()
    }

    /// Refresh the remote index (unless offline) and rebuild the merged
    /// catalog. Returns None when there is no index to merge.
    pub fn refresh_catalog(&self, strategy: RetryStrategy, log: &RunLog) -> Result<Option<MergeSummary>> {
        let catalog = &self.config.catalog;
        let cache = &catalog.index_cache;

        match catalog.index_url.as_deref() {
            Some(_) if strategy == RetryStrategy::OfflineCatalog => {
                info!("offline catalog: using cached index");
            }
            Some(url) => match refresh_index(self.fetcher, url, cache) {
                Ok(bytes) => info!(url, bytes, "catalog index refreshed"),
                Err(e) if cache.is_file() => {
                    warn!("{}; falling back to cached {}", e, cache.display());
                }
                Err(e) => return Err(e),
            },
            None => debug!("no index_url configured"),
        }

        if !cache.is_file() {
            debug!("no cached index at {}, skipping merge", cache.display());
            return Ok(None);
        }

        let overlays = overlay_paths(self.config)?;
        let summary = merge_files(cache, &overlays, &catalog.merged_path)?;
        info!(
            entries = summary.entries,
            skipped = summary.skipped,
            "catalog merged"
        );
        log.record(ProvenanceEvent::CatalogMerged {
            entries: summary.entries,
            index_hash: hash_file(cache)?,
            hash: summary.hash.clone(),
        });
        Ok(Some(summary))
    }

    /// Run every stage once.
    pub fn provision(
        &self,
        state: &mut InstallState,
        strategy: RetryStrategy,
        log: &mut RunLog,
    ) -> Result<AttemptSummary> {
        let start = Instant::now();
        let use_case = state.use_case.clone().ok_or_else(|| EngineError::Resolution {
            name: "<none>".to_string(),
            searched: self.namespaces.searched(),
        })?;
        if let Some(env) = state.env_name.as_deref() {
            log.bind(env);
        }
        log.record(ProvenanceEvent::RunStarted {
            use_case: use_case.clone(),
            run_id: self.run_id.clone(),
            strategy,
            envkiln_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        self.refresh_catalog(strategy, log)?;

        let profile = self.probe.profile();
        let resolved = recipe::resolve(self.namespaces, &use_case, Some(&profile))?;
        let manifest = resolved.manifest;
        info!(
            use_case = %use_case,
            namespace = %resolved.namespace,
            profile = ?resolved.profile,
            "recipe resolved"
        );
        for tag in &manifest.skipped {
            warn!("{}: skipping component of unknown type '{}'", use_case, tag);
        }
        state.env_name = Some(manifest.name.clone());
        log.bind(&manifest.name);

        let mut policy = self.config.environment.resilience;
        if strategy == RetryStrategy::ExtendedTimeouts {
            policy = policy.doubled();
        }
        let materialized = environment::materialize(self.runner, &self.tool, &manifest, policy)?;
        if materialized.created {
            log.record(ProvenanceEvent::EnvironmentCreated {
                environment: materialized.env.clone(),
                packages: materialized.packages.clone(),
                duration_seconds: materialized.duration_seconds,
            });
        } else {
            log.record(ProvenanceEvent::EnvironmentReused {
                environment: materialized.env.clone(),
            });
        }

        let needs_catalog = manifest.components.iter().any(|c| {
            matches!(c, ComponentSpec::CatalogComponent { source, .. } if !looks_like_url(source))
        });
        let catalog = if needs_catalog {
            Some(load_catalog(&self.config.catalog.merged_path)?)
        } else {
            None
        };

        let ctx = DispatchContext {
            runner: self.runner,
            tool: &self.tool,
            catalog: catalog.as_ref(),
            components_dir: &self.config.components_dir,
            state_dir: &self.config.state_dir,
            installer: self.config.environment.installer,
            strategy,
            force: self.force,
            env_created: materialized.created,
            log,
        };
        let dispatch = dispatcher::dispatch(&ctx, &manifest)?;

        if let Some(assets) = manifest.assets.as_deref() {
            let located = self.namespaces.find(Category::Assets, assets)?;
            self.assets.acquire(&located.path, &manifest.name)?;
        }

        Ok(AttemptSummary {
            use_case,
            environment: manifest.name,
            env_created: materialized.created,
            profile: resolved.profile,
            dispatch,
            duration_seconds: start.elapsed().as_secs_f64(),
        })
    }
}

impl AttemptRunner for Engine<'_> {
    fn attempt(&self, state: &mut InstallState, strategy: RetryStrategy) -> AttemptOutcome {
        let start = Instant::now();
        let mut log = RunLog::new(&self.config.state_dir, &self.run_id);

        let result = self.provision(state, strategy, &mut log);
        let outcome = match result {
            Ok(summary) => {
                info!(
                    environment = %summary.environment,
                    changed = summary.dispatch.changed(),
                    "attempt succeeded"
                );
                state.last_failure = None;
                *self.last.borrow_mut() = Some(summary);
                AttemptOutcome::Success
            }
            Err(e) => {
                error!(stage = %e.stage(), "{}", e);
                let context = e.failure_context();
                log.record(ProvenanceEvent::AttemptFailed {
                    stage: context.stage,
                    error: e.to_string(),
                });
                state.last_failure = Some(context.clone());
                if e.is_retryable() {
                    AttemptOutcome::RetryableFailure(context)
                } else {
                    AttemptOutcome::FatalFailure(context)
                }
            }
        };

        log.record(ProvenanceEvent::RunCompleted {
            run_id: self.run_id.clone(),
            outcome: match outcome {
                AttemptOutcome::Success => "success",
                AttemptOutcome::RetryableFailure(_) => "retryable_failure",
                AttemptOutcome::FatalFailure(_) => "fatal_failure",
                AttemptOutcome::UserAbort => "user_abort",
            }
            .to_string(),
            total_seconds: start.elapsed().as_secs_f64(),
        });
        outcome
    }
}
