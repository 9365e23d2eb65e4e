//! EK-017: CLI subcommands: init, validate, resolve, catalog, install, status.

pub mod prompt;

use crate::advisor::ollama::OllamaAdvisor;
use crate::advisor::Advisor;
use crate::assets::CommandAcquirer;
use crate::catalog::fetcher::{refresh_index, HttpFetcher};
use crate::catalog::{merger, overlay_paths};
use crate::core::config::{self, EngineConfig, CONFIG_TEMPLATE, DEFAULT_CONFIG_FILE};
use crate::core::controller::{Controller, OperatorPrompt, RunExit};
use crate::core::error::{EngineError, Result};
use crate::core::executor::{AttemptSummary, Engine};
use crate::core::hardware::{FixedProfile, HardwareProbe, SystemProbe};
use crate::core::recipe::{self, Category, Namespaces};
use crate::core::report::FileReporter;
use crate::core::state::{self, History};
use crate::core::types::{ComponentOutcome, InstallState, RetryStrategy};
use crate::core::parser;
use crate::transport::envtool::EnvTool;
use crate::transport::local::LocalRunner;
use crate::tripwire::eventlog::generate_run_id;
use clap::Subcommand;
use prompt::{NonInteractive, TerminalPrompt};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new envkiln project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a manifest without touching the host
    Validate {
        /// Path to a manifest (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Resolve a use case and print the merged manifest
    Resolve {
        use_case: String,

        /// Accelerator profile (default: probe the host)
        #[arg(long)]
        profile: Option<String>,
    },

    /// Fetch or merge the component catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Provision the environment for a use case
    Install {
        /// Use case to install (default: resume or ask)
        use_case: Option<String>,

        /// Accelerator profile (default: probe the host)
        #[arg(long)]
        profile: Option<String>,

        /// Attempts before retrying is no longer offered
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,

        /// Never prompt; abort on the first failure
        #[arg(long)]
        non_interactive: bool,

        /// Reinstall package batches even when unchanged
        #[arg(long)]
        force: bool,

        /// Strategy for the first attempt (default: from history)
        #[arg(long, value_enum)]
        strategy: Option<RetryStrategy>,
    },

    /// Show the pending retry record and environment locks
    Status,
}

#[derive(Subcommand, Debug)]
pub enum CatalogAction {
    /// Download the remote community index into the cache
    Fetch,
    /// Merge the cached index with the namespace overlays
    Merge,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands, config_path: &Path) -> Result<RunExit> {
    match cmd {
        Commands::Init { path } => cmd_init(&path).map(|_| RunExit::Success),
        Commands::Validate { file } => cmd_validate(&file).map(|_| RunExit::Success),
        Commands::Resolve { use_case, profile } => {
            let config = config::load(config_path)?;
            cmd_resolve(&config, &use_case, profile.as_deref()).map(|_| RunExit::Success)
        }
        Commands::Catalog { action } => {
            let config = config::load(config_path)?;
            match action {
                CatalogAction::Fetch => cmd_catalog_fetch(&config),
                CatalogAction::Merge => cmd_catalog_merge(&config),
            }
            .map(|_| RunExit::Success)
        }
        Commands::Install {
            use_case,
            profile,
            max_attempts,
            non_interactive,
            force,
            strategy,
        } => {
            let config = config::load(config_path)?;
            let opts = InstallOptions {
                use_case,
                profile,
                max_attempts,
                non_interactive,
                force,
                strategy,
            };
            cmd_install(&config, &opts)
        }
        Commands::Status => {
            let config = config::load(config_path)?;
            cmd_status(&config.state_dir).map(|_| RunExit::Success)
        }
    }
}

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join(DEFAULT_CONFIG_FILE);
    if config_path.exists() {
        return Err(EngineError::Config {
            path: config_path,
            reason: "already exists".to_string(),
        });
    }

    let meta = path.join("meta");
    for ns in ["enterprise", "core"] {
        for category in [
            Category::Recipes,
            Category::Profiles,
            Category::Assets,
            Category::Prompts,
            Category::Catalogs,
        ] {
            let dir = meta.join(ns).join(category.dir());
            std::fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;
        }
    }
    let overlay = meta.join("core").join("catalogs").join("overlay.json");
    std::fs::write(&overlay, "{}\n").map_err(|e| EngineError::io(&overlay, e))?;

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| EngineError::io(&state_dir, e))?;
    std::fs::write(&config_path, CONFIG_TEMPLATE).map_err(|e| EngineError::io(&config_path, e))?;

    println!("Initialized envkiln project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/{{enterprise,core}}/", meta.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let manifest = parser::parse_manifest_file(file)?;
    let errors = parser::validate_manifest(&manifest);

    if errors.is_empty() {
        println!(
            "OK: {} ({} environment packages, {} components)",
            manifest.name,
            manifest.environment.len(),
            manifest.components.len()
        );
        for tag in &manifest.skipped {
            println!("  WARNING: unknown component type '{}' will be skipped", tag);
        }
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(EngineError::Manifest {
            origin: file.display().to_string(),
            reason: format!("{} validation error(s)", errors.len()),
        })
    }
}

fn probe_profile(profile: Option<&str>, runner: &LocalRunner) -> String {
    match profile {
        Some(p) => FixedProfile(p.to_string()).profile(),
        None => SystemProbe::new(runner).profile(),
    }
}

fn cmd_resolve(config: &EngineConfig, use_case: &str, profile: Option<&str>) -> Result<()> {
    let namespaces = Namespaces::from_config(config);
    let profile = probe_profile(profile, &LocalRunner);
    let resolved = recipe::resolve(&namespaces, use_case, Some(&profile))?;

    println!(
        "# {} from {} ({})",
        use_case,
        resolved.namespace,
        resolved.source.display()
    );
    match resolved.profile {
        Some(ref p) => println!("# profile: {}", p),
        None => println!("# profile: {} (no fragment, unfused)", profile),
    }
    let yaml = serde_yaml_ng::to_string(&resolved.document).map_err(|e| EngineError::Serialize {
        what: "resolved manifest".to_string(),
        reason: e.to_string(),
    })?;
    print!("{}", yaml);
    Ok(())
}

fn cmd_catalog_fetch(config: &EngineConfig) -> Result<()> {
    let url = config
        .catalog
        .index_url
        .as_deref()
        .ok_or_else(|| EngineError::Config {
            path: PathBuf::from(DEFAULT_CONFIG_FILE),
            reason: "catalog.index_url is not set".to_string(),
        })?;
    let timeout = Duration::from_secs(config.environment.resilience.timeout_secs);
    let fetcher = HttpFetcher::new(timeout)?;
    let bytes = refresh_index(&fetcher, url, &config.catalog.index_cache)?;
    println!(
        "Fetched {} ({} bytes) -> {}",
        url,
        bytes,
        config.catalog.index_cache.display()
    );
    Ok(())
}

fn cmd_catalog_merge(config: &EngineConfig) -> Result<()> {
    let overlays = overlay_paths(config)?;
    let summary = merger::merge_files(
        &config.catalog.index_cache,
        &overlays,
        &config.catalog.merged_path,
    )?;
    println!("{}", describe_merge(&summary));
    Ok(())
}

fn describe_merge(summary: &merger::MergeSummary) -> String {
    format!(
        "Merged {} entries ({} skipped) -> {}\n  {}",
        summary.entries,
        summary.skipped,
        summary.path.display(),
        summary.hash
    )
}

/// Flags of `envkiln install`.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub use_case: Option<String>,
    pub profile: Option<String>,
    pub max_attempts: u32,
    pub non_interactive: bool,
    pub force: bool,
    pub strategy: Option<RetryStrategy>,
}

/// Starting record for this invocation: the history if it is for the same
/// use case, a fresh one otherwise. The attempt budget is per invocation.
pub fn starting_history(previous: Option<History>, use_case: &str, strategy: Option<RetryStrategy>) -> History {
    let mut history = match previous {
        Some(h) if h.state.use_case.as_deref() == Some(use_case) => h,
        _ => History {
            state: InstallState {
                use_case: Some(use_case.to_string()),
                ..InstallState::default()
            },
            ..History::default()
        },
    };
    history.attempts = 0;
    if let Some(s) = strategy {
        history.strategy = s;
    }
    history
}

fn cmd_install(config: &EngineConfig, opts: &InstallOptions) -> Result<RunExit> {
    let namespaces = Namespaces::from_config(config);
    let runner = LocalRunner;
    let prompt: Box<dyn OperatorPrompt> = if opts.non_interactive {
        Box::new(NonInteractive)
    } else {
        Box::new(TerminalPrompt)
    };

    let previous = state::load_history(&config.state_dir)?;
    let use_case = match opts.use_case.clone() {
        Some(u) => u,
        None => {
            let available: Vec<String> = namespaces
                .list(Category::Recipes)
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            let preselected = previous.as_ref().and_then(|h| h.state.use_case.as_deref());
            prompt
                .choose_use_case(&available, preselected)
                .ok_or_else(|| EngineError::Resolution {
                    name: "<none selected>".to_string(),
                    searched: namespaces.searched(),
                })?
        }
    };
    let history = starting_history(previous, &use_case, opts.strategy);

    let probe: Box<dyn HardwareProbe + '_> = match opts.profile.clone() {
        Some(p) => Box::new(FixedProfile(p)),
        None => Box::new(SystemProbe::new(&runner)),
    };
    let fetcher = HttpFetcher::new(Duration::from_secs(config.environment.resilience.timeout_secs))?;
    let tool = EnvTool::new(&config.environment.tool);
    let assets = CommandAcquirer {
        runner: &runner,
        tool: &tool,
        command: config.assets.command.clone(),
    };
    let run_id = generate_run_id();

    let mut engine = Engine::new(
        config,
        &namespaces,
        &runner,
        &fetcher,
        probe.as_ref(),
        &assets,
        run_id.clone(),
    );
    engine.force = opts.force;

    let advisor = OllamaAdvisor::from_config(&config.advisor, &namespaces);
    let reporter = FileReporter {
        runner: &runner,
        tool: &tool,
        namespaces: &namespaces,
        state_dir: &config.state_dir,
        reports_dir: &config.reports_dir,
        run_id: run_id.clone(),
        home: std::env::var("HOME").ok(),
    };
    let controller = Controller {
        prompt: prompt.as_ref(),
        advisor: advisor.as_ref().map(|a| a as &dyn Advisor),
        reporter: &reporter,
        state_dir: &config.state_dir,
        max_attempts: opts.max_attempts.max(1),
    };

    println!("Installing '{}' (run {})", use_case, run_id);
    let exit = controller.run(&engine, history)?;

    if let Some(summary) = engine.last_summary() {
        print_summary(&summary);
    }
    match exit {
        RunExit::Success => println!("Install complete."),
        RunExit::RetryableFailure => {
            println!("Install stopped; run `envkiln install` again to resume.")
        }
        RunExit::Escalated => println!("Install stopped after reporting."),
    }
    Ok(exit)
}

fn print_summary(summary: &AttemptSummary) {
    println!();
    println!(
        "{}: environment {} ({})",
        summary.use_case,
        summary.environment,
        if summary.env_created { "created" } else { "reused" }
    );
    for entry in &summary.dispatch.entries {
        println!("  {:<40} {}", entry.component, entry.outcome);
    }
    let skipped = summary
        .dispatch
        .count(|o| matches!(o, ComponentOutcome::Skipped(_)));
    println!(
        "Converged: {} changed, {} unchanged ({:.1}s)",
        summary.dispatch.changed(),
        skipped,
        summary.duration_seconds
    );
}

fn cmd_status(state_dir: &Path) -> Result<()> {
    let mut found = false;

    if let Some(history) = state::load_history(state_dir)? {
        found = true;
        println!("Pending retry:");
        println!(
            "  Use case:  {}",
            history.state.use_case.as_deref().unwrap_or("-")
        );
        println!(
            "  Env:       {}",
            history.state.env_name.as_deref().unwrap_or("-")
        );
        println!("  Strategy:  {}", history.strategy);
        println!("  Attempts:  {}", history.attempts);
        if let Some(ref f) = history.state.last_failure {
            println!("  Failed at: {} ({})", f.stage, f.summary);
        }
        println!();
    }

    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No state found. Run `envkiln install` first.");
            return Ok(());
        }
        Err(e) => return Err(EngineError::io(state_dir, e)),
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();

    for name in names {
        if let Some(lock) = state::load_lock(state_dir, &name)? {
            found = true;
            println!("Environment: {}", lock.environment);
            println!("  Generated: {}", lock.generated_at);
            println!("  Generator: {}", lock.generator);
            for (key, entry) in &lock.components {
                let short = entry.hash.get(..12).unwrap_or(&entry.hash);
                println!("    {}: {} [{}]", key, short, entry.kind);
            }
            println!();
        }
    }

    if !found {
        println!("No state found. Run `envkiln install` first.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{save_history, save_lock, EnvLock};
    use indexmap::IndexMap;

    #[test]
    fn test_ek017_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("proj");
        std::fs::create_dir_all(&sub).unwrap();
        cmd_init(&sub).unwrap();
        assert!(sub.join("envkiln.yaml").exists());
        assert!(sub.join("state").is_dir());
        assert!(sub.join("meta/enterprise/recipes").is_dir());
        assert!(sub.join("meta/core/catalogs/overlay.json").is_file());
        let cfg = config::load(&sub.join("envkiln.yaml")).unwrap();
        assert_eq!(cfg.namespaces, vec!["enterprise", "core"]);
    }

    #[test]
    fn test_ek017_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("envkiln.yaml"), "exists").unwrap();
        let err = cmd_init(dir.path()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_ek017_validate() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("demo.yaml");
        std::fs::write(
            &good,
            "environment: {name: envA}\ncomponents:\n  - {type: pip, source: libX}\n",
        )
        .unwrap();
        cmd_validate(&good).unwrap();

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "environment: {name: 'has space'}\n").unwrap();
        let err = cmd_validate(&bad).unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_ek017_resolve_with_fixed_profile() {
        let dir = tempfile::tempdir().unwrap();
        let recipes = dir.path().join("meta/core/recipes");
        std::fs::create_dir_all(&recipes).unwrap();
        std::fs::write(recipes.join("demo.yaml"), "environment: {name: envA}\n").unwrap();
        let cfg = EngineConfig {
            meta_root: dir.path().join("meta"),
            ..EngineConfig::default()
        };
        cmd_resolve(&cfg, "demo", Some("cpu")).unwrap();
        assert!(cmd_resolve(&cfg, "missing", Some("cpu")).is_err());
    }

    #[test]
    fn test_ek017_merge_summary_hash_printed_once() {
        let summary = merger::MergeSummary {
            path: PathBuf::from("merged.json"),
            entries: 2,
            skipped: 1,
            hash: crate::tripwire::hasher::hash_string("{}"),
        };
        let text = describe_merge(&summary);
        assert!(text.starts_with("Merged 2 entries (1 skipped) -> merged.json"));
        assert_eq!(text.matches("blake3:").count(), 1);
    }

    #[test]
    fn test_ek017_catalog_fetch_requires_url() {
        let err = cmd_catalog_fetch(&EngineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("index_url"));
    }

    #[test]
    fn test_ek017_catalog_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig {
            meta_root: dir.path().join("meta"),
            ..EngineConfig::default()
        };
        cfg.catalog.index_cache = dir.path().join("index.json");
        cfg.catalog.merged_path = dir.path().join("out/catalog.json");
        std::fs::write(&cfg.catalog.index_cache, r#"[{"reference": "https://g/a"}]"#).unwrap();
        let catalogs = dir.path().join("meta/core/catalogs");
        std::fs::create_dir_all(&catalogs).unwrap();
        std::fs::write(catalogs.join("overlay.json"), r#"{"a": {"url": "https://g/a.git"}}"#).unwrap();

        cmd_catalog_merge(&cfg).unwrap();
        assert!(cfg.catalog.merged_path.is_file());
    }

    #[test]
    fn test_ek017_starting_history() {
        let mut previous = History::default();
        previous.state.use_case = Some("demo".to_string());
        previous.strategy = RetryStrategy::NoCache;
        previous.attempts = 2;

        let h = starting_history(Some(previous.clone()), "demo", None);
        assert_eq!(h.strategy, RetryStrategy::NoCache);
        assert_eq!(h.attempts, 0);

        let h = starting_history(Some(previous.clone()), "demo", Some(RetryStrategy::Standard));
        assert_eq!(h.strategy, RetryStrategy::Standard);

        let h = starting_history(Some(previous), "other", None);
        assert_eq!(h.state.use_case.as_deref(), Some("other"));
        assert_eq!(h.strategy, RetryStrategy::Standard);
    }

    #[test]
    fn test_ek017_status() {
        let dir = tempfile::tempdir().unwrap();
        cmd_status(&dir.path().join("missing")).unwrap();

        let state_dir = dir.path().join("state");
        let mut lock = EnvLock::new("envA");
        lock.record("batch:interpreter", "interpreter-package", "a".repeat(64), IndexMap::new());
        save_lock(&state_dir, &lock).unwrap();
        save_history(&state_dir, &starting_history(None, "demo", None)).unwrap();
        cmd_status(&state_dir).unwrap();
    }

    #[test]
    fn test_ek017_dispatch_validate() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("demo.yaml");
        std::fs::write(&file, "environment: {name: envA}\n").unwrap();
        let exit = dispatch(Commands::Validate { file }, &dir.path().join("envkiln.yaml")).unwrap();
        assert_eq!(exit, RunExit::Success);
    }
}
