//! EK-011: Environment manager wrapper: "run X inside environment E".
//!
//! Builds invocations for conda-compatible tools (`conda`, `mamba`,
//! `micromamba`). The environment is always named on the command line, so
//! no shell activation state is involved.

use super::Invocation;
use serde::Deserialize;
use std::path::Path;

/// Typed front-end to the environment manager binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTool {
    program: String,
}

#[derive(Deserialize)]
struct EnvList {
    #[serde(default)]
    envs: Vec<String>,
}

impl EnvTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `env list --json`
    pub fn list_envs(&self) -> Invocation {
        Invocation::new(&self.program).args(["env", "list", "--json"])
    }

    /// `create -y -n NAME -c CH… PKG…`
    pub fn create(&self, name: &str, channels: &[String], packages: &[String]) -> Invocation {
        Invocation::new(&self.program)
            .args(["create", "-y", "-n", name])
            .args(channel_args(channels))
            .args(packages.iter().cloned())
    }

    /// `install -y -n NAME -c CH… PKG…`
    pub fn install(&self, name: &str, channels: &[String], packages: &[String]) -> Invocation {
        Invocation::new(&self.program)
            .args(["install", "-y", "-n", name])
            .args(channel_args(channels))
            .args(packages.iter().cloned())
    }

    /// `run -n NAME CMD…`
    pub fn run_in<I, S>(&self, name: &str, command: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(&self.program)
            .args(["run", "-n", name])
            .args(command)
    }

    /// `config --set KEY VALUE`
    pub fn config_set(&self, key: &str, value: &str) -> Invocation {
        Invocation::new(&self.program).args(["config", "--set", key, value])
    }

    /// `config --remove-key KEY`
    pub fn config_remove(&self, key: &str) -> Invocation {
        Invocation::new(&self.program).args(["config", "--remove-key", key])
    }
}

fn channel_args(channels: &[String]) -> Vec<String> {
    channels
        .iter()
        .flat_map(|c| ["-c".to_string(), c.clone()])
        .collect()
}

/// Parse `env list --json` output into environment names.
///
/// Names are the last path component of each prefix; the root prefix is
/// reported by its directory name, which never collides with named envs
/// living under `envs/`.
pub fn parse_env_list(stdout: &str) -> Result<Vec<String>, String> {
    let list: EnvList =
        serde_json::from_str(stdout).map_err(|e| format!("unexpected env list output: {}", e))?;
    Ok(list
        .envs
        .iter()
        .filter_map(|p| Path::new(p).file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect())
}
