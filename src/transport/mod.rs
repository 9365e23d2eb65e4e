//! EK-010: Transport abstraction: typed tool invocations.
//!
//! Nothing here goes through a shell. Callers build an [`Invocation`]
//! (program + argv + env overrides) and hand it to a [`CommandRunner`].
//! Environment-scoped commands are built by [`envtool::EnvTool`], which
//! always passes the environment name explicitly.

pub mod envtool;
pub mod local;
#[cfg(test)]
pub mod mock;

use crate::core::error::Result;
use std::fmt;
use std::path::PathBuf;

/// Characters of stderr kept in failure contexts.
pub const STDERR_TAIL_CHARS: usize = 2000;

/// A single process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Output from running an invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last [`STDERR_TAIL_CHARS`] characters of stderr, trimmed.
    pub fn stderr_tail(&self) -> String {
        tail_chars(self.stderr.trim(), STDERR_TAIL_CHARS)
    }
}

/// Blocking process execution seam; faked in tests.
pub trait CommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<ExecOutput>;
}

/// Keep the last `max` characters of `s` on a char boundary.
pub fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}
