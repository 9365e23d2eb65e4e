//! Scripted command runner for tests.

use super::{CommandRunner, ExecOutput, Invocation};
use crate::core::error::Result;
use std::cell::RefCell;

type Responder = Box<dyn Fn(&Invocation) -> ExecOutput>;

/// Records every invocation and answers through a responder closure.
pub struct ScriptedRunner {
    calls: RefCell<Vec<Invocation>>,
    responder: Responder,
}

impl ScriptedRunner {
    pub fn new(responder: impl Fn(&Invocation) -> ExecOutput + 'static) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Every call succeeds with empty output.
    pub fn ok() -> Self {
        Self::new(|_| ok(""))
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    /// Number of calls whose argv contains all of `words`.
    pub fn count(&self, words: &[&str]) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|inv| {
                let argv = inv.argv();
                words.iter().all(|w| argv.iter().any(|a| a == w))
            })
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<ExecOutput> {
        self.calls.borrow_mut().push(invocation.clone());
        Ok((self.responder)(invocation))
    }
}

pub fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Simulate the filesystem effect of `git clone URL DEST`.
pub fn simulate_clone(inv: &Invocation) {
    if inv.program == "git" && inv.args.first().map(String::as_str) == Some("clone") {
        if let Some(dest) = inv.args.last() {
            let _ = std::fs::create_dir_all(std::path::Path::new(dest).join(".git"));
        }
    }
}
