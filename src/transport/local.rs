//! EK-010: Local execution transport.

use super::{CommandRunner, ExecOutput, Invocation};
use crate::core::error::{EngineError, Result};
use std::process::{Command, Stdio};
use tracing::debug;

/// Runs invocations as child processes of this one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

impl CommandRunner for LocalRunner {
    fn run(&self, invocation: &Invocation) -> Result<ExecOutput> {
        debug!(command = %invocation, "exec");
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref cwd) = invocation.cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd.output().map_err(|e| EngineError::Spawn {
            program: invocation.program.clone(),
            source: e,
        })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ek010_local_echo() {
        let out = LocalRunner.run(&Invocation::new("echo").arg("hello")).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_ek010_local_failure_exit_code() {
        let inv = Invocation::new("sh").args(["-c", "exit 42"]);
        let out = LocalRunner.run(&inv).unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn test_ek010_local_no_shell_interpretation() {
        let out = LocalRunner
            .run(&Invocation::new("echo").arg("a; echo injected"))
            .unwrap();
        assert_eq!(out.stdout.trim(), "a; echo injected");
    }

    #[test]
    fn test_ek010_local_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut inv = Invocation::new("sh")
            .args(["-c", "echo $EK_PROBE; pwd"])
            .env("EK_PROBE", "set");
        inv.cwd = Some(dir.path().to_path_buf());
        let out = LocalRunner.run(&inv).unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        assert_eq!(lines[0], "set");
        assert!(lines[1].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn test_ek010_local_missing_program() {
        let err = LocalRunner
            .run(&Invocation::new("envkiln-definitely-not-a-binary"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
        assert!(err.to_string().contains("envkiln-definitely-not-a-binary"));
    }

    #[test]
    fn test_ek010_local_stderr_captured() {
        let out = LocalRunner
            .run(&Invocation::new("sh").args(["-c", "echo err >&2"]))
            .unwrap();
        assert!(out.success());
        assert!(out.stderr.contains("err"));
    }
}
