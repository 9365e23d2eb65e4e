//! EK-006: Hardware probe: picks the accelerator profile fragment.

use crate::transport::{CommandRunner, Invocation};

/// Reports the accelerator profile name for this machine.
pub trait HardwareProbe {
    fn profile(&self) -> String;
}

/// Probes the host: `cuda` if `nvidia-smi` answers, `mps` on Apple
/// silicon, `cpu` otherwise.
pub struct SystemProbe<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> SystemProbe<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl HardwareProbe for SystemProbe<'_> {
    fn profile(&self) -> String {
        let smi = Invocation::new("nvidia-smi").arg("-L");
        if matches!(self.runner.run(&smi), Ok(out) if out.success()) {
            return "cuda".to_string();
        }
        if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            return "mps".to_string();
        }
        "cpu".to_string()
    }
}

/// Always reports the same profile (the `--profile` flag).
pub struct FixedProfile(pub String);

impl HardwareProbe for FixedProfile {
    fn profile(&self) -> String {
        self.0.clone()
    }
}
