//! EK-040: Advisory collaborator: free-text diagnosis of a captured failure.
//!
//! Purely advisory. The controller shows the answer to the operator and
//! never acts on it; an unreachable advisor only produces a warning.

pub mod ollama;

use crate::core::error::Result;
use serde_json::Value;

/// Given a failure summary and a structured context blob, return guidance.
pub trait Advisor {
    fn diagnose(&self, summary: &str, context: &Value) -> Result<String>;
}

/// Fallback system prompt when no `prompts/capabilities.txt` exists.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant that diagnoses failed \
machine-learning environment installs. Explain the most likely cause in plain terms and \
suggest one concrete next step.";

/// Compose the user prompt sent to the advisor.
pub fn compose_prompt(summary: &str, context: &Value) -> String {
    let pretty = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
    format!(
        "The environment install failed: {}\n\n[Context Info]\n{}",
        summary, pretty
    )
}
