//! EK-041: Ollama-style generate endpoint client.

use super::{compose_prompt, Advisor, DEFAULT_SYSTEM_PROMPT};
use crate::core::config::AdvisorConfig;
use crate::core::error::{EngineError, Result};
use crate::core::recipe::{Category, Namespaces};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    system: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct OllamaAdvisor {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    system_prompt: String,
}

impl OllamaAdvisor {
    pub fn new(config: &AdvisorConfig, system_prompt: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Advisor {
                reason: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            system_prompt,
        })
    }

    /// Build from config, loading the system prompt override-first.
    /// Returns None when the advisor is disabled.
    pub fn from_config(config: &AdvisorConfig, namespaces: &Namespaces) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let system_prompt = load_system_prompt(namespaces);
        match Self::new(config, system_prompt) {
            Ok(advisor) => Some(advisor),
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        }
    }
}

/// `prompts/capabilities.txt` from the first namespace that has it.
pub fn load_system_prompt(namespaces: &Namespaces) -> String {
    namespaces
        .find_file(Category::Prompts, "capabilities.txt")
        .and_then(|loc| std::fs::read_to_string(&loc.path).ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

impl Advisor for OllamaAdvisor {
    fn diagnose(&self, summary: &str, context: &Value) -> Result<String> {
        let advisor_err = |reason: String| EngineError::Advisor { reason };
        let request = GenerateRequest {
            model: &self.model,
            prompt: compose_prompt(summary, context),
            system: &self.system_prompt,
            stream: false,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .map_err(|e| advisor_err(format!("{}: {}", self.url, e)))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(advisor_err(format!(
                "model '{}' not available (try `ollama pull {}`)",
                self.model, self.model
            )));
        }
        if !status.is_success() {
            return Err(advisor_err(format!("{} returned HTTP {}", self.url, status)));
        }
        let body: GenerateResponse = resp
            .json()
            .map_err(|e| advisor_err(format!("unreadable response: {}", e)))?;
        Ok(body.response.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ek041_request_shape() {
        let req = GenerateRequest {
            model: "gemma3:4b",
            prompt: "p".to_string(),
            system: "s",
            stream: false,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["model"], "gemma3:4b");
        assert_eq!(v["stream"], false);
        assert_eq!(v["system"], "s");
    }

    #[test]
    fn test_ek041_system_prompt_override_first() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Namespaces::new(dir.path(), vec!["enterprise".into(), "core".into()]);
        assert_eq!(load_system_prompt(&ns), DEFAULT_SYSTEM_PROMPT);

        let core = dir.path().join("core").join("prompts");
        std::fs::create_dir_all(&core).unwrap();
        std::fs::write(core.join("capabilities.txt"), "core prompt").unwrap();
        assert_eq!(load_system_prompt(&ns), "core prompt");

        let ent = dir.path().join("enterprise").join("prompts");
        std::fs::create_dir_all(&ent).unwrap();
        std::fs::write(ent.join("capabilities.txt"), "enterprise prompt").unwrap();
        assert_eq!(load_system_prompt(&ns), "enterprise prompt");
    }

    #[test]
    fn test_ek041_disabled_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Namespaces::new(dir.path(), vec!["core".into()]);
        let cfg = AdvisorConfig {
            enabled: false,
            ..AdvisorConfig::default()
        };
        assert!(OllamaAdvisor::from_config(&cfg, &ns).is_none());
    }

    #[test]
    fn test_ek041_unreachable_is_advisor_error() {
        let cfg = AdvisorConfig {
            url: "http://127.0.0.1:9/api/generate".to_string(),
            timeout_secs: 2,
            ..AdvisorConfig::default()
        };
        let advisor = OllamaAdvisor::new(&cfg, "s".to_string()).unwrap();
        let err = advisor
            .diagnose("x", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, EngineError::Advisor { .. }));
    }
}
