//! EK-015: Append-only JSONL provenance event log, one per environment.

use crate::core::error::{EngineError, Result};
use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Generate an ISO 8601 timestamp.
pub fn now_iso8601() -> String {
    // Manual implementation, no chrono dependency
    use std::time::{SystemTime, UNIX_EPOCH};
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();
    // Simple UTC conversion (good enough, no TZ complexity)
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Days since epoch to Y-M-D (simplified Gregorian)
    let mut y = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(y) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        y += 1;
    }
    let leap = is_leap(y);
    let month_days = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut m = 0;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md as i64 {
            m = i + 1;
            break;
        }
        remaining -= md as i64;
    }
    let d = remaining + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y, m, d, hours, minutes, seconds
    )
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Log directory used before an environment name is known.
pub const UNBOUND_LOG: &str = "_unbound";

/// Derive the event log path for an environment.
pub fn event_log_path(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir.join(environment).join("events.jsonl")
}

/// Append an event to the environment's event log.
pub fn append_event(state_dir: &Path, environment: &str, event: ProvenanceEvent) -> Result<()> {
    let path = event_log_path(state_dir, environment);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| EngineError::Serialize {
        what: "event".to_string(),
        reason: e.to_string(),
    })?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| EngineError::io(&path, e))?;

    writeln!(file, "{}", json).map_err(|e| EngineError::io(&path, e))?;

    Ok(())
}

/// Last `n` lines of an environment's event log (empty if none).
pub fn tail_events(state_dir: &Path, environment: &str, n: usize) -> Vec<String> {
    let path = event_log_path(state_dir, environment);
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| l.to_string())
        .collect()
}

/// Event sink bound to one run. Write failures are logged, never fatal.
#[derive(Debug, Clone)]
pub struct RunLog {
    state_dir: PathBuf,
    environment: String,
    run_id: String,
}

impl RunLog {
    pub fn new(state_dir: &Path, run_id: &str) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            environment: UNBOUND_LOG.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Route subsequent events to `environment`'s log.
    pub fn bind(&mut self, environment: &str) {
        self.environment = environment.to_string();
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn record(&self, event: ProvenanceEvent) {
        if let Err(e) = append_event(&self.state_dir, &self.environment, event) {
            tracing::warn!("cannot write event log: {}", e);
        }
    }
}
