//! EK-008: Retry/escalation controller.
//!
//! Wraps attempts in a bounded loop. After a failure the operator picks a
//! retry strategy, consults the advisor, reports and stops, or aborts. The
//! three terminal signals stay distinct until the CLI lowers them to exit
//! codes.

use super::error::Result;
use super::report::FailureReporter;
use super::state::{clear_history, save_history, History};
use super::types::{AttemptOutcome, FailureContext, InstallState, RetryStrategy};
use crate::advisor::Advisor;
use std::path::Path;

/// Where the controller stands after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Attempting,
    Success,
    /// Retryable failure with attempts left
    NeedsRetry,
    /// Fatal failure, or attempts exhausted
    NeedsEscalation,
    /// Operator aborted during the attempt
    Aborted,
}

/// Operator decision after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Retry(RetryStrategy),
    AskAdvisor,
    ReportAndStop,
    Abort,
}

/// Terminal signal of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Success,
    RetryableFailure,
    Escalated,
}

impl RunExit {
    /// Process exit code. 2 is left to clap for usage errors.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::RetryableFailure => 1,
            Self::Escalated => 3,
        }
    }
}

/// Operator interaction seam.
pub trait OperatorPrompt {
    /// Pick a use case; `preselected` comes from the history record.
    fn choose_use_case(&self, available: &[String], preselected: Option<&str>) -> Option<String>;

    fn decide(&self, failure: &FailureContext, attempt: u32, max_attempts: u32, can_retry: bool) -> Choice;

    fn show(&self, text: &str);
}

/// One pass of the provisioning pipeline.
pub trait AttemptRunner {
    fn attempt(&self, state: &mut InstallState, strategy: RetryStrategy) -> AttemptOutcome;
}

/// State after an attempt's outcome.
pub fn next_state(outcome: &AttemptOutcome, attempt: u32, max_attempts: u32) -> ControllerState {
    match outcome {
        AttemptOutcome::Success => ControllerState::Success,
        AttemptOutcome::UserAbort => ControllerState::Aborted,
        AttemptOutcome::RetryableFailure(_) if attempt < max_attempts => ControllerState::NeedsRetry,
        AttemptOutcome::RetryableFailure(_) | AttemptOutcome::FatalFailure(_) => {
            ControllerState::NeedsEscalation
        }
    }
}

pub struct Controller<'a> {
    pub prompt: &'a dyn OperatorPrompt,
    pub advisor: Option<&'a dyn Advisor>,
    pub reporter: &'a dyn FailureReporter,
    pub state_dir: &'a Path,
    pub max_attempts: u32,
}

impl Controller<'_> {
    /// Drive attempts until a terminal signal. `history` carries the
    /// strategy and attempt count from a previous invocation.
    pub fn run(&self, runner: &dyn AttemptRunner, mut history: History) -> Result<RunExit> {
        let mut state = ControllerState::Attempting;
        loop {
            debug_assert_eq!(state, ControllerState::Attempting);
            history.attempts += 1;
            tracing::info!(
                attempt = history.attempts,
                max = self.max_attempts,
                strategy = %history.strategy,
                "starting attempt"
            );

            let outcome = runner.attempt(&mut history.state, history.strategy);
            state = next_state(&outcome, history.attempts, self.max_attempts);

            let failure = match (state, outcome) {
                (ControllerState::Success, _) => {
                    clear_history(self.state_dir)?;
                    return Ok(RunExit::Success);
                }
                (ControllerState::Aborted, _) => return Ok(RunExit::RetryableFailure),
                (_, AttemptOutcome::RetryableFailure(ctx) | AttemptOutcome::FatalFailure(ctx)) => ctx,
                (_, other) => {
                    tracing::warn!("unexpected outcome {:?}", other);
                    return Ok(RunExit::RetryableFailure);
                }
            };
            history.state.last_failure = Some(failure.clone());
            let can_retry = state == ControllerState::NeedsRetry;

            match self.resolve_failure(&mut history, &failure, can_retry)? {
                Some(exit) => return Ok(exit),
                None => state = ControllerState::Attempting,
            }
        }
    }

    /// Prompt until the operator picks something that ends the failure.
    /// None means "retry".
    fn resolve_failure(
        &self,
        history: &mut History,
        failure: &FailureContext,
        can_retry: bool,
    ) -> Result<Option<RunExit>> {
        loop {
            match self.prompt.decide(failure, history.attempts, self.max_attempts, can_retry) {
                Choice::Retry(strategy) if can_retry => {
                    history.strategy = strategy;
                    save_history(self.state_dir, history)?;
                    return Ok(None);
                }
                Choice::Retry(_) => {
                    self.prompt.show("No attempts left for this failure.");
                }
                Choice::AskAdvisor => self.consult(&history.state, failure),
                Choice::ReportAndStop => {
                    match self.reporter.report(&history.state) {
                        Ok(path) => self.prompt.show(&format!("Report written to {}", path.display())),
                        Err(e) => tracing::warn!("failure report not written: {}", e),
                    }
                    return Ok(Some(RunExit::Escalated));
                }
                Choice::Abort => return Ok(Some(RunExit::RetryableFailure)),
            }
        }
    }

    fn consult(&self, state: &InstallState, failure: &FailureContext) {
        let Some(advisor) = self.advisor else {
            self.prompt.show("No advisor configured.");
            return;
        };
        let context = serde_json::json!({
            "use_case": state.use_case,
            "environment": state.env_name,
            "failure": failure,
        });
        match advisor.diagnose(&failure.summary, &context) {
            Ok(text) => self.prompt.show(&text),
            Err(e) => {
                tracing::warn!("{}", e);
                self.prompt.show("Advisor unavailable; continuing without a diagnosis.");
            }
        }
    }
}
