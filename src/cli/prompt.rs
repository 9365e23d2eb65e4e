//! EK-018: Operator prompts: terminal menus and the non-interactive fallback.

use crate::core::controller::{Choice, OperatorPrompt};
use crate::core::types::{FailureContext, RetryStrategy};
use dialoguer::{theme::ColorfulTheme, Select};

/// Menu offered after a failure, in display order.
pub fn decision_menu(can_retry: bool) -> Vec<(String, Choice)> {
    let mut menu = Vec::new();
    if can_retry {
        for (label, strategy) in [
            ("Retry", RetryStrategy::Standard),
            ("Retry without installer caches", RetryStrategy::NoCache),
            ("Retry with extended timeouts", RetryStrategy::ExtendedTimeouts),
            ("Retry with the cached catalog (offline)", RetryStrategy::OfflineCatalog),
        ] {
            menu.push((label.to_string(), Choice::Retry(strategy)));
        }
    }
    menu.push(("Ask the advisor for a diagnosis".to_string(), Choice::AskAdvisor));
    menu.push(("Write a failure report and stop".to_string(), Choice::ReportAndStop));
    menu.push(("Abort".to_string(), Choice::Abort));
    menu
}

fn print_failure(failure: &FailureContext, attempt: u32, max_attempts: u32) {
    eprintln!();
    eprintln!(
        "Attempt {}/{} failed at {}: {}",
        attempt, max_attempts, failure.stage, failure.summary
    );
    if !failure.args.is_empty() {
        eprintln!("  Command: {}", failure.args.join(" "));
    }
    for line in failure.stderr.lines().rev().take(10).collect::<Vec<_>>().into_iter().rev() {
        eprintln!("  | {}", line);
    }
}

/// Interactive prompt on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl OperatorPrompt for TerminalPrompt {
    fn choose_use_case(&self, available: &[String], preselected: Option<&str>) -> Option<String> {
        if let Some(p) = preselected.filter(|p| available.iter().any(|a| a == p)) {
            println!("Resuming use case '{}'", p);
            return Some(p.to_string());
        }
        if available.is_empty() {
            return None;
        }
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select a use case")
            .items(available)
            .default(0)
            .interact_opt()
            .ok()??;
        available.get(selection).cloned()
    }

    fn decide(&self, failure: &FailureContext, attempt: u32, max_attempts: u32, can_retry: bool) -> Choice {
        print_failure(failure, attempt, max_attempts);
        let menu = decision_menu(can_retry);
        let labels: Vec<&str> = menu.iter().map(|(l, _)| l.as_str()).collect();
        match Select::with_theme(&ColorfulTheme::default())
            .with_prompt("What next?")
            .items(&labels)
            .default(0)
            .interact_opt()
        {
            Ok(Some(i)) => menu.get(i).map_or(Choice::Abort, |(_, c)| *c),
            _ => Choice::Abort,
        }
    }

    fn show(&self, text: &str) {
        println!();
        println!("{}", text);
    }
}

/// Never asks: resumes a known use case, aborts on any failure.
#[derive(Debug, Default)]
pub struct NonInteractive;

impl OperatorPrompt for NonInteractive {
    fn choose_use_case(&self, available: &[String], preselected: Option<&str>) -> Option<String> {
        preselected
            .filter(|p| available.iter().any(|a| a == p))
            .map(str::to_string)
    }

    fn decide(&self, failure: &FailureContext, attempt: u32, max_attempts: u32, _can_retry: bool) -> Choice {
        print_failure(failure, attempt, max_attempts);
        Choice::Abort
    }

    fn show(&self, text: &str) {
        println!("{}", text);
    }
}
