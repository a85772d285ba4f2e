//! Ordered execution of commands with reverse-order compensation.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::command::{CommandExecutor, ShellCommand};

/// Failure of a step sequence, after compensation has been attempted.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("{}", render_step_failure(.command, .message, .undo_failures))]
    StepFailed {
        /// Command text of the step that failed
        command: String,
        /// Underlying failure message
        message: String,
        /// Compensating commands that failed themselves
        undo_failures: Vec<String>,
    },
}

fn indent(header: String, body: &str) -> String {
    std::iter::once(header)
        .chain(body.lines().map(str::to_string))
        .collect::<Vec<_>>()
        .join("\n    ")
}

fn render_step_failure(command: &str, message: &str, undo_failures: &[String]) -> String {
    let mut rendered = indent(format!("Failed to execute '{command}':"), message);
    if !undo_failures.is_empty() {
        rendered.push('\n');
        rendered.push_str(&indent(
            "Rollback incomplete, manual cleanup required:".to_string(),
            &undo_failures.join("\n"),
        ));
    }
    rendered
}

/// Runs steps in order and unwinds completed steps when one fails.
///
/// Compensation is best effort: a failing undo is logged and reported, never
/// retried, and nothing verifies that an undo actually restored the host.
#[derive(Debug, Clone)]
pub struct StepSequencer {
    grace_period: Duration,
}

impl StepSequencer {
    /// `grace_period` is waited after compensation so asynchronous teardown
    /// (daemon shutdown, link removal) settles before the error surfaces.
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub async fn run(
        &self,
        steps: &[ShellCommand],
        executor: &dyn CommandExecutor,
    ) -> Result<(), SequenceError> {
        for (index, step) in steps.iter().enumerate() {
            debug!(step = index, command = step.command(), "executing step");

            if let Err(e) = step.run(executor).await {
                error!(step = index, command = step.command(), "step failed: {e}");
                let undo_failures = self.rollback(&steps[..index], executor).await;
                return Err(SequenceError::StepFailed {
                    command: step.command().to_string(),
                    message: e.to_string(),
                    undo_failures,
                });
            }
        }
        Ok(())
    }

    /// Undo `completed` in reverse order, then wait out the grace period.
    /// Returns a description of every compensating command that failed.
    pub async fn rollback(
        &self,
        completed: &[ShellCommand],
        executor: &dyn CommandExecutor,
    ) -> Vec<String> {
        info!(steps = completed.len(), "rolling back completed steps");
        let mut failures = Vec::new();

        for step in completed.iter().rev() {
            if let Some(Err(e)) = step.undo(executor).await {
                let undo = step.undo_command().unwrap_or_default();
                warn!(command = undo, "rollback step failed");
                failures.push(format!("'{undo}': {e}"));
            }
        }

        if !self.grace_period.is_zero() {
            tokio::time::sleep(self.grace_period).await;
        }
        failures
    }
}
