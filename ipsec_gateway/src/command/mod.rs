//! External command execution.
//!
//! Every interaction with the switch, the kernel and the IPsec daemon is a
//! shell command run through a [`CommandExecutor`]. A [`ShellCommand`] wraps
//! one such command together with an optional compensating command, a
//! failure handler that decides which non-zero exits are real errors, and an
//! optional deadline.

mod handlers;
mod shell;

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use handlers::{accept_any_exit, fail_on_error, route_exists_is_ok, FailureHandler};
pub use shell::ShellExecutor;

/// Result type for command operations.
pub type CommandResult<T> = Result<T, CommandError>;

/// Errors raised while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The shell could not be started at all
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command exited with a status its failure handler did not accept
    #[error("{}", describe_failure(*.status, .stderr))]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The deadline passed before the command completed
    #[error("'{command}' did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

fn describe_failure(status: i32, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("exited with status {status}")
    } else {
        stderr.to_string()
    }
}

/// Captured result of a completed command. Both streams are trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: stdout.into().trim().to_string(),
            stderr: stderr.into().trim().to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout followed by stderr, skipping whichever is empty.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            (true, _) => self.stderr.clone(),
        }
    }
}

/// Runs a shell command line on the host.
///
/// With a `timeout`, implementations must run the command in its own process
/// group and terminate the whole group when the deadline passes, returning
/// [`CommandError::Timeout`] instead of a status.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, timeout: Option<Duration>)
        -> CommandResult<CommandOutput>;
}

/// One external operation with its optional compensation.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    undo: Option<String>,
    on_failure: FailureHandler,
    timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            undo: None,
            on_failure: fail_on_error,
            timeout: None,
        }
    }

    /// Register the command that reverses this one.
    pub fn with_undo(mut self, undo: impl Into<String>) -> Self {
        self.undo = Some(undo.into());
        self
    }

    /// Replace the default failure handler.
    pub fn on_failure(mut self, handler: FailureHandler) -> Self {
        self.on_failure = handler;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn undo_command(&self) -> Option<&str> {
        self.undo.as_deref()
    }

    /// Run the command. Non-zero exits are passed to the failure handler,
    /// which either raises or lets the output through.
    pub async fn run(&self, executor: &dyn CommandExecutor) -> CommandResult<CommandOutput> {
        debug!(command = %self.command, timeout = ?self.timeout, "running command");
        let output = executor.execute(&self.command, self.timeout).await?;
        if !output.success() {
            (self.on_failure)(&self.command, &output)?;
        }
        Ok(output)
    }

    /// Run the compensating command, if any.
    ///
    /// The outcome never propagates as an error of the command it compensates;
    /// it is logged and handed back so a caller can report it.
    pub async fn undo(&self, executor: &dyn CommandExecutor) -> Option<CommandResult<()>> {
        let undo = self.undo.as_deref()?;
        debug!(command = %undo, "running compensating command");

        let result = match executor.execute(undo, None).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => fail_on_error(undo, &output),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(command = %undo, "compensating command failed: {e}");
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedExecutor {
        output: CommandOutput,
        seen: Mutex<Vec<String>>,
    }

    impl FixedExecutor {
        fn new(output: CommandOutput) -> Self {
            Self {
                output,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for FixedExecutor {
        async fn execute(
            &self,
            command: &str,
            _timeout: Option<Duration>,
        ) -> CommandResult<CommandOutput> {
            self.seen.lock().unwrap().push(command.to_string());
            Ok(self.output.clone())
        }
    }

    #[tokio::test]
    async fn default_handler_turns_stderr_into_error() {
        let exec = FixedExecutor::new(CommandOutput::new(2, "", "boom\n"));
        let err = ShellCommand::new("false").run(&exec).await.unwrap_err();
        match err {
            CommandError::Failed {
                command,
                status,
                stderr,
            } => {
                assert_eq!(command, "false");
                assert_eq!(status, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_handler_can_downgrade_failure() {
        let exec = FixedExecutor::new(CommandOutput::new(2, "", "RTNETLINK answers: File exists"));
        let output = ShellCommand::new("ip route add 10.0.0.1/32 dev x")
            .on_failure(route_exists_is_ok)
            .run(&exec)
            .await
            .unwrap();
        assert_eq!(output.status, 2);
    }

    #[tokio::test]
    async fn undo_is_none_without_compensation() {
        let exec = FixedExecutor::new(CommandOutput::default());
        assert!(ShellCommand::new("true").undo(&exec).await.is_none());
        assert!(exec.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undo_failure_is_reported_not_raised() {
        let exec = FixedExecutor::new(CommandOutput::new(1, "", "Cannot find device"));
        let cmd = ShellCommand::new("ip link add a type veth peer name b")
            .with_undo("ip link delete a");
        let outcome = cmd.undo(&exec).await;
        assert!(matches!(outcome, Some(Err(CommandError::Failed { .. }))));
        assert_eq!(*exec.seen.lock().unwrap(), vec!["ip link delete a".to_string()]);
    }

    #[test]
    fn combined_output_skips_empty_streams() {
        assert_eq!(CommandOutput::new(0, "out", "").combined(), "out");
        assert_eq!(CommandOutput::new(0, "", "err").combined(), "err");
        assert_eq!(CommandOutput::new(0, "out", "err").combined(), "out\nerr");
    }

    #[test]
    fn failed_error_falls_back_to_status() {
        let err = CommandError::Failed {
            command: "x".into(),
            status: 3,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "exited with status 3");
    }
}
