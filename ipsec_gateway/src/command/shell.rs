//! Production executor running command lines through `sh -c`.

use super::{CommandError, CommandExecutor, CommandOutput, CommandResult};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

/// Runs commands with the system shell.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(&self, command: &str) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn spawn_error(command: &str, source: io::Error) -> CommandError {
        CommandError::Spawn {
            command: command.to_string(),
            source,
        }
    }

    fn capture(output: Output) -> CommandOutput {
        CommandOutput::new(
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        )
    }

    async fn run_to_completion(&self, command: &str) -> CommandResult<CommandOutput> {
        let output = self
            .build(command)
            .output()
            .await
            .map_err(|e| Self::spawn_error(command, e))?;
        Ok(Self::capture(output))
    }

    /// The child leads its own process group so that anything it spawns is
    /// terminated together with it when the deadline passes.
    async fn run_with_deadline(
        &self,
        command: &str,
        timeout: Duration,
    ) -> CommandResult<CommandOutput> {
        let mut cmd = self.build(command);
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| Self::spawn_error(command, e))?;
        let pgid = child.id();
        let mut task = tokio::spawn(child.wait_with_output());

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => {
                let output = joined
                    .map_err(|e| Self::spawn_error(command, io::Error::other(e.to_string())))?
                    .map_err(|e| Self::spawn_error(command, e))?;
                Ok(Self::capture(output))
            }
            Err(_) => {
                warn!(command, ?timeout, "deadline passed, terminating process group");
                if let Some(pid) = pgid {
                    if let Err(errno) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        warn!(command, pgid = pid, "failed to signal process group: {errno}");
                    }
                }
                // Join so no child outlives the call.
                let _ = task.await;
                Err(CommandError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> CommandResult<CommandOutput> {
        let output = match timeout {
            Some(limit) => self.run_with_deadline(command, limit).await?,
            None => self.run_to_completion(command).await?,
        };
        debug!(command, status = output.status, stdout = %output.stdout, stderr = %output.stderr, "command finished");
        Ok(output)
    }
}
