//! Failure handlers deciding which non-zero exits are errors.

use super::{CommandError, CommandOutput, CommandResult};
use tracing::info;

/// Called with the command line and its output whenever the exit status is
/// non-zero. Returning `Ok(())` downgrades the failure.
pub type FailureHandler = fn(&str, &CommandOutput) -> CommandResult<()>;

const ROUTE_EXISTS: &str = "RTNETLINK answers: File exists";

/// Default handler: every non-zero exit is an error carrying stderr.
pub fn fail_on_error(command: &str, output: &CommandOutput) -> CommandResult<()> {
    Err(CommandError::Failed {
        command: command.to_string(),
        status: output.status,
        stderr: output.stderr.clone(),
    })
}

/// `ip route add` for a route that is already installed is not an error.
pub fn route_exists_is_ok(command: &str, output: &CommandOutput) -> CommandResult<()> {
    if output.stderr == ROUTE_EXISTS {
        info!(command, "route already exists, considering it a success");
        return Ok(());
    }
    fail_on_error(command, output)
}

/// Never fails; the caller inspects the output itself.
pub fn accept_any_exit(_command: &str, _output: &CommandOutput) -> CommandResult<()> {
    Ok(())
}
