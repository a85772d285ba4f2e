//! Errors surfaced by the tunnel lifecycle manager.

use std::net::Ipv4Addr;
use thiserror::Error;

use crate::command::CommandError;
use crate::sequencer::SequenceError;
use crate::store::StoreError;
use crate::types::ParseError;

/// Result type for lifecycle operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

fn render_setup_failure(name: &str, daemon: &str, output: &str) -> String {
    std::iter::once(format!("Failed to set up the tunnel\n{daemon} up {name}'s output:"))
        .chain(output.lines().map(str::to_string))
        .collect::<Vec<_>>()
        .join("\n    ")
}

/// Errors raised by gateway and tunnel operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A gateway descriptor or the gateway interface is already present
    #[error("A gateway already exists")]
    GatewayExists,

    /// No gateway has been created
    #[error("There is no local gateway")]
    NoGateway,

    #[error("A tunnel named {0} already exists")]
    DuplicateName(String),

    #[error("A tunnel from {0} to {1} already exists")]
    DuplicateEndpoints(Ipv4Addr, Ipv4Addr),

    #[error("No tunnel named {0} exists")]
    TunnelNotFound(String),

    /// Installed locally, but the bring-up timed out
    #[error("Tunnel '{0}' is set up locally, but the remote gateway couldn't be reached")]
    RemoteUnreachable(String),

    /// Installed locally, but the peer rejected the negotiation
    #[error("Tunnel '{0}' is set up, but the connection couldn't be authenticated on the other side")]
    AuthFailed(String),

    /// Bring-up failed for another reason; the tunnel has been removed again
    #[error("{}", render_setup_failure(.name, .daemon, .output))]
    SetupFailed {
        name: String,
        daemon: String,
        output: String,
    },

    /// Unparsable value read back from the host
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
