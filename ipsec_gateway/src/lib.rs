//! Provisioning engine for transparent IPsec tunnels over an Open vSwitch
//! bridge.
//!
//! The crate creates a local IPsec gateway (a veth pair attached to the
//! bridge, plus the strongSwan daemon) and adds or removes tunnels on it,
//! keeping the switch flows, the kernel routes and the daemon's files in
//! step with each other.

pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod rules;
pub mod sequencer;
pub mod store;
pub mod types;

pub use command::{CommandError, CommandExecutor, CommandOutput, ShellCommand, ShellExecutor};
pub use config::{Config, ConfigError};
pub use error::{ManagerError, ManagerResult};
pub use manager::TunnelLifecycleManager;
pub use sequencer::{SequenceError, StepSequencer};
pub use store::{ConfigStore, GatewayFile, GatewayStore, StoreError};
pub use types::{GatewayCidr, GatewayDescriptor, MacAddr, ParseError, TunnelEntry, TunnelRecord};
