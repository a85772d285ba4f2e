//! Gateway and tunnel lifecycle.
//!
//! The manager keeps three stores consistent with each other: the OVS flow
//! table, the kernel routing table and the daemon's connection and secrets
//! files. None of them is transactional, so every operation checks its
//! preconditions before touching anything and compensates by hand where a
//! later step can fail.
//!
//! One manager per host at a time. Nothing here locks; concurrent
//! invocations against the same files are not supported.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::command::{
    accept_any_exit, route_exists_is_ok, CommandError, CommandExecutor, CommandOutput,
    ShellCommand,
};
use crate::config::Config;
use crate::error::{ManagerError, ManagerResult};
use crate::rules::{Daemon, GatewayRules};
use crate::sequencer::StepSequencer;
use crate::store::{check_identifier, ConfigStore, GatewayFile, GatewayStore, StoreError, Templates};
use crate::types::{GatewayCidr, GatewayDescriptor, MacAddr, TunnelEntry, TunnelRecord};

/// Markers the daemon prints when the peer rejects the negotiation.
const AUTH_FAILURE_MARKERS: [&str; 2] = ["AUTHENTICATION_FAILED", "NO_PROPOSAL_CHOSEN"];

/// How a bring-up attempt ended, judged from the daemon's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpOutcome {
    Established,
    AuthRejected,
    Failed,
}

/// Classify the combined output of `<daemon> up <name>`.
pub fn classify_up_output(name: &str, output: &str) -> UpOutcome {
    if output.contains(&format!("connection '{name}' established successfully")) {
        UpOutcome::Established
    } else if AUTH_FAILURE_MARKERS.iter().any(|m| output.contains(m)) {
        UpOutcome::AuthRejected
    } else {
        UpOutcome::Failed
    }
}

/// Creates and destroys the gateway, and adds and removes tunnels on it.
pub struct TunnelLifecycleManager {
    executor: Arc<dyn CommandExecutor>,
    gateway: Box<dyn GatewayStore>,
    store: ConfigStore,
    sequencer: StepSequencer,
    daemon: Daemon,
    ovs_port: String,
    interface: String,
    ip_forward_sysctl: PathBuf,
    up_timeout: Duration,
}

impl TunnelLifecycleManager {
    /// Build a manager over the files named in `config`.
    pub fn from_config(config: &Config, executor: Arc<dyn CommandExecutor>) -> ManagerResult<Self> {
        let templates =
            Templates::resolve(config.paths.template_dir.as_deref()).map_err(StoreError::from)?;
        let gateway = GatewayFile::new(&config.paths.gateway_descriptor, templates.gateway.clone());
        let store = ConfigStore::new(&config.paths.ipsec_conf, &config.paths.ipsec_secrets, templates)?;
        Ok(Self::new(config, executor, Box::new(gateway), store))
    }

    pub fn new(
        config: &Config,
        executor: Arc<dyn CommandExecutor>,
        gateway: Box<dyn GatewayStore>,
        store: ConfigStore,
    ) -> Self {
        Self {
            executor,
            gateway,
            store,
            sequencer: StepSequencer::new(config.rollback.grace_period()),
            daemon: Daemon::new(&config.daemon.command),
            ovs_port: config.gateway.ovs_port.clone(),
            interface: config.gateway.interface.clone(),
            ip_forward_sysctl: config.paths.ip_forward_sysctl.clone(),
            up_timeout: config.daemon.up_timeout(),
        }
    }

    async fn run(&self, command: ShellCommand) -> ManagerResult<CommandOutput> {
        Ok(command.run(self.executor.as_ref()).await?)
    }

    async fn run_line(&self, command: String) -> ManagerResult<CommandOutput> {
        self.run(ShellCommand::new(command)).await
    }

    fn rules<'a>(&'a self, descriptor: &'a GatewayDescriptor) -> GatewayRules<'a> {
        GatewayRules {
            bridge: &descriptor.ovs_bridge,
            ovs_port: &self.ovs_port,
            interface: &self.interface,
        }
    }

    /// Whether the gateway interface is present on the host.
    pub async fn interface_exists(&self) -> ManagerResult<bool> {
        let command = format!("ip link show {}", self.interface);
        let output = self
            .run(ShellCommand::new(&command).on_failure(accept_any_exit))
            .await?;
        if output.success() {
            return Ok(true);
        }
        if output.stderr.contains("does not exist") {
            return Ok(false);
        }
        Err(CommandError::Failed {
            command,
            status: output.status,
            stderr: output.stderr,
        }
        .into())
    }

    async fn read_interface_mac(&self) -> ManagerResult<MacAddr> {
        let output = self
            .run_line(format!("cat /sys/class/net/{}/address", self.interface))
            .await?;
        Ok(output.stdout.parse()?)
    }

    fn creation_steps(&self, ovs_bridge: &str, gateway_ip: GatewayCidr) -> Vec<ShellCommand> {
        let port = &self.ovs_port;
        let iface = &self.interface;
        vec![
            ShellCommand::new(format!("ip link add {port} type veth peer name {iface}"))
                .with_undo(format!("ip link delete {port}")),
            ShellCommand::new(format!("ovs-vsctl add-port {ovs_bridge} {port}"))
                .with_undo(format!("ovs-vsctl del-port {ovs_bridge} {port}")),
            ShellCommand::new(format!("ip link set {port} up")),
            ShellCommand::new(format!("ip link set {iface} up")),
            ShellCommand::new(format!("echo 1 > {}", self.ip_forward_sysctl.display())),
            ShellCommand::new(format!("ip addr add {gateway_ip} dev {iface}")),
            ShellCommand::new(self.daemon.start()).with_undo(self.daemon.stop()),
        ]
    }

    /// Create the veth pair, attach it to `ovs_bridge`, address it and start
    /// the daemon. Any failure unwinds the steps already taken.
    pub async fn create_gateway(
        &self,
        ovs_bridge: &str,
        gateway_ip: GatewayCidr,
    ) -> ManagerResult<GatewayDescriptor> {
        check_identifier("OVS bridge", ovs_bridge)?;
        if self.gateway.load()?.is_some() || self.interface_exists().await? {
            return Err(ManagerError::GatewayExists);
        }

        info!(bridge = ovs_bridge, gateway = %gateway_ip, "creating IPsec gateway");
        let steps = self.creation_steps(ovs_bridge, gateway_ip);
        self.sequencer.run(&steps, self.executor.as_ref()).await?;

        match self.record_gateway(ovs_bridge, gateway_ip).await {
            Ok(descriptor) => {
                info!(mac = %descriptor.gateway_mac, "gateway created");
                Ok(descriptor)
            }
            Err(e) => {
                error!("gateway created but could not be recorded: {e}");
                for failure in self.sequencer.rollback(&steps, self.executor.as_ref()).await {
                    warn!("rollback incomplete: {failure}");
                }
                if let Err(remove_err) = self.gateway.remove() {
                    warn!("failed to remove gateway descriptor: {remove_err}");
                }
                Err(e)
            }
        }
    }

    async fn record_gateway(
        &self,
        ovs_bridge: &str,
        gateway_ip: GatewayCidr,
    ) -> ManagerResult<GatewayDescriptor> {
        let descriptor = GatewayDescriptor {
            gateway_ip,
            gateway_mac: self.read_interface_mac().await?,
            ovs_bridge: ovs_bridge.to_string(),
        };
        self.gateway.save(&descriptor)?;
        self.store.ensure_managed_region()?;
        Ok(descriptor)
    }

    /// Remove every tunnel, then the gateway itself.
    pub async fn destroy_gateway(&self) -> ManagerResult<()> {
        let descriptor = self.gateway.load()?.ok_or(ManagerError::NoGateway)?;
        info!(bridge = %descriptor.ovs_bridge, "destroying IPsec gateway");

        for tunnel in self.list_tunnels()? {
            self.remove_tunnel(&tunnel.name).await?;
        }

        self.run_line(format!(
            "ovs-vsctl del-port {} {}",
            descriptor.ovs_bridge, self.ovs_port
        ))
        .await?;
        self.run_line(format!("ip link delete {}", self.ovs_port))
            .await?;
        self.run_line(self.daemon.stop()).await?;
        self.gateway.remove()?;

        info!("gateway destroyed");
        Ok(())
    }

    /// Every managed tunnel in creation order.
    ///
    /// A connection file without the managed region simply has no tunnels.
    pub fn list_tunnels(&self) -> ManagerResult<Vec<TunnelRecord>> {
        match self.store.list_tunnels() {
            Err(StoreError::ManagedRegionMissing(path)) => {
                debug!(file = %path.display(), "no managed region yet");
                Ok(Vec::new())
            }
            other => Ok(other?),
        }
    }

    /// Write the tunnel's daemon configuration, install its flows and
    /// route, and bring it up.
    pub async fn add_tunnel(&self, entry: &TunnelEntry) -> ManagerResult<()> {
        let descriptor = self.gateway.load()?.ok_or(ManagerError::NoGateway)?;

        for existing in self.list_tunnels()? {
            if existing.name == entry.name {
                return Err(ManagerError::DuplicateName(entry.name.clone()));
            }
            if existing.source_ip == entry.source_ip && existing.dest_ip == entry.dest_ip {
                return Err(ManagerError::DuplicateEndpoints(entry.source_ip, entry.dest_ip));
            }
        }

        info!(
            tunnel = %entry.name,
            source = %entry.source_ip,
            dest = %entry.dest_ip,
            remote = %entry.remote_gateway_ip,
            "adding IPsec tunnel"
        );
        self.store.ensure_managed_region()?;
        self.store.append_tunnel(entry, descriptor.gateway_ip.addr())?;

        let rules = self.rules(&descriptor);
        self.run_line(rules.forwarding_flow(entry.source_ip, entry.dest_ip, &descriptor.gateway_mac))
            .await?;
        self.run_line(rules.arp_spoof_flow(entry.source_ip, entry.dest_ip))
            .await?;
        self.run(
            ShellCommand::new(rules.host_route_add(entry.source_ip)).on_failure(route_exists_is_ok),
        )
        .await?;
        self.run_line(self.daemon.update()).await?;
        self.run_line(self.daemon.secrets()).await?;

        self.bring_up(&entry.name).await
    }

    async fn bring_up(&self, name: &str) -> ManagerResult<()> {
        let up = ShellCommand::new(self.daemon.up(name))
            .on_failure(accept_any_exit)
            .with_timeout(self.up_timeout);

        let output = match up.run(self.executor.as_ref()).await {
            Ok(output) => output.combined(),
            Err(CommandError::Timeout { .. }) => {
                warn!(tunnel = name, timeout = ?self.up_timeout, "remote gateway did not answer");
                return Err(ManagerError::RemoteUnreachable(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match classify_up_output(name, &output) {
            UpOutcome::Established => {
                info!(tunnel = name, "tunnel established");
                Ok(())
            }
            UpOutcome::AuthRejected => {
                warn!(tunnel = name, "peer rejected authentication");
                Err(ManagerError::AuthFailed(name.to_string()))
            }
            UpOutcome::Failed => {
                error!(tunnel = name, "tunnel setup failed, removing it");
                if let Err(e) = self.remove_tunnel(name).await {
                    warn!(tunnel = name, "cleanup after failed setup failed: {e}");
                }
                Err(ManagerError::SetupFailed {
                    name: name.to_string(),
                    daemon: self.daemon.command().to_string(),
                    output,
                })
            }
        }
    }

    /// Remove the tunnel's configuration, flows and, unless another tunnel
    /// still uses its source address, its host route.
    pub async fn remove_tunnel(&self, name: &str) -> ManagerResult<()> {
        if !self.list_tunnels()?.iter().any(|t| t.name == name) {
            return Err(ManagerError::TunnelNotFound(name.to_string()));
        }
        let descriptor = self.gateway.load()?.ok_or(ManagerError::NoGateway)?;
        let (source, dest) = self.store.tunnel_endpoints(name)?;

        info!(tunnel = name, source = %source, dest = %dest, "removing IPsec tunnel");
        self.store.remove_tunnel_blocks(name)?;

        // Once the blocks are gone nothing can find this tunnel again, so
        // every remaining command runs and only the first failure is reported.
        let rules = self.rules(&descriptor);
        let mut commands = vec![
            self.daemon.update(),
            self.daemon.secrets(),
            self.daemon.down(name),
            rules.forwarding_flow_delete(source, dest),
            rules.arp_flow_delete(source),
        ];

        // Oldest surviving tunnel from the same source takes over the ARP rule.
        match self.list_tunnels()?.into_iter().find(|t| t.source_ip == source) {
            Some(other) => {
                debug!(tunnel = %other.name, source = %source, "source address still in use");
                commands.push(rules.arp_spoof_flow(source, other.dest_ip));
            }
            None => commands.push(rules.host_route_delete(source)),
        }

        let mut first_failure = None;
        for command in commands {
            if let Err(e) = self.run_line(command).await {
                warn!(tunnel = name, "cleanup step failed: {e}");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
        if let Some(e) = first_failure {
            return Err(e);
        }

        info!(tunnel = name, "tunnel removed");
        Ok(())
    }
}
