#![allow(dead_code)]

use async_trait::async_trait;
use ipsec_gateway::command::{CommandError, CommandExecutor, CommandOutput, CommandResult};
use ipsec_gateway::{Config, GatewayCidr, TunnelEntry, TunnelLifecycleManager};
use std::fs;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

pub const BRIDGE: &str = "br-int";
pub const GATEWAY_MAC: &str = "02:00:00:aa:bb:cc";
pub const CONF_PREAMBLE: &str = "config setup\n\tcharondebug=\"ike 1\"\n";
pub const SECRETS_PREAMBLE: &str = ": RSA host.pem\n";

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    /// `connection '<name>' established successfully`, name taken from the command.
    Established,
    TimeOut,
}

/// Executor that records every command line and answers from a script.
///
/// Rules match by command prefix; the most recently added matching rule
/// wins. Unmatched commands succeed with empty output.
pub struct ScriptedExecutor {
    rules: Mutex<Vec<(String, Reply)>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    /// A host with no gateway interface, a readable MAC and a peer that
    /// accepts every tunnel.
    pub fn new() -> Self {
        let exec = Self {
            rules: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        };
        exec.reply(
            "ip link show",
            1,
            "",
            "Device \"veth_ipsec\" does not exist.",
        );
        exec.reply("cat /sys/class/net/", 0, GATEWAY_MAC, "");
        exec.push("strongswan up ", Reply::Established);
        exec
    }

    fn push(&self, prefix: &str, reply: Reply) {
        self.rules.lock().unwrap().push((prefix.to_string(), reply));
    }

    pub fn reply(&self, prefix: &str, status: i32, stdout: &str, stderr: &str) {
        self.push(prefix, Reply::Output(CommandOutput::new(status, stdout, stderr)));
    }

    pub fn fail(&self, prefix: &str, stderr: &str) {
        self.reply(prefix, 1, "", stderr);
    }

    pub fn time_out(&self, prefix: &str) {
        self.push(prefix, Reply::TimeOut);
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> CommandResult<CommandOutput> {
        self.log.lock().unwrap().push(command.to_string());

        let reply = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Established) => {
                let name = command.rsplit(' ').next().unwrap_or_default();
                Ok(CommandOutput::new(
                    0,
                    format!("initiating IKE_SA {name}[1]\nconnection '{name}' established successfully"),
                    "",
                ))
            }
            Some(Reply::TimeOut) => Err(CommandError::Timeout {
                command: command.to_string(),
                timeout: timeout.unwrap_or_default(),
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

/// A manager over files in a temporary directory, driven by a
/// [`ScriptedExecutor`].
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub exec: Arc<ScriptedExecutor>,
    pub manager: TunnelLifecycleManager,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.gateway_descriptor = dir.path().join("ipsecManager").join("gateway.conf");
        config.paths.ipsec_conf = dir.path().join("ipsec.conf");
        config.paths.ipsec_secrets = dir.path().join("ipsec.secrets");
        config.paths.ip_forward_sysctl = dir.path().join("ip_forward");
        config.rollback.grace_period_ms = 0;

        fs::write(&config.paths.ipsec_conf, CONF_PREAMBLE).unwrap();
        fs::write(&config.paths.ipsec_secrets, SECRETS_PREAMBLE).unwrap();

        let exec = Arc::new(ScriptedExecutor::new());
        let manager = TunnelLifecycleManager::from_config(&config, exec.clone()).unwrap();
        Self {
            dir,
            config,
            exec,
            manager,
        }
    }

    /// A harness whose gateway already exists; the command log is empty.
    pub async fn with_gateway() -> Self {
        let harness = Self::new();
        harness
            .manager
            .create_gateway(BRIDGE, gateway_cidr())
            .await
            .unwrap();
        harness.exec.clear();
        harness
    }

    pub fn conf(&self) -> String {
        fs::read_to_string(&self.config.paths.ipsec_conf).unwrap()
    }

    pub fn secrets(&self) -> String {
        fs::read_to_string(&self.config.paths.ipsec_secrets).unwrap()
    }

    pub fn has_descriptor(&self) -> bool {
        self.config.paths.gateway_descriptor.exists()
    }

    pub fn forward_sysctl(&self) -> String {
        self.config.paths.ip_forward_sysctl.display().to_string()
    }
}

pub fn gateway_cidr() -> GatewayCidr {
    "10.1.0.254/24".parse().unwrap()
}

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn entry(name: &str, source: &str, dest: &str) -> TunnelEntry {
    TunnelEntry {
        name: name.to_string(),
        source_ip: ip(source),
        dest_ip: ip(dest),
        remote_gateway_ip: ip("192.0.2.1"),
        local_id: "gw-left@example.net".to_string(),
        remote_id: "gw-right@example.net".to_string(),
        psk: "correct horse".to_string(),
    }
}
