//! Configuration for ipsecctl.
//!
//! Settings come from a TOML file, then `IPSECCTL_*` environment variables
//! override individual values. Every field has a default matching a stock
//! strongSwan installation, so an empty or missing file is a usable config.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
const MAX_IFACE_NAME: usize = 15;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Locations of the files the tool reads and edits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Gateway descriptor (default: /etc/ipsecManager/gateway.conf)
    #[serde(default = "default_gateway_descriptor")]
    pub gateway_descriptor: PathBuf,

    /// Daemon connection file (default: /etc/strongswan/ipsec.conf)
    #[serde(default = "default_ipsec_conf")]
    pub ipsec_conf: PathBuf,

    /// Daemon secrets file (default: /etc/strongswan/ipsec.secrets)
    #[serde(default = "default_ipsec_secrets")]
    pub ipsec_secrets: PathBuf,

    /// Sysctl file toggling IPv4 forwarding
    #[serde(default = "default_ip_forward_sysctl")]
    pub ip_forward_sysctl: PathBuf,

    /// Directory overriding the built-in templates
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
}

fn default_gateway_descriptor() -> PathBuf {
    PathBuf::from("/etc/ipsecManager/gateway.conf")
}

fn default_ipsec_conf() -> PathBuf {
    PathBuf::from("/etc/strongswan/ipsec.conf")
}

fn default_ipsec_secrets() -> PathBuf {
    PathBuf::from("/etc/strongswan/ipsec.secrets")
}

fn default_ip_forward_sysctl() -> PathBuf {
    PathBuf::from("/proc/sys/net/ipv4/ip_forward")
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            gateway_descriptor: default_gateway_descriptor(),
            ipsec_conf: default_ipsec_conf(),
            ipsec_secrets: default_ipsec_secrets(),
            ip_forward_sysctl: default_ip_forward_sysctl(),
            template_dir: None,
        }
    }
}

/// Names of the veth pair joining the switch and the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// End attached to the OVS bridge (default: veth_ovs)
    #[serde(default = "default_ovs_port")]
    pub ovs_port: String,

    /// End carrying the gateway address (default: veth_ipsec)
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_ovs_port() -> String {
    "veth_ovs".to_string()
}

fn default_interface() -> String {
    "veth_ipsec".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            ovs_port: default_ovs_port(),
            interface: default_interface(),
        }
    }
}

/// IPsec daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Control command of the daemon (default: strongswan)
    #[serde(default = "default_daemon_command")]
    pub command: String,

    /// How long `up <name>` may take before the peer counts as unreachable
    #[serde(default = "default_up_timeout_ms")]
    pub up_timeout_ms: u64,

    /// Pre-shared key used when none is given on the command line
    #[serde(default)]
    pub default_psk: Option<String>,
}

fn default_daemon_command() -> String {
    "strongswan".to_string()
}

fn default_up_timeout_ms() -> u64 {
    5000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            command: default_daemon_command(),
            up_timeout_ms: default_up_timeout_ms(),
            default_psk: None,
        }
    }
}

impl DaemonConfig {
    pub fn up_timeout(&self) -> Duration {
        Duration::from_millis(self.up_timeout_ms)
    }
}

/// Rollback behaviour of the gateway creation sequence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RollbackConfig {
    /// Pause after compensation before reporting the failure
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    1000
}

impl Default for RollbackConfig {
    fn default() -> Self {
        RollbackConfig {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl RollbackConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub rollback: RollbackConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            paths: PathsConfig::default(),
            gateway: GatewayConfig::default(),
            daemon: DaemonConfig::default(),
            rollback: RollbackConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path.as_ref()) {
            Err(ConfigError::FileNotFound(p)) => {
                warn!(path = %p.display(), "config file not found, using defaults");
                let mut config = Config::default();
                Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, message: &str) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            }
        }

        for (key, name) in [
            ("gateway.ovs_port", &self.gateway.ovs_port),
            ("gateway.interface", &self.gateway.interface),
        ] {
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(invalid(key, "must be a single non-empty word"));
            }
            if name.len() > MAX_IFACE_NAME {
                return Err(invalid(key, "interface names are limited to 15 bytes"));
            }
        }
        if self.gateway.ovs_port == self.gateway.interface {
            return Err(invalid("gateway.interface", "must differ from gateway.ovs_port"));
        }

        if self.daemon.command.trim().is_empty() {
            return Err(invalid("daemon.command", "cannot be empty"));
        }
        if self.daemon.up_timeout_ms == 0 {
            return Err(invalid("daemon.up_timeout_ms", "must be greater than 0"));
        }
        if matches!(&self.daemon.default_psk, Some(psk) if psk.is_empty()) {
            return Err(invalid("daemon.default_psk", "cannot be empty when set"));
        }

        for (key, path) in [
            ("paths.gateway_descriptor", &self.paths.gateway_descriptor),
            ("paths.ipsec_conf", &self.paths.ipsec_conf),
            ("paths.ipsec_secrets", &self.paths.ipsec_secrets),
            ("paths.ip_forward_sysctl", &self.paths.ip_forward_sysctl),
        ] {
            if path.as_os_str().is_empty() {
                return Err(invalid(key, "path cannot be empty"));
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: IPSECCTL_)
    /// Example keys:
    /// - IPSECCTL_LOG_LEVEL
    /// - IPSECCTL_PATHS_GATEWAY_DESCRIPTOR, IPSECCTL_PATHS_IPSEC_CONF, IPSECCTL_PATHS_IPSEC_SECRETS,
    ///   IPSECCTL_PATHS_IP_FORWARD_SYSCTL, IPSECCTL_PATHS_TEMPLATE_DIR
    /// - IPSECCTL_GATEWAY_OVS_PORT, IPSECCTL_GATEWAY_INTERFACE
    /// - IPSECCTL_DAEMON_COMMAND, IPSECCTL_DAEMON_UP_TIMEOUT_MS, IPSECCTL_DAEMON_DEFAULT_PSK
    /// - IPSECCTL_ROLLBACK_GRACE_PERIOD_MS
    pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(&format!("IPSECCTL_{key}")).filter(|v| !v.is_empty());
        let var_u64 = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = var("LOG_LEVEL") {
            cfg.log_level = v;
        }

        if let Some(v) = var("PATHS_GATEWAY_DESCRIPTOR") {
            cfg.paths.gateway_descriptor = v.into();
        }
        if let Some(v) = var("PATHS_IPSEC_CONF") {
            cfg.paths.ipsec_conf = v.into();
        }
        if let Some(v) = var("PATHS_IPSEC_SECRETS") {
            cfg.paths.ipsec_secrets = v.into();
        }
        if let Some(v) = var("PATHS_IP_FORWARD_SYSCTL") {
            cfg.paths.ip_forward_sysctl = v.into();
        }
        if let Some(v) = var("PATHS_TEMPLATE_DIR") {
            cfg.paths.template_dir = Some(v.into());
        }

        if let Some(v) = var("GATEWAY_OVS_PORT") {
            cfg.gateway.ovs_port = v;
        }
        if let Some(v) = var("GATEWAY_INTERFACE") {
            cfg.gateway.interface = v;
        }

        if let Some(v) = var("DAEMON_COMMAND") {
            cfg.daemon.command = v;
        }
        if let Some(n) = var_u64("DAEMON_UP_TIMEOUT_MS") {
            cfg.daemon.up_timeout_ms = n;
        }
        if let Some(v) = var("DAEMON_DEFAULT_PSK") {
            cfg.daemon.default_psk = Some(v);
        }

        if let Some(n) = var_u64("ROLLBACK_GRACE_PERIOD_MS") {
            cfg.rollback.grace_period_ms = n;
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ipsecctl").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}
