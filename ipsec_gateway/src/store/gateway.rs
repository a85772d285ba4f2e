//! The gateway descriptor: a single record persisted as `key : value` lines.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::template::{render_template, Template, WriteMode};
use super::{StoreError, StoreResult};
use crate::types::{GatewayCidr, GatewayDescriptor, MacAddr};

const KEY_GATEWAY_IP: &str = "gatewayIp";
const KEY_GATEWAY_MAC: &str = "gatewayMac";
const KEY_OVS_BRIDGE: &str = "ovsBridge";

/// Persistence for the single gateway descriptor.
///
/// The descriptor exists exactly while the gateway is active. Implementations
/// assume one writer per host: the tool must not run concurrently against
/// the same descriptor.
pub trait GatewayStore: Send + Sync {
    /// `Ok(None)` when no gateway has been created.
    fn load(&self) -> StoreResult<Option<GatewayDescriptor>>;

    fn save(&self, descriptor: &GatewayDescriptor) -> StoreResult<()>;

    /// Removing an absent descriptor is not an error.
    fn remove(&self) -> StoreResult<()>;
}

/// Descriptor file rendered from the gateway template.
#[derive(Debug, Clone)]
pub struct GatewayFile {
    path: PathBuf,
    template: Template,
}

impl GatewayFile {
    pub fn new(path: impl Into<PathBuf>, template: Template) -> Self {
        Self {
            path: path.into(),
            template,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn malformed(&self, detail: impl Into<String>) -> StoreError {
        StoreError::MalformedConfig {
            path: self.path.clone(),
            detail: detail.into(),
        }
    }

    fn parse(&self, content: &str) -> StoreResult<GatewayDescriptor> {
        let mut gateway_ip = None;
        let mut gateway_mac = None;
        let mut ovs_bridge = None;

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                KEY_GATEWAY_IP => gateway_ip = Some(value),
                KEY_GATEWAY_MAC => gateway_mac = Some(value),
                KEY_OVS_BRIDGE => ovs_bridge = Some(value),
                _ => {}
            }
        }

        let gateway_ip = gateway_ip
            .ok_or_else(|| self.malformed(format!("missing {KEY_GATEWAY_IP}")))?
            .parse::<GatewayCidr>()
            .map_err(|e| self.malformed(e.to_string()))?;
        let gateway_mac = gateway_mac
            .ok_or_else(|| self.malformed(format!("missing {KEY_GATEWAY_MAC}")))?
            .parse::<MacAddr>()
            .map_err(|e| self.malformed(e.to_string()))?;
        let ovs_bridge = ovs_bridge
            .filter(|b| !b.is_empty())
            .ok_or_else(|| self.malformed(format!("missing {KEY_OVS_BRIDGE}")))?
            .to_string();

        Ok(GatewayDescriptor {
            gateway_ip,
            gateway_mac,
            ovs_bridge,
        })
    }
}

impl GatewayStore for GatewayFile {
    fn load(&self) -> StoreResult<Option<GatewayDescriptor>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(file = %self.path.display(), "no gateway descriptor");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        self.parse(&content).map(Some)
    }

    fn save(&self, descriptor: &GatewayDescriptor) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let gateway_ip = descriptor.gateway_ip.to_string();
        render_template(
            &self.template,
            &self.path,
            &[
                ("GATEWAY_IP", gateway_ip.as_str()),
                ("GATEWAY_MAC", descriptor.gateway_mac.as_str()),
                ("OVS_BRIDGE", descriptor.ovs_bridge.as_str()),
            ],
            WriteMode::Truncate,
        )?;
        info!(file = %self.path.display(), "saved gateway descriptor");
        Ok(())
    }

    fn remove(&self) -> StoreResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(file = %self.path.display(), "removed gateway descriptor");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
