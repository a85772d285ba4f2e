//! Command lines for the state derived from a tunnel's endpoints.
//!
//! None of this state is stored; it is recomputed from the tunnel's source
//! and destination every time a tunnel is added or removed.

use std::net::Ipv4Addr;

use crate::types::MacAddr;

/// Hex form of an IPv4 address as OpenFlow `load:` actions expect it.
pub fn ip_to_hex(ip: Ipv4Addr) -> String {
    ip.octets().iter().map(|o| format!("{o:02x}")).collect()
}

/// Flow and route commands for one gateway.
#[derive(Debug, Clone, Copy)]
pub struct GatewayRules<'a> {
    pub bridge: &'a str,
    pub ovs_port: &'a str,
    pub interface: &'a str,
}

impl GatewayRules<'_> {
    /// Send `source -> dest` traffic into the gateway port, rewriting the
    /// destination MAC to the gateway's own.
    pub fn forwarding_flow(&self, source: Ipv4Addr, dest: Ipv4Addr, gateway_mac: &MacAddr) -> String {
        format!(
            "ovs-ofctl add-flow {} table=0,ip,nw_src={source},nw_dst={dest},action=mod_dl_dst:{gateway_mac},output:{}",
            self.bridge, self.ovs_port
        )
    }

    pub fn forwarding_flow_delete(&self, source: Ipv4Addr, dest: Ipv4Addr) -> String {
        format!(
            "ovs-ofctl del-flows {} table=0,ip,nw_src={source},nw_dst={dest}",
            self.bridge
        )
    }

    /// ARP requests from the gateway port for `source` get their sender
    /// address rewritten to `dest`, so the kernel side sees the peer.
    pub fn arp_spoof_flow(&self, source: Ipv4Addr, dest: Ipv4Addr) -> String {
        format!(
            "ovs-ofctl add-flow {} \"table=0, arp, nw_dst={source}, in_port={}, actions=load:0x{}->NXM_OF_ARP_SPA[], normal\"",
            self.bridge,
            self.ovs_port,
            ip_to_hex(dest)
        )
    }

    pub fn arp_flow_delete(&self, source: Ipv4Addr) -> String {
        format!(
            "ovs-ofctl del-flows {} table=0,arp,nw_dst={source},in_port={}",
            self.bridge, self.ovs_port
        )
    }

    pub fn host_route_add(&self, source: Ipv4Addr) -> String {
        format!("ip route add {source}/32 via 0.0.0.0 dev {}", self.interface)
    }

    pub fn host_route_delete(&self, source: Ipv4Addr) -> String {
        format!("ip route del {source}/32")
    }
}

/// Control commands of the IPsec daemon.
#[derive(Debug, Clone)]
pub struct Daemon {
    command: String,
}

impl Daemon {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn start(&self) -> String {
        format!("{} start", self.command)
    }

    pub fn stop(&self) -> String {
        format!("{} stop", self.command)
    }

    /// Re-read the connection file.
    pub fn update(&self) -> String {
        format!("{} update", self.command)
    }

    /// Re-read the secrets file.
    pub fn secrets(&self) -> String {
        format!("{} secrets", self.command)
    }

    pub fn up(&self, name: &str) -> String {
        format!("{} up {name}", self.command)
    }

    pub fn down(&self, name: &str) -> String {
        format!("{} down {name}", self.command)
    }
}
