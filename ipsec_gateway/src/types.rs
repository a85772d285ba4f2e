//! Core data types shared by the store and the lifecycle manager.

use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing addresses handed to us by the operator or
/// read back from the host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The value is not an `a.b.c.d/len` IPv4 CIDR.
    #[error("Invalid IPv4 CIDR '{0}': {1}")]
    InvalidCidr(String, String),

    /// The value is not a colon separated 48-bit MAC address.
    #[error("Invalid MAC address '{0}'")]
    InvalidMac(String),
}

/// IPv4 address with its prefix length, e.g. `10.1.0.254/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayCidr {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl GatewayCidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidCidr(
                format!("{addr}/{prefix_len}"),
                format!("prefix length {prefix_len} is larger than 32"),
            ));
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl FromStr for GatewayCidr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) = s
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidCidr(s.to_string(), "missing '/<len>'".into()))?;

        let addr = Ipv4Addr::from_str(ip)
            .map_err(|e| ParseError::InvalidCidr(s.to_string(), e.to_string()))?;
        let prefix_len = prefix
            .parse::<u8>()
            .map_err(|e| ParseError::InvalidCidr(s.to_string(), e.to_string()))?;

        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for GatewayCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Lowercase, colon separated MAC address as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacAddr(String);

impl MacAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let octets: Vec<&str> = s.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(ParseError::InvalidMac(s.to_string()));
        }
        Ok(MacAddr(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The local gateway, persisted in the descriptor file while it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDescriptor {
    pub gateway_ip: GatewayCidr,
    pub gateway_mac: MacAddr,
    pub ovs_bridge: String,
}

/// Everything needed to write one tunnel into the daemon files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEntry {
    pub name: String,
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub remote_gateway_ip: Ipv4Addr,
    pub local_id: String,
    pub remote_id: String,
    /// Pre-shared key; only ever written to the secrets file.
    pub psk: String,
}

/// A tunnel as read back from the managed region of the connection file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelRecord {
    pub name: String,
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_parses_and_displays() {
        let cidr: GatewayCidr = "10.1.0.254/24".parse().unwrap();
        assert_eq!(cidr.addr(), Ipv4Addr::new(10, 1, 0, 254));
        assert_eq!(cidr.prefix_len(), 24);
        assert_eq!(cidr.to_string(), "10.1.0.254/24");
    }

    #[test]
    fn cidr_rejects_bad_input() {
        assert!("10.1.0.254".parse::<GatewayCidr>().is_err());
        assert!("10.1.0.256/24".parse::<GatewayCidr>().is_err());
        assert!("10.1.0.254/33".parse::<GatewayCidr>().is_err());
        assert!("10.1.0.254/x".parse::<GatewayCidr>().is_err());
    }

    #[test]
    fn mac_is_normalised_to_lowercase() {
        let mac: MacAddr = "AA:bb:0C:dd:ee:01\n".parse().unwrap();
        assert_eq!(mac.as_str(), "aa:bb:0c:dd:ee:01");
    }

    #[test]
    fn mac_rejects_wrong_shapes() {
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:gg".parse::<MacAddr>().is_err());
        assert!("aabb.ccdd.eeff".parse::<MacAddr>().is_err());
    }
}
