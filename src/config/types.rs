//! Configuration types

use crate::telemetry::LogConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Interfaces the router attaches to, keyed by interface name. A
    /// BTreeMap keeps the registration order stable.
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub nat: Option<NatConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceConfig {
    /// Address in CIDR notation ("192.168.1.1/24"); interfaces without an
    /// address still switch frames but terminate nothing
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticRoute {
    /// Destination network in CIDR notation
    pub destination: String,
    /// Next-hop address
    pub gateway: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Inside (local side) interface name
    pub inside: String,
    /// Outside (global side) interface name
    pub outside: String,
}

fn default_enabled() -> bool {
    true
}

/// Parse CIDR notation ("192.168.1.0/24")
pub fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, len) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    Some((addr, len))
}

/// Netmask for a prefix length
pub fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(!0u32 << (32 - prefix_len))
    }
}
