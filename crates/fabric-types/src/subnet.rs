//! Per-subnet desired state.

use crate::{find_exclude_blocks, IpFamily, IpPrefix, IpRange, ParseError, RangeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// How traffic of a subnet leaves the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkMode {
    /// Overlay: everything funnels through the tunnel device.
    Vxlan,
    /// Underlay on a shared L2 segment with a gateway.
    Vlan,
    /// Underlay routed by a BGP peer of this node.
    Bgp,
    /// Underlay routed by BGP, with addresses shared across nodes.
    GlobalBgp,
}

impl NetworkMode {
    /// Returns true for the modes whose addresses are routable on the
    /// physical network.
    pub const fn is_underlay(&self) -> bool {
        !matches!(self, NetworkMode::Vxlan)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Vxlan => "VXLAN",
            NetworkMode::Vlan => "VLAN",
            NetworkMode::Bgp => "BGP",
            NetworkMode::GlobalBgp => "GlobalBGP",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vxlan" | "overlay" => Ok(NetworkMode::Vxlan),
            "vlan" | "underlay" => Ok(NetworkMode::Vlan),
            "bgp" => Ok(NetworkMode::Bgp),
            "globalbgp" | "global-bgp" => Ok(NetworkMode::GlobalBgp),
            _ => Err(ParseError::InvalidNetworkMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for NetworkMode {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NetworkMode> for String {
    fn from(mode: NetworkMode) -> Self {
        mode.as_str().to_string()
    }
}

/// One managed subnet, as seen by the route and address managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetInfo {
    /// Network prefix, host bits cleared.
    pub cidr: IpPrefix,
    pub gateway: Option<IpAddr>,
    pub exclude_ips: Vec<IpAddr>,
    pub included_ranges: Vec<IpRange>,
    /// Local interface carrying the subnet's traffic.
    pub forward_interface: String,
    pub auto_nat_outgoing: bool,
    /// Whether this node is attached to the subnet's physical segment.
    pub underlay_on_host: bool,
    pub mode: NetworkMode,
}

impl SubnetInfo {
    /// Creates a subnet with no gateway, exclusions or ranges. The CIDR is
    /// normalized to its network address.
    pub fn new(cidr: IpPrefix, mode: NetworkMode, forward_interface: impl Into<String>) -> Self {
        SubnetInfo {
            cidr: cidr.network(),
            gateway: None,
            exclude_ips: Vec::new(),
            included_ranges: Vec::new(),
            forward_interface: forward_interface.into(),
            auto_nat_outgoing: false,
            underlay_on_host: false,
            mode,
        }
    }

    pub fn family(&self) -> IpFamily {
        self.cidr.family()
    }

    /// The key of this subnet in a [`SubnetInfoMap`].
    pub fn key(&self) -> String {
        self.cidr.to_string()
    }

    /// Returns the blocks inside the CIDR that no pod of this subnet owns.
    pub fn exclude_blocks(&self) -> Result<Vec<IpPrefix>, RangeError> {
        find_exclude_blocks(
            &self.cidr,
            &self.included_ranges,
            self.gateway,
            &self.exclude_ips,
        )
    }
}

/// Subnets keyed by network string (`10.0.0.0/24`). Rebuilt on every pass.
pub type SubnetInfoMap = HashMap<String, SubnetInfo>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_network_mode_parse() {
        assert_eq!("VXLAN".parse::<NetworkMode>().unwrap(), NetworkMode::Vxlan);
        assert_eq!("vlan".parse::<NetworkMode>().unwrap(), NetworkMode::Vlan);
        assert_eq!("BGP".parse::<NetworkMode>().unwrap(), NetworkMode::Bgp);
        assert_eq!("GlobalBGP".parse::<NetworkMode>().unwrap(), NetworkMode::GlobalBgp);
        assert!("ipip".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn test_network_mode_serde() {
        let json = serde_json::to_string(&NetworkMode::GlobalBgp).unwrap();
        assert_eq!(json, "\"GlobalBGP\"");
        let mode: NetworkMode = serde_json::from_str("\"vxlan\"").unwrap();
        assert_eq!(mode, NetworkMode::Vxlan);
    }

    #[test]
    fn test_underlay_modes() {
        assert!(!NetworkMode::Vxlan.is_underlay());
        assert!(NetworkMode::Vlan.is_underlay());
        assert!(NetworkMode::Bgp.is_underlay());
        assert!(NetworkMode::GlobalBgp.is_underlay());
    }

    #[test]
    fn test_subnet_key_is_network() {
        let subnet = SubnetInfo::new("10.0.0.7/24".parse().unwrap(), NetworkMode::Vlan, "eth0");
        assert_eq!(subnet.key(), "10.0.0.0/24");
        assert_eq!(subnet.family(), IpFamily::Ipv4);
    }

    #[test]
    fn test_subnet_exclude_blocks() {
        let mut subnet = SubnetInfo::new("10.0.0.0/30".parse().unwrap(), NetworkMode::Vlan, "eth0");
        subnet.included_ranges = vec![IpRange::new(
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        )
        .unwrap()
        .unwrap()];
        let blocks: Vec<String> = subnet
            .exclude_blocks()
            .unwrap()
            .iter()
            .map(|b| b.to_string())
            .collect();
        assert_eq!(blocks, vec!["10.0.0.0/31"]);
    }
}
