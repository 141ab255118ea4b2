//! Test fixtures for common subnet layouts

use std::net::IpAddr;

use fabric_types::{IpPrefix, IpRange, NetworkMode, SubnetInfo, SubnetInfoMap};

/// Parses a prefix, panicking on bad input.
pub fn prefix(s: &str) -> IpPrefix {
    s.parse()
        .unwrap_or_else(|e| panic!("bad prefix fixture {}: {}", s, e))
}

/// Parses an address, panicking on bad input.
pub fn ip(s: &str) -> IpAddr {
    s.parse()
        .unwrap_or_else(|e| panic!("bad address fixture {}: {}", s, e))
}

/// Builds a closed range, panicking if it is empty or mixed-family.
pub fn range(start: &str, end: &str) -> IpRange {
    match IpRange::new(ip(start), ip(end)) {
        Ok(Some(r)) => r,
        other => panic!("bad range fixture {}~{}: {:?}", start, end, other),
    }
}

/// Overlay subnet tunnelled through `iface`.
pub fn vxlan_subnet(cidr: &str, iface: &str, auto_nat_outgoing: bool) -> SubnetInfo {
    let mut subnet = SubnetInfo::new(prefix(cidr), NetworkMode::Vxlan, iface);
    subnet.auto_nat_outgoing = auto_nat_outgoing;
    subnet
}

/// Underlay VLAN subnet attached to this host.
pub fn vlan_subnet(cidr: &str, gateway: &str, iface: &str) -> SubnetInfo {
    let mut subnet = SubnetInfo::new(prefix(cidr), NetworkMode::Vlan, iface);
    subnet.gateway = Some(ip(gateway));
    subnet.underlay_on_host = true;
    subnet
}

/// Underlay BGP subnet attached to this host.
pub fn bgp_subnet(cidr: &str, gateway: &str, iface: &str) -> SubnetInfo {
    let mut subnet = SubnetInfo::new(prefix(cidr), NetworkMode::Bgp, iface);
    subnet.gateway = Some(ip(gateway));
    subnet.underlay_on_host = true;
    subnet
}

/// Keys subnets by their network string.
pub fn subnet_map(subnets: impl IntoIterator<Item = SubnetInfo>) -> SubnetInfoMap {
    subnets.into_iter().map(|s| (s.key(), s)).collect()
}
