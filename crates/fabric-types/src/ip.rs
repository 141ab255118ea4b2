//! IP family and prefix types with safe parsing and address arithmetic.

use crate::ParseError;
use ipnet::{IpAdd, IpNet, IpSub, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of a prefix, route, rule or address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[serde(alias = "v4", alias = "inet")]
    Ipv4,
    #[serde(alias = "v6", alias = "inet6")]
    Ipv6,
}

impl IpFamily {
    /// Returns the family of an address.
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::Ipv4,
            IpAddr::V6(_) => IpFamily::Ipv6,
        }
    }

    /// Returns the address width in bits (32 or 128).
    pub const fn bits(&self) -> u8 {
        match self {
            IpFamily::Ipv4 => 32,
            IpFamily::Ipv6 => 128,
        }
    }

    /// Returns the unspecified address of this family.
    pub const fn unspecified(&self) -> IpAddr {
        match self {
            IpFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::Ipv4 => f.write_str("ipv4"),
            IpFamily::Ipv6 => f.write_str("ipv6"),
        }
    }
}

/// Returns the address immediately after `addr`, or `None` at the top of
/// the family's address space.
pub fn next_ip(addr: &IpAddr) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(v4) if *v4 == Ipv4Addr::BROADCAST => None,
        IpAddr::V4(v4) => Some(IpAddr::V4(v4.saturating_add(1u32))),
        IpAddr::V6(v6) if *v6 == Ipv6Addr::from(u128::MAX) => None,
        IpAddr::V6(v6) => Some(IpAddr::V6(v6.saturating_add(1u128))),
    }
}

/// Returns the address immediately before `addr`, or `None` for the
/// unspecified address.
pub fn prev_ip(addr: &IpAddr) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(v4) if v4.is_unspecified() => None,
        IpAddr::V4(v4) => Some(IpAddr::V4(v4.saturating_sub(1u32))),
        IpAddr::V6(v6) if v6.is_unspecified() => None,
        IpAddr::V6(v6) => Some(IpAddr::V6(v6.saturating_sub(1u128))),
    }
}

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// The address is kept as given, so the same type describes both a network
/// (`10.0.0.0/24`) and an interface address (`10.0.0.15/24`). Use
/// [`IpPrefix::network`] for the canonical network form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    net: IpNet,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let net = IpNet::new(address, prefix_len).map_err(|_| {
            ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for address type",
                prefix_len,
                IpFamily::of(&address).bits()
            ))
        })?;
        Ok(IpPrefix { net })
    }

    /// Creates a full-length prefix for a single address.
    pub fn host(address: IpAddr) -> Self {
        IpPrefix {
            net: IpNet::from(address),
        }
    }

    /// Returns `0.0.0.0/0` or `::/0`.
    pub fn default_route(family: IpFamily) -> Self {
        let net = match family {
            IpFamily::Ipv4 => IpNet::V4(Ipv4Net::default()),
            IpFamily::Ipv6 => IpNet::V6(Ipv6Net::default()),
        };
        IpPrefix { net }
    }

    /// Returns the underlying network value.
    pub const fn as_net(&self) -> &IpNet {
        &self.net
    }

    /// Returns the address of this prefix as given at construction.
    pub fn address(&self) -> IpAddr {
        self.net.addr()
    }

    /// Returns the prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.net.addr())
    }

    /// Returns true if this is an IPv4 prefix.
    pub fn is_ipv4(&self) -> bool {
        matches!(self.net, IpNet::V4(_))
    }

    /// Returns true if this is an IPv6 prefix.
    pub fn is_ipv6(&self) -> bool {
        matches!(self.net, IpNet::V6(_))
    }

    /// Returns true if this is a host route (/32 for IPv4, /128 for IPv6).
    pub fn is_host_route(&self) -> bool {
        self.net.prefix_len() == self.net.max_prefix_len()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.net.prefix_len() == 0
    }

    /// Returns the prefix with all host bits cleared.
    pub fn network(&self) -> IpPrefix {
        IpPrefix {
            net: self.net.trunc(),
        }
    }

    /// Returns the first address covered by this prefix.
    pub fn first(&self) -> IpAddr {
        self.net.network()
    }

    /// Returns the last address covered by this prefix.
    pub fn last(&self) -> IpAddr {
        self.net.broadcast()
    }

    /// Returns true if `addr` lies inside this prefix. Addresses of the
    /// other family are never contained.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.net.contains(addr)
    }
}

impl From<IpNet> for IpPrefix {
    fn from(net: IpNet) -> Self {
        IpPrefix { net }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ip_prefix_parse() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 24);

        let v6_prefix: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert!(v6_prefix.is_ipv6());
        assert_eq!(v6_prefix.prefix_len(), 32);
    }

    #[test]
    fn test_ip_prefix_host_route() {
        let host_v4: IpPrefix = "10.0.0.1/32".parse().unwrap();
        assert!(host_v4.is_host_route());

        let network: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(!network.is_host_route());

        assert!(IpPrefix::host(ip("2001:db8::1")).is_host_route());
    }

    #[test]
    fn test_ip_prefix_default() {
        assert!(IpPrefix::default_route(IpFamily::Ipv4).is_default());
        assert_eq!(IpPrefix::default_route(IpFamily::Ipv6).to_string(), "::/0");
    }

    #[test]
    fn test_invalid_prefix() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
        assert!("10.0.0.300/24".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_network_first_last() {
        let addr: IpPrefix = "10.0.0.15/24".parse().unwrap();
        assert_eq!(addr.network().to_string(), "10.0.0.0/24");
        assert_eq!(addr.first(), ip("10.0.0.0"));
        assert_eq!(addr.last(), ip("10.0.0.255"));

        let all: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert_eq!(all.last(), ip("255.255.255.255"));

        let v6: IpPrefix = "fd00::1234/120".parse().unwrap();
        assert_eq!(v6.first(), ip("fd00::1200"));
        assert_eq!(v6.last(), ip("fd00::12ff"));
    }

    #[test]
    fn test_contains() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.contains(&ip("10.0.0.1")));
        assert!(prefix.contains(&ip("10.0.0.255")));
        assert!(!prefix.contains(&ip("10.0.1.0")));
        assert!(!prefix.contains(&ip("::1")));

        let default_v6 = IpPrefix::default_route(IpFamily::Ipv6);
        assert!(default_v6.contains(&ip("2001:db8::1")));
    }

    #[test]
    fn test_next_prev_ip() {
        assert_eq!(next_ip(&ip("10.0.0.255")), Some(ip("10.0.1.0")));
        assert_eq!(prev_ip(&ip("10.0.1.0")), Some(ip("10.0.0.255")));
        assert_eq!(prev_ip(&ip("0.0.0.0")), None);
        assert_eq!(next_ip(&ip("255.255.255.255")), None);
        assert_eq!(next_ip(&ip("fd00::ffff")), Some(ip("fd00::1:0")));
        assert_eq!(prev_ip(&ip("::")), None);
        assert_eq!(next_ip(&ip("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff")), None);
    }

    #[test]
    fn test_network_keeps_given_address() {
        let addr: IpPrefix = "10.0.0.15/24".parse().unwrap();
        assert_eq!(addr.address(), ip("10.0.0.15"));
        assert_eq!(addr.network().address(), ip("10.0.0.0"));
        assert_ne!(addr, addr.network());
        assert_eq!(addr.network(), addr.network().network());
    }

    #[test]
    fn test_serde_as_string() {
        let prefix: IpPrefix = "192.168.0.0/16".parse().unwrap();
        let json = serde_json::to_string(&prefix).unwrap();
        assert_eq!(json, "\"192.168.0.0/16\"");
        let back: IpPrefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prefix);
    }
}
