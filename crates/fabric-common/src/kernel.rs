//! Kernel network objects and the [`Kernel`] trait.
//!
//! The managers never hold kernel state across calls. Every decision is
//! made on a fresh read through this trait, and every write is either an
//! idempotent replace or a delete that tolerates absence.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use fabric_types::{IpFamily, IpPrefix};

use crate::error::KernelResult;

/// Table holding local and broadcast routes.
pub const LOCAL_TABLE: u32 = 255;

/// The main routing table.
pub const MAIN_TABLE: u32 = 254;

/// The "default" routing table consulted last.
pub const DEFAULT_TABLE: u32 = 253;

/// Route and address scope (`rtm_scope` / `ifa_scope`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    #[default]
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
}

impl Scope {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Scope::Universe => "global",
            Scope::Site => "site",
            Scope::Link => "link",
            Scope::Host => "host",
            Scope::Nowhere => "nowhere",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" | "universe" | "0" => Ok(Scope::Universe),
            "site" | "200" => Ok(Scope::Site),
            "link" | "253" => Ok(Scope::Link),
            "host" | "254" => Ok(Scope::Host),
            "nowhere" | "255" => Ok(Scope::Nowhere),
            other => Err(format!("unknown scope '{}'", other)),
        }
    }
}

/// Route type (`rtm_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RouteKind {
    #[default]
    Unicast,
    Local,
    Broadcast,
    Anycast,
    Multicast,
    Blackhole,
    Unreachable,
    Prohibit,
    /// Lookup continues with the next policy rule.
    Throw,
    Other,
}

impl RouteKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Unicast => "unicast",
            RouteKind::Local => "local",
            RouteKind::Broadcast => "broadcast",
            RouteKind::Anycast => "anycast",
            RouteKind::Multicast => "multicast",
            RouteKind::Blackhole => "blackhole",
            RouteKind::Unreachable => "unreachable",
            RouteKind::Prohibit => "prohibit",
            RouteKind::Throw => "throw",
            RouteKind::Other => "other",
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RouteKind {
    fn from(s: &str) -> Self {
        match s {
            "unicast" => RouteKind::Unicast,
            "local" => RouteKind::Local,
            "broadcast" => RouteKind::Broadcast,
            "anycast" => RouteKind::Anycast,
            "multicast" => RouteKind::Multicast,
            "blackhole" => RouteKind::Blackhole,
            "unreachable" => RouteKind::Unreachable,
            "prohibit" => RouteKind::Prohibit,
            "throw" => RouteKind::Throw,
            _ => RouteKind::Other,
        }
    }
}

/// A network interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub index: u32,
    pub name: String,
}

impl Link {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

/// A route in one table. A route is identified by `(table, dst, kind)`;
/// replacing it overwrites the next hop, device, source and scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub table: u32,
    /// Destination, `/0` for a default route.
    pub dst: IpPrefix,
    pub gateway: Option<IpAddr>,
    /// Output interface name.
    pub dev: Option<String>,
    /// Preferred source address.
    pub src: Option<IpAddr>,
    pub scope: Scope,
    pub kind: RouteKind,
}

impl Route {
    /// Creates a unicast, universe-scope route with no next hop.
    pub fn new(table: u32, dst: IpPrefix) -> Self {
        Self {
            table,
            dst: dst.network(),
            gateway: None,
            dev: None,
            src: None,
            scope: Scope::Universe,
            kind: RouteKind::Unicast,
        }
    }

    /// Creates a throw route for `dst`.
    pub fn throw(table: u32, dst: IpPrefix) -> Self {
        Self {
            kind: RouteKind::Throw,
            ..Self::new(table, dst)
        }
    }

    pub fn via(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn dev(mut self, dev: impl Into<String>) -> Self {
        self.dev = Some(dev.into());
        self
    }

    pub fn src(mut self, src: Option<IpAddr>) -> Self {
        self.src = src;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn family(&self) -> IpFamily {
        self.dst.family()
    }

    pub fn is_default(&self) -> bool {
        self.dst.is_default()
    }

    pub fn is_throw(&self) -> bool {
        self.kind == RouteKind::Throw
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind != RouteKind::Unicast {
            write!(f, "{} ", self.kind)?;
        }
        write!(f, "{}", self.dst)?;
        if let Some(gw) = &self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(dev) = &self.dev {
            write!(f, " dev {}", dev)?;
        }
        write!(f, " table {}", self.table)
    }
}

/// A policy routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub family: IpFamily,
    pub priority: u32,
    /// Source selector, `None` for "from all".
    pub src: Option<IpPrefix>,
    pub table: u32,
    pub fwmark: Option<u32>,
    pub fwmask: Option<u32>,
}

impl Rule {
    pub fn new(family: IpFamily, priority: u32, table: u32) -> Self {
        Self {
            family,
            priority,
            src: None,
            table,
            fwmark: None,
            fwmask: None,
        }
    }

    pub fn from_src(mut self, src: IpPrefix) -> Self {
        self.src = Some(src.network());
        self
    }

    pub fn with_mark(mut self, mark: u32, mask: u32) -> Self {
        self.fwmark = Some(mark);
        self.fwmask = Some(mask);
        self
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: from ", self.priority)?;
        match &self.src {
            Some(src) => write!(f, "{}", src)?,
            None => f.write_str("all")?,
        }
        if let Some(mark) = self.fwmark {
            write!(f, " fwmark {:#x}", mark)?;
            if let Some(mask) = self.fwmask {
                write!(f, "/{:#x}", mask)?;
            }
        }
        write!(f, " lookup {}", self.table)
    }
}

/// An address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Interface name.
    pub link: String,
    /// Host address plus subnet length, e.g. `10.0.0.15/24`.
    pub address: IpPrefix,
    pub scope: Scope,
    /// Set when the kernel did not (and must not) add a prefix route.
    pub no_prefix_route: bool,
}

impl Address {
    pub fn new(link: impl Into<String>, address: IpPrefix) -> Self {
        Self {
            link: link.into(),
            address,
            scope: Scope::Universe,
            no_prefix_route: false,
        }
    }

    /// Creates an enhanced address: link scope, no prefix route.
    pub fn enhanced(link: impl Into<String>, address: IpPrefix) -> Self {
        Self {
            scope: Scope::Link,
            no_prefix_route: true,
            ..Self::new(link, address)
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.address.address()
    }

    /// Subnet this address lives in.
    pub fn subnet(&self) -> IpPrefix {
        self.address.network()
    }

    pub fn family(&self) -> IpFamily {
        self.address.family()
    }

    /// True for addresses added only to steer ARP sender selection.
    pub fn is_enhanced(&self) -> bool {
        self.no_prefix_route && self.scope == Scope::Link
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dev {} scope {}", self.address, self.link, self.scope)?;
        if self.no_prefix_route {
            f.write_str(" noprefixroute")?;
        }
        Ok(())
    }
}

/// Access to the kernel's links, routes, rules and addresses.
///
/// Implementations must make `replace_*` idempotent and `delete_*`
/// succeed when the object is already gone.
#[async_trait]
pub trait Kernel: Send + Sync {
    /// Looks up a link by name, failing with
    /// [`KernelError::LinkNotFound`](crate::KernelError::LinkNotFound).
    async fn link_by_name(&self, name: &str) -> KernelResult<Link>;

    async fn links(&self) -> KernelResult<Vec<Link>>;

    /// Lists the routes of one family in one table.
    ///
    /// A table that has never held a route lists as empty rather than
    /// failing.
    async fn routes(&self, family: IpFamily, table: u32) -> KernelResult<Vec<Route>>;

    async fn replace_route(&self, route: &Route) -> KernelResult<()>;

    async fn delete_route(&self, route: &Route) -> KernelResult<()>;

    async fn rules(&self, family: IpFamily) -> KernelResult<Vec<Rule>>;

    async fn add_rule(&self, rule: &Rule) -> KernelResult<()>;

    async fn delete_rule(&self, rule: &Rule) -> KernelResult<()>;

    /// Lists addresses of one family, on one link or on all links.
    async fn addresses(&self, family: IpFamily, link: Option<&str>) -> KernelResult<Vec<Address>>;

    async fn replace_address(&self, address: &Address) -> KernelResult<()>;

    async fn delete_address(&self, address: &Address) -> KernelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("link".parse::<Scope>().unwrap(), Scope::Link);
        assert_eq!("global".parse::<Scope>().unwrap(), Scope::Universe);
        assert_eq!("253".parse::<Scope>().unwrap(), Scope::Link);
        assert!("bogus".parse::<Scope>().is_err());
    }

    #[test]
    fn test_route_builders() {
        let route = Route::new(10000, prefix("10.0.0.5/24"))
            .dev("eth0")
            .scope(Scope::Link);
        assert_eq!(route.dst, prefix("10.0.0.0/24"));
        assert_eq!(route.to_string(), "10.0.0.0/24 dev eth0 table 10000");

        let throw = Route::throw(10000, prefix("10.0.0.0/29"));
        assert!(throw.is_throw());
        assert_eq!(throw.to_string(), "throw 10.0.0.0/29 table 10000");
    }

    #[test]
    fn test_rule_display() {
        let rule = Rule::new(IpFamily::Ipv4, 1, 10000)
            .from_src(prefix("10.0.0.0/24"))
            .with_mark(0, 0x4080);
        assert_eq!(
            rule.to_string(),
            "1: from 10.0.0.0/24 fwmark 0x0/0x4080 lookup 10000"
        );
    }

    #[test]
    fn test_enhanced_address() {
        let addr = Address::enhanced("eth0", prefix("10.0.0.15/24"));
        assert!(addr.is_enhanced());
        assert_eq!(addr.subnet(), prefix("10.0.0.0/24"));
        assert_eq!(addr.ip(), "10.0.0.15".parse::<IpAddr>().unwrap());

        let manual = Address::new("eth0", prefix("10.0.0.2/24"));
        assert!(!manual.is_enhanced());
    }
}
