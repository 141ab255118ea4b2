//! In-memory [`Kernel`] with the replace/delete semantics of the real one.
//!
//! Mutations issued through the trait are recorded in a journal so tests
//! can check ordering (e.g. that routes land before their rule). Seeding
//! helpers (`add_link`, `seed_route`, ...) bypass the journal.

use std::collections::HashSet;

use async_trait::async_trait;
use fabric_common::{
    Address, Kernel, KernelError, KernelResult, Link, Route, RouteKind, Rule, DEFAULT_TABLE,
    LOCAL_TABLE, MAIN_TABLE,
};
use fabric_types::IpFamily;
use parking_lot::Mutex;

/// A mutation observed by [`FakeKernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOp {
    ReplaceRoute(Route),
    DeleteRoute(Route),
    AddRule(Rule),
    DeleteRule(Rule),
    ReplaceAddress(Address),
    DeleteAddress(Address),
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Links,
    Routes,
    Rules,
    Addresses,
    ReplaceRoute,
    DeleteRoute,
    AddRule,
    DeleteRule,
    ReplaceAddress,
    DeleteAddress,
}

#[derive(Debug, Default)]
struct FakeState {
    links: Vec<Link>,
    routes: Vec<Route>,
    rules: Vec<Rule>,
    addresses: Vec<Address>,
    failures: HashSet<FailPoint>,
    journal: Vec<KernelOp>,
}

impl FakeState {
    fn check(&self, point: FailPoint) -> KernelResult<()> {
        if self.failures.contains(&point) {
            return Err(KernelError::rejected(
                format!("{:?}", point),
                "injected failure",
            ));
        }
        Ok(())
    }

    fn require_link(&self, name: &str) -> KernelResult<()> {
        if self.links.iter().any(|l| l.name == name) {
            Ok(())
        } else {
            Err(KernelError::link_not_found(name))
        }
    }
}

fn same_route(a: &Route, b: &Route) -> bool {
    a.table == b.table && a.dst == b.dst
}

fn same_address(a: &Address, b: &Address) -> bool {
    a.link == b.link && a.address == b.address
}

/// In-memory kernel for tests.
pub struct FakeKernel {
    state: Mutex<FakeState>,
}

impl FakeKernel {
    /// Creates a kernel with no links and the stock policy rules of a
    /// freshly booted host (local, main and, for IPv4, default).
    pub fn new() -> Self {
        let rules = vec![
            Rule::new(IpFamily::Ipv4, 0, LOCAL_TABLE),
            Rule::new(IpFamily::Ipv4, 32766, MAIN_TABLE),
            Rule::new(IpFamily::Ipv4, 32767, DEFAULT_TABLE),
            Rule::new(IpFamily::Ipv6, 0, LOCAL_TABLE),
            Rule::new(IpFamily::Ipv6, 32766, MAIN_TABLE),
        ];
        Self {
            state: Mutex::new(FakeState {
                rules,
                ..FakeState::default()
            }),
        }
    }

    /// Creates a kernel with the given links already present.
    pub fn with_links<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let kernel = Self::new();
        for name in names {
            kernel.add_link(name);
        }
        kernel
    }

    /// Adds a link, returning its index.
    pub fn add_link(&self, name: &str) -> u32 {
        let mut state = self.state.lock();
        if let Some(link) = state.links.iter().find(|l| l.name == name) {
            return link.index;
        }
        let index = state.links.iter().map(|l| l.index).max().unwrap_or(0) + 1;
        state.links.push(Link::new(index, name));
        index
    }

    /// Inserts a route without journaling it.
    pub fn seed_route(&self, route: Route) {
        let mut state = self.state.lock();
        state.routes.retain(|r| !same_route(r, &route));
        state.routes.push(route);
    }

    /// Inserts a rule without journaling it.
    pub fn seed_rule(&self, rule: Rule) {
        self.state.lock().rules.push(rule);
    }

    /// Assigns an address without journaling it.
    pub fn seed_address(&self, address: Address) {
        let mut state = self.state.lock();
        state.addresses.retain(|a| !same_address(a, &address));
        state.addresses.push(address);
    }

    /// Makes every subsequent call of `point` fail.
    pub fn fail_on(&self, point: FailPoint) {
        self.state.lock().failures.insert(point);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Routes of `table`, any family.
    pub fn table_routes(&self, table: u32) -> Vec<Route> {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    pub fn all_rules(&self, family: IpFamily) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .state
            .lock()
            .rules
            .iter()
            .filter(|r| r.family == family)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.priority);
        rules
    }

    pub fn link_addresses(&self, link: &str) -> Vec<Address> {
        self.state
            .lock()
            .addresses
            .iter()
            .filter(|a| a.link == link)
            .cloned()
            .collect()
    }

    /// Mutations made through the [`Kernel`] trait, oldest first.
    pub fn journal(&self) -> Vec<KernelOp> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Kernel for FakeKernel {
    async fn link_by_name(&self, name: &str) -> KernelResult<Link> {
        let state = self.state.lock();
        state.check(FailPoint::Links)?;
        state
            .links
            .iter()
            .find(|l| l.name == name)
            .cloned()
            .ok_or_else(|| KernelError::link_not_found(name))
    }

    async fn links(&self) -> KernelResult<Vec<Link>> {
        let state = self.state.lock();
        state.check(FailPoint::Links)?;
        Ok(state.links.clone())
    }

    async fn routes(&self, family: IpFamily, table: u32) -> KernelResult<Vec<Route>> {
        let state = self.state.lock();
        state.check(FailPoint::Routes)?;
        Ok(state
            .routes
            .iter()
            .filter(|r| r.table == table && r.family() == family)
            .cloned()
            .collect())
    }

    async fn replace_route(&self, route: &Route) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::ReplaceRoute)?;
        if let Some(dev) = &route.dev {
            state.require_link(dev)?;
        }
        state.routes.retain(|r| !same_route(r, route));
        state.routes.push(route.clone());
        state.journal.push(KernelOp::ReplaceRoute(route.clone()));
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::DeleteRoute)?;
        state.routes.retain(|r| {
            !(same_route(r, route) && (route.kind == RouteKind::Unicast || r.kind == route.kind))
        });
        state.journal.push(KernelOp::DeleteRoute(route.clone()));
        Ok(())
    }

    async fn rules(&self, family: IpFamily) -> KernelResult<Vec<Rule>> {
        self.state.lock().check(FailPoint::Rules)?;
        Ok(self.all_rules(family))
    }

    async fn add_rule(&self, rule: &Rule) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::AddRule)?;
        if state.rules.contains(rule) {
            return Err(KernelError::rejected("rule add", "File exists"));
        }
        state.rules.push(rule.clone());
        state.journal.push(KernelOp::AddRule(rule.clone()));
        Ok(())
    }

    async fn delete_rule(&self, rule: &Rule) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::DeleteRule)?;
        if let Some(pos) = state.rules.iter().position(|r| r == rule) {
            state.rules.remove(pos);
        }
        state.journal.push(KernelOp::DeleteRule(rule.clone()));
        Ok(())
    }

    async fn addresses(&self, family: IpFamily, link: Option<&str>) -> KernelResult<Vec<Address>> {
        let state = self.state.lock();
        state.check(FailPoint::Addresses)?;
        if let Some(name) = link {
            state.require_link(name)?;
        }
        Ok(state
            .addresses
            .iter()
            .filter(|a| a.family() == family && link.is_none_or(|name| a.link == name))
            .cloned()
            .collect())
    }

    async fn replace_address(&self, address: &Address) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::ReplaceAddress)?;
        state.require_link(&address.link)?;
        state.addresses.retain(|a| !same_address(a, address));
        state.addresses.push(address.clone());
        state.journal.push(KernelOp::ReplaceAddress(address.clone()));
        Ok(())
    }

    async fn delete_address(&self, address: &Address) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::DeleteAddress)?;
        state.addresses.retain(|a| !same_address(a, address));
        state.journal.push(KernelOp::DeleteAddress(address.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_common::Scope;
    use fabric_types::IpPrefix;

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_replace_route_is_keyed_by_table_and_dst() {
        let kernel = FakeKernel::with_links(["eth0", "eth1"]);
        let dst = IpPrefix::default_route(IpFamily::Ipv4);

        kernel
            .replace_route(&Route::new(10000, dst).dev("eth0"))
            .await
            .unwrap();
        kernel
            .replace_route(&Route::new(10000, dst).dev("eth1"))
            .await
            .unwrap();

        let routes = kernel.table_routes(10000);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dev.as_deref(), Some("eth1"));
    }

    #[tokio::test]
    async fn test_route_to_missing_device_fails() {
        let kernel = FakeKernel::new();
        let route = Route::new(10000, prefix("10.0.0.0/24")).dev("eth9");
        let err = kernel.replace_route(&route).await.unwrap_err();
        assert!(matches!(err, KernelError::LinkNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_tolerates_absence() {
        let kernel = FakeKernel::new();
        kernel
            .delete_route(&Route::throw(10000, prefix("10.0.0.0/29")))
            .await
            .unwrap();
        kernel
            .delete_address(&Address::enhanced("eth0", prefix("10.0.0.3/24")))
            .await
            .unwrap();
        assert_eq!(kernel.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_rule_rejected() {
        let kernel = FakeKernel::new();
        let rule = Rule::new(IpFamily::Ipv4, 1, 10000).from_src(prefix("10.0.0.0/24"));
        kernel.add_rule(&rule).await.unwrap();
        assert!(kernel.add_rule(&rule).await.is_err());
        assert_eq!(kernel.all_rules(IpFamily::Ipv4).len(), 4);
    }

    #[tokio::test]
    async fn test_fail_on() {
        let kernel = FakeKernel::with_links(["eth0"]);
        kernel.fail_on(FailPoint::ReplaceAddress);
        let addr = Address::enhanced("eth0", prefix("10.0.0.3/24"));
        assert!(kernel.replace_address(&addr).await.is_err());

        kernel.clear_failures();
        kernel.replace_address(&addr).await.unwrap();
        let addrs = kernel.link_addresses("eth0");
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].scope, Scope::Link);
    }
}
