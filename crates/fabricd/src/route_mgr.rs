//! Route Manager - per-subnet policy routing
//!
//! Every local pod subnet gets a source rule (`from <cidr> fwmark 0x0/0x4080
//! lookup <table>`) and a private table holding the routes its traffic
//! should take. The table content depends on the subnet's network mode.
//! Routes are always written before the rule, so traffic never hits an
//! empty table.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use fabric_common::{Kernel, Route, Rule, Scope, MAIN_TABLE};
use fabric_types::{IpFamily, IpPrefix, NetworkMode, RangeError, SubnetInfo, SubnetInfoMap};
use tracing::{debug, info, instrument, warn};

use crate::error::{kernel_op, FabricError, Result};
use crate::types::*;

/// Exclusion blocks of all underlay subnets, keyed by block string.
pub type ExcludeBlockMap = BTreeMap<String, IpPrefix>;

/// Result of one [`RouteManager::sync_routes`] call.
#[derive(Debug, Default)]
pub struct RouteSyncOutcome {
    /// Subnets whose rule and table are in place.
    pub converged: Vec<String>,
    /// Underlay subnets this node is not attached to.
    pub skipped: Vec<String>,
    /// Subnets (or stale rule sources) that failed, with the reason.
    pub failed: Vec<(String, FabricError)>,
    /// Stale rules removed along with their tables.
    pub removed_rules: usize,
}

impl RouteSyncOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Route Manager
///
/// Owns no state between calls: every decision is made on a fresh read of
/// the kernel's rules and tables.
pub struct RouteManager {
    kernel: Arc<dyn Kernel>,
    family: IpFamily,
}

impl RouteManager {
    /// Create a new RouteManager for one address family
    pub fn new(kernel: Arc<dyn Kernel>, family: IpFamily) -> Self {
        Self { kernel, family }
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    /// Reconcile the rule and table of `subnet`.
    ///
    /// `underlay` holds every underlay subnet of this family, local or
    /// remote. Overlay subnets route directly to those, and NAT overlay
    /// subnets also throw the blocks no pod of those subnets may use.
    #[instrument(skip(self, underlay), fields(subnet = %subnet.cidr, mode = %subnet.mode))]
    pub async fn ensure_subnet_routing(
        &self,
        subnet: &SubnetInfo,
        underlay: &SubnetInfoMap,
    ) -> Result<()> {
        let blocks = if subnet.mode == NetworkMode::Vxlan && subnet.auto_nat_outgoing {
            find_exclude_block_map(underlay)?
        } else {
            ExcludeBlockMap::new()
        };
        self.reconcile_subnet(subnet, underlay, &blocks).await
    }

    /// Reconcile every local subnet of this family, then drop rules and
    /// tables of subnets that are gone.
    ///
    /// A failing subnet does not stop the others. Its rule is kept so a
    /// later pass can repair it.
    pub async fn sync_routes(
        &self,
        local: &SubnetInfoMap,
        remote: &SubnetInfoMap,
    ) -> Result<RouteSyncOutcome> {
        self.sync_routes_retaining(local, remote, &HashSet::new())
            .await
    }

    /// [`sync_routes`](Self::sync_routes), leaving the rules of `retained`
    /// sources and their tables untouched even though no local subnet
    /// asks for them.
    ///
    /// Used for subnets whose desired-state entry is currently broken.
    #[instrument(skip_all, fields(family = %self.family, retained = retained.len()))]
    pub async fn sync_routes_retaining(
        &self,
        local: &SubnetInfoMap,
        remote: &SubnetInfoMap,
        retained: &HashSet<IpPrefix>,
    ) -> Result<RouteSyncOutcome> {
        let mut outcome = RouteSyncOutcome::default();

        let local_underlay: SubnetInfoMap = local
            .iter()
            .filter(|(_, s)| s.family() == self.family && s.mode.is_underlay())
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        let remote_underlay: SubnetInfoMap = remote
            .iter()
            .filter(|(_, s)| s.family() == self.family && s.mode.is_underlay())
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        let underlay = combine_subnet_maps(&local_underlay, &remote_underlay);

        let needs_blocks = local.values().any(|s| {
            s.family() == self.family && s.mode == NetworkMode::Vxlan && s.auto_nat_outgoing
        });
        let blocks = if needs_blocks {
            find_exclude_block_map(&underlay)
        } else {
            Ok(ExcludeBlockMap::new())
        };

        let mut keys: Vec<&String> = local.keys().collect();
        keys.sort();

        let mut desired: HashSet<IpPrefix> = HashSet::new();
        for key in keys {
            let subnet = &local[key];
            if subnet.family() != self.family {
                continue;
            }
            if subnet.mode.is_underlay() && !subnet.underlay_on_host {
                debug!("Skipping underlay subnet {} not attached to this node", key);
                outcome.skipped.push(key.clone());
                continue;
            }
            desired.insert(subnet.cidr);

            let result = match (&blocks, subnet.mode, subnet.auto_nat_outgoing) {
                (Err(e), NetworkMode::Vxlan, true) => Err(FabricError::Range(e.clone())),
                (Ok(blocks), _, _) => self.reconcile_subnet(subnet, &underlay, blocks).await,
                (Err(_), _, _) => {
                    self.reconcile_subnet(subnet, &underlay, &ExcludeBlockMap::new())
                        .await
                }
            };
            match result {
                Ok(()) => outcome.converged.push(key.clone()),
                Err(e) => {
                    warn!("Failed to ensure routing for subnet {}: {}", key, e);
                    outcome.failed.push((key.clone(), e));
                }
            }
        }

        let rules = self
            .kernel
            .rules(self.family)
            .await
            .map_err(kernel_op("list rules", self.family))?;
        for rule in rules.iter().filter(|r| is_from_pod_subnet_rule(r)) {
            let Some(src) = rule.src else { continue };
            if desired.contains(&src) {
                continue;
            }
            if retained.contains(&src) {
                debug!("Keeping rule {} of subnet with invalid desired state", rule);
                continue;
            }
            match self.remove_subnet_rule(rule).await {
                Ok(()) => outcome.removed_rules += 1,
                Err(e) => {
                    warn!("Failed to remove stale rule {}: {}", rule, e);
                    outcome.failed.push((src.to_string(), e));
                }
            }
        }

        info!(
            "Route sync done: {} converged, {} skipped, {} failed, {} stale rules removed",
            outcome.converged.len(),
            outcome.skipped.len(),
            outcome.failed.len(),
            outcome.removed_rules
        );
        Ok(outcome)
    }

    async fn reconcile_subnet(
        &self,
        subnet: &SubnetInfo,
        underlay: &SubnetInfoMap,
        blocks: &ExcludeBlockMap,
    ) -> Result<()> {
        if subnet.family() != self.family {
            return Err(FabricError::FamilyMismatch {
                subnet: subnet.key(),
                expected: self.family,
            });
        }

        let existing = self
            .check_rule_exists(&subnet.cidr, RuleTableMatch::Any)
            .await?;
        let table = match &existing {
            Some(rule) => rule.table,
            None => self.find_empty_route_table().await?,
        };

        let iface = &subnet.forward_interface;
        self.kernel
            .link_by_name(iface)
            .await
            .map_err(kernel_op("resolve forward interface", iface))?;

        match subnet.mode {
            NetworkMode::Vxlan if subnet.auto_nat_outgoing => {
                self.ensure_vxlan_nat_routes(table, iface, underlay, blocks)
                    .await?
            }
            NetworkMode::Vxlan => self.ensure_vxlan_routes(table, iface).await?,
            NetworkMode::Vlan => self.ensure_vlan_routes(table, subnet).await?,
            NetworkMode::Bgp | NetworkMode::GlobalBgp => {
                self.ensure_bgp_routes(table, subnet).await?
            }
        }

        if existing.is_none() {
            self.append_subnet_rule(&subnet.cidr, table).await?;
        }
        Ok(())
    }

    /// Everything leaves through the tunnel device.
    async fn ensure_vxlan_routes(&self, table: u32, iface: &str) -> Result<()> {
        let routes = self.table_routes(table).await?;

        let default = Route::new(table, IpPrefix::default_route(self.family)).dev(iface);
        self.replace_route(&default).await?;

        for route in routes.iter().filter(|r| !r.is_default()) {
            self.delete_route(route).await?;
        }
        Ok(())
    }

    /// Underlay subnets are reached directly, blocks outside every underlay
    /// pool are thrown back to the main lookup, and nothing else is routed.
    ///
    /// An underlay subnet that is excluded as a whole is only thrown.
    /// Routes already in place are not rewritten.
    async fn ensure_vxlan_nat_routes(
        &self,
        table: u32,
        iface: &str,
        underlay: &SubnetInfoMap,
        blocks: &ExcludeBlockMap,
    ) -> Result<()> {
        let routes = self.table_routes(table).await?;
        for route in &routes {
            if route.is_throw() {
                continue;
            }
            if !route.is_default() && underlay.contains_key(&route.dst.to_string()) {
                continue;
            }
            self.delete_route(route).await?;
        }

        for subnet in underlay.values() {
            if blocks.contains_key(&subnet.cidr.network().to_string()) {
                continue;
            }
            let direct = Route::new(table, subnet.cidr).dev(iface);
            self.ensure_route(&routes, &direct).await?;
        }

        self.ensure_excluded_block_routes(table, blocks).await
    }

    async fn ensure_excluded_block_routes(
        &self,
        table: u32,
        blocks: &ExcludeBlockMap,
    ) -> Result<()> {
        let routes = self.table_routes(table).await?;
        for route in routes.iter().filter(|r| r.is_throw()) {
            if !blocks.contains_key(&route.dst.to_string()) {
                self.delete_route(route).await?;
            }
        }

        for block in blocks.values() {
            self.ensure_route(&routes, &Route::throw(table, *block))
                .await?;
        }
        Ok(())
    }

    /// The subnet's segment is on-link, everything else goes to the gateway.
    async fn ensure_vlan_routes(&self, table: u32, subnet: &SubnetInfo) -> Result<()> {
        let iface = subnet.forward_interface.as_str();
        let gateway = self.require_gateway(subnet)?;
        if !subnet.cidr.contains(&gateway) {
            return Err(FabricError::invalid_config(
                "gateway",
                format!("gateway {} is outside subnet {}", gateway, subnet.cidr),
            ));
        }

        let addresses = self
            .kernel
            .addresses(self.family, None)
            .await
            .map_err(kernel_op("list addresses", self.family))?;
        let is_local = addresses
            .iter()
            .any(|a| subnet.cidr.contains(&a.ip()) && !a.no_prefix_route);

        let mut direct = Route::new(table, subnet.cidr).dev(iface).scope(Scope::Link);

        if is_local {
            let main = self
                .kernel
                .routes(self.family, MAIN_TABLE)
                .await
                .map_err(kernel_op("list routes of table", MAIN_TABLE))?;

            if let Some(default) = main.iter().find(|r| r.is_default() && !r.is_throw()) {
                if default.dev.as_deref() == Some(iface)
                    && default.gateway.is_some_and(|gw| gw != gateway)
                {
                    return Err(FabricError::invariant(
                        subnet.cidr,
                        format!(
                            "main table default route via {:?} on {} conflicts with gateway {}",
                            default.gateway, iface, gateway
                        ),
                    ));
                }
            }

            let existing = main
                .iter()
                .find(|r| r.dev.as_deref() == Some(iface) && r.dst == subnet.cidr)
                .ok_or_else(|| {
                    FabricError::invariant(
                        subnet.cidr,
                        format!(
                            "forward interface {} has an address in the subnet but no direct route",
                            iface
                        ),
                    )
                })?;
            direct = direct.src(existing.src);
        }

        self.replace_route(&direct).await?;

        let default = Route::new(table, IpPrefix::default_route(self.family))
            .via(gateway)
            .dev(iface);
        self.replace_route(&default).await
    }

    /// Default route to the BGP peer.
    async fn ensure_bgp_routes(&self, table: u32, subnet: &SubnetInfo) -> Result<()> {
        let gateway = self.require_gateway(subnet)?;
        let default = Route::new(table, IpPrefix::default_route(self.family))
            .via(gateway)
            .dev(subnet.forward_interface.as_str());
        self.replace_route(&default).await
    }

    fn require_gateway(&self, subnet: &SubnetInfo) -> Result<IpAddr> {
        let gateway = subnet.gateway.ok_or_else(|| {
            FabricError::invalid_config(
                "gateway",
                format!("{} subnet {} has no gateway", subnet.mode, subnet.cidr),
            )
        })?;
        if IpFamily::of(&gateway) != self.family {
            return Err(FabricError::invalid_config(
                "gateway",
                format!("gateway {} is not an {} address", gateway, self.family),
            ));
        }
        Ok(gateway)
    }

    /// Find the rule whose source is `src`, if any.
    pub async fn check_rule_exists(
        &self,
        src: &IpPrefix,
        table: RuleTableMatch,
    ) -> Result<Option<Rule>> {
        let src = src.network();
        let rules = self
            .kernel
            .rules(self.family)
            .await
            .map_err(kernel_op("list rules", self.family))?;
        Ok(rules
            .into_iter()
            .find(|r| r.src == Some(src) && table.matches(r.table)))
    }

    /// Return the lowest table of the pool holding no route of this family.
    ///
    /// Emptiness is read from the kernel right before use; nothing is
    /// reserved.
    pub async fn find_empty_route_table(&self) -> Result<u32> {
        for table in MIN_ROUTE_TABLE..MAX_ROUTE_TABLE {
            if self.table_routes(table).await?.is_empty() {
                debug!("Found empty route table {}", table);
                return Ok(table);
            }
        }
        Err(FabricError::exhausted(
            "route table",
            format!(
                "no empty table in [{}, {})",
                MIN_ROUTE_TABLE, MAX_ROUTE_TABLE
            ),
        ))
    }

    /// Return the lowest free priority above the node-local table rule.
    pub async fn find_unused_rule_priority(&self) -> Result<u32> {
        let rules = self
            .kernel
            .rules(self.family)
            .await
            .map_err(kernel_op("list rules", self.family))?;

        let local_priority = rules
            .iter()
            .filter(|r| r.table == NODE_LOCAL_TABLE)
            .map(|r| r.priority)
            .max()
            .unwrap_or(0);
        let used: HashSet<u32> = rules.iter().map(|r| r.priority).collect();

        (local_priority + 1..=MAX_RULE_PRIORITY)
            .find(|p| !used.contains(p))
            .ok_or_else(|| {
                FabricError::exhausted(
                    "rule priority",
                    format!(
                        "no free priority in ({}, {}]",
                        local_priority, MAX_RULE_PRIORITY
                    ),
                )
            })
    }

    /// Delete every route of this family from `table`.
    pub async fn clear_route_table(&self, table: u32) -> Result<()> {
        let routes = self.table_routes(table).await?;
        for route in &routes {
            self.delete_route(route).await?;
        }
        debug!("Cleared {} routes from table {}", routes.len(), table);
        Ok(())
    }

    async fn append_subnet_rule(&self, src: &IpPrefix, table: u32) -> Result<()> {
        if self
            .check_rule_exists(src, RuleTableMatch::Exact(table))
            .await?
            .is_some()
        {
            return Ok(());
        }

        let priority = self.find_unused_rule_priority().await?;
        let rule = Rule::new(self.family, priority, table)
            .from_src(*src)
            .with_mark(FROM_RULE_MARK, FROM_RULE_MASK);
        self.kernel
            .add_rule(&rule)
            .await
            .map_err(kernel_op("add rule", &rule))?;
        info!("Added rule {}", rule);
        Ok(())
    }

    async fn remove_subnet_rule(&self, rule: &Rule) -> Result<()> {
        self.kernel
            .delete_rule(rule)
            .await
            .map_err(kernel_op("delete rule", rule))?;
        self.clear_route_table(rule.table).await?;
        info!("Removed stale rule {} and its table", rule);
        Ok(())
    }

    async fn table_routes(&self, table: u32) -> Result<Vec<Route>> {
        self.kernel
            .routes(self.family, table)
            .await
            .map_err(kernel_op("list routes of table", table))
    }

    async fn replace_route(&self, route: &Route) -> Result<()> {
        self.kernel
            .replace_route(route)
            .await
            .map_err(kernel_op("replace route", route))?;
        debug!("Replaced route {}", route);
        Ok(())
    }

    /// Replace `route` unless `current` already holds it unchanged.
    async fn ensure_route(&self, current: &[Route], route: &Route) -> Result<()> {
        if current.contains(route) {
            debug!("Route {} already in place", route);
            return Ok(());
        }
        self.replace_route(route).await
    }

    async fn delete_route(&self, route: &Route) -> Result<()> {
        self.kernel
            .delete_route(route)
            .await
            .map_err(kernel_op("delete route", route))?;
        debug!("Deleted route {}", route);
        Ok(())
    }
}

/// Returns true if `rule` is a from-subnet rule installed by this daemon.
pub fn is_from_pod_subnet_rule(rule: &Rule) -> bool {
    rule.src.is_some() && rule.fwmask == Some(FROM_RULE_MASK) && is_subnet_table(rule.table)
}

/// Union of the exclusion blocks of every subnet in `subnets`.
///
/// Any inconsistent subnet fails the whole map.
pub fn find_exclude_block_map(
    subnets: &SubnetInfoMap,
) -> std::result::Result<ExcludeBlockMap, RangeError> {
    let mut blocks = ExcludeBlockMap::new();
    for subnet in subnets.values() {
        for block in subnet.exclude_blocks()? {
            blocks.insert(block.to_string(), block);
        }
    }
    Ok(blocks)
}

/// Union of two subnet maps; entries of `b` win.
pub fn combine_subnet_maps(a: &SubnetInfoMap, b: &SubnetInfoMap) -> SubnetInfoMap {
    let mut combined = a.clone();
    combined.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
    combined
}
