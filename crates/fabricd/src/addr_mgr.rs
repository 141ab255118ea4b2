//! Address Manager - enhanced addresses on forwarding interfaces
//!
//! Some switches drop ARP requests whose sender address lies outside the
//! target's subnet. For every VLAN subnet with a local pod, the forwarding
//! interface keeps one "enhanced" address from that subnet: link scope and
//! no prefix route, so it is never picked as a source address and never
//! adds a route of its own.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use fabric_common::{Address, Kernel, KernelError};
use fabric_types::{IpFamily, IpPrefix};
use tracing::{debug, info, instrument};

use crate::error::{kernel_op, Result};
use crate::types::DEFAULT_POD_LINK_SUFFIX;

/// Resolves which node currently owns a pod address.
#[async_trait]
pub trait AddressOwnerLookup: Send + Sync {
    /// Returns the owning node's name, or `None` if the address is not
    /// allocated to any pod.
    async fn owner_of(&self, addr: IpAddr) -> Result<Option<String>>;
}

/// Owner lookup backed by a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticOwnerTable {
    owners: HashMap<IpAddr, String>,
}

impl StaticOwnerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: IpAddr, node: impl Into<String>) {
        self.owners.insert(addr, node.into());
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl FromIterator<(IpAddr, String)> for StaticOwnerTable {
    fn from_iter<I: IntoIterator<Item = (IpAddr, String)>>(iter: I) -> Self {
        Self {
            owners: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AddressOwnerLookup for StaticOwnerTable {
    async fn owner_of(&self, addr: IpAddr) -> Result<Option<String>> {
        Ok(self.owners.get(&addr).cloned())
    }
}

/// Changes made by one [`AddressManager::sync_addresses`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressSyncSummary {
    pub added: usize,
    pub removed: usize,
}

/// Enhanced addresses found on one link, keyed by subnet.
type EnhancedBySubnet = HashMap<IpPrefix, Address>;

/// Address Manager
///
/// Pod candidates are collected with [`try_add_pod_info`] during a pass and
/// applied with [`sync_addresses`]. Call [`reset`] before the next pass.
///
/// [`try_add_pod_info`]: AddressManager::try_add_pod_info
/// [`sync_addresses`]: AddressManager::sync_addresses
/// [`reset`]: AddressManager::reset
pub struct AddressManager {
    kernel: Arc<dyn Kernel>,
    family: IpFamily,
    node_name: String,
    /// Name suffixes of pod-side links, which are never touched
    pod_link_suffixes: Vec<String>,
    /// Interface -> subnet -> the one pod address chosen for it
    interface_to_subnet: BTreeMap<String, HashMap<IpPrefix, IpAddr>>,
}

impl AddressManager {
    /// Create a new AddressManager for one address family
    pub fn new(kernel: Arc<dyn Kernel>, family: IpFamily, node_name: impl Into<String>) -> Self {
        Self {
            kernel,
            family,
            node_name: node_name.into(),
            pod_link_suffixes: vec![DEFAULT_POD_LINK_SUFFIX.to_string()],
            interface_to_subnet: BTreeMap::new(),
        }
    }

    /// Replace the suffixes identifying pod-side links.
    pub fn with_pod_link_suffixes(mut self, suffixes: Vec<String>) -> Self {
        self.pod_link_suffixes = suffixes;
        self
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    /// Forget every candidate collected so far.
    pub fn reset(&mut self) {
        self.interface_to_subnet.clear();
    }

    /// Record `pod_ip` as the candidate for `subnet` on `iface`, unless a
    /// candidate is already recorded. Returns true if it was recorded.
    pub fn try_add_pod_info(&mut self, iface: &str, subnet: &IpPrefix, pod_ip: IpAddr) -> bool {
        if subnet.family() != self.family || IpFamily::of(&pod_ip) != self.family {
            return false;
        }
        let subnets = self
            .interface_to_subnet
            .entry(iface.to_string())
            .or_default();
        if subnets.contains_key(&subnet.network()) {
            return false;
        }
        subnets.insert(subnet.network(), pod_ip);
        true
    }

    /// Candidate recorded for `subnet` on `iface`.
    pub fn candidate(&self, iface: &str, subnet: &IpPrefix) -> Option<IpAddr> {
        self.interface_to_subnet
            .get(iface)
            .and_then(|m| m.get(&subnet.network()))
            .copied()
    }

    fn is_pod_link(&self, name: &str) -> bool {
        self.pod_link_suffixes
            .iter()
            .any(|suffix| !suffix.is_empty() && name.ends_with(suffix.as_str()))
    }

    /// Bring the enhanced addresses on every link in line with the
    /// recorded candidates.
    ///
    /// Stops at the first failure; the next pass starts over from a fresh
    /// read of the kernel.
    #[instrument(skip_all, fields(family = %self.family))]
    pub async fn sync_addresses(
        &self,
        owners: &dyn AddressOwnerLookup,
    ) -> Result<AddressSyncSummary> {
        let mut summary = AddressSyncSummary::default();

        let links = self
            .kernel
            .links()
            .await
            .map_err(kernel_op("list links", self.family))?;

        let mut enhanced: BTreeMap<String, EnhancedBySubnet> = BTreeMap::new();
        let mut manual: HashMap<String, HashSet<IpPrefix>> = HashMap::new();

        for link in links.iter().filter(|l| !self.is_pod_link(&l.name)) {
            let addresses = match self.kernel.addresses(self.family, Some(&link.name)).await {
                Ok(addresses) => addresses,
                Err(KernelError::LinkNotFound { .. }) => {
                    debug!("Link {} vanished while listing addresses", link.name);
                    continue;
                }
                Err(e) => return Err(kernel_op("list addresses of", &link.name)(e)),
            };

            for addr in addresses {
                if addr.is_enhanced() {
                    enhanced
                        .entry(link.name.clone())
                        .or_default()
                        .insert(addr.subnet(), addr);
                } else {
                    manual
                        .entry(link.name.clone())
                        .or_default()
                        .insert(addr.subnet());
                }
            }
        }

        for (link, subnets) in &enhanced {
            let targets = self.interface_to_subnet.get(link);
            for (subnet, addr) in subnets {
                if targets.is_some_and(|t| t.contains_key(subnet)) {
                    continue;
                }
                self.kernel
                    .delete_address(addr)
                    .await
                    .map_err(kernel_op("delete enhanced address", addr))?;
                info!("Removed enhanced address {}", addr);
                summary.removed += 1;
            }
        }

        for (iface, targets) in &self.interface_to_subnet {
            self.kernel
                .link_by_name(iface)
                .await
                .map_err(kernel_op("resolve forward interface", iface))?;

            for (subnet, pod_ip) in targets {
                if manual.get(iface).is_some_and(|m| m.contains(subnet)) {
                    continue;
                }

                let existing = enhanced.get(iface).and_then(|m| m.get(subnet));
                let mut out_of_date = None;
                if let Some(existing) = existing {
                    if existing.ip() == *pod_ip {
                        continue;
                    }
                    let owner = owners.owner_of(existing.ip()).await?;
                    if owner.as_deref() == Some(self.node_name.as_str()) {
                        continue;
                    }
                    out_of_date = Some(existing);
                }

                let address = Address::enhanced(
                    iface.as_str(),
                    IpPrefix::new(*pod_ip, subnet.prefix_len())?,
                );
                self.ensure_enhanced_address(&address, out_of_date).await?;
                summary.added += 1;
            }
        }

        debug!(
            "Address sync done: {} added, {} removed",
            summary.added, summary.removed
        );
        Ok(summary)
    }

    /// Add `address`, then drop the one it supersedes.
    async fn ensure_enhanced_address(
        &self,
        address: &Address,
        out_of_date: Option<&Address>,
    ) -> Result<()> {
        self.kernel
            .replace_address(address)
            .await
            .map_err(kernel_op("add enhanced address", address))?;
        info!("Added enhanced address {}", address);

        if let Some(old) = out_of_date {
            self.kernel
                .delete_address(old)
                .await
                .map_err(kernel_op("delete enhanced address", old))?;
            info!("Replaced out-of-date enhanced address {}", old);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FabricError;
    use fabric_common::Scope;
    use fabric_test::{ip, prefix, FailPoint, FakeKernel, KernelOp, KernelVerifier};
    use pretty_assertions::assert_eq;

    const NODE: &str = "node-1";

    fn manager(kernel: &Arc<FakeKernel>) -> AddressManager {
        AddressManager::new(kernel.clone(), IpFamily::Ipv4, NODE)
    }

    #[test]
    fn test_try_add_pod_info_first_wins() {
        let kernel = Arc::new(FakeKernel::new());
        let mut mgr = manager(&kernel);
        let subnet = prefix("10.0.0.0/24");

        assert!(mgr.try_add_pod_info("eth0", &subnet, ip("10.0.0.5")));
        assert!(!mgr.try_add_pod_info("eth0", &subnet, ip("10.0.0.6")));
        assert_eq!(mgr.candidate("eth0", &subnet), Some(ip("10.0.0.5")));

        // Same subnet on another interface is tracked separately.
        assert!(mgr.try_add_pod_info("eth1", &subnet, ip("10.0.0.6")));

        mgr.reset();
        assert_eq!(mgr.candidate("eth0", &subnet), None);
    }

    #[test]
    fn test_try_add_pod_info_ignores_other_family() {
        let kernel = Arc::new(FakeKernel::new());
        let mut mgr = manager(&kernel);
        assert!(!mgr.try_add_pod_info("eth0", &prefix("fd00::/64"), ip("fd00::5")));
    }

    #[tokio::test]
    async fn test_sync_adds_enhanced_address() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0"]));
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth0", &prefix("10.0.0.0/24"), ip("10.0.0.15"));

        let summary = mgr.sync_addresses(&StaticOwnerTable::new()).await.unwrap();
        assert_eq!(summary, AddressSyncSummary { added: 1, removed: 0 });

        let addr = KernelVerifier::new(&kernel)
            .assert_address("eth0", ip("10.0.0.15"))
            .unwrap();
        assert_eq!(addr.address, prefix("10.0.0.15/24"));
        assert_eq!(addr.scope, Scope::Link);
        assert!(addr.no_prefix_route);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0"]));
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth0", &prefix("10.0.0.0/24"), ip("10.0.0.15"));
        let owners = StaticOwnerTable::new();

        mgr.sync_addresses(&owners).await.unwrap();
        kernel.clear_journal();
        let summary = mgr.sync_addresses(&owners).await.unwrap();
        assert_eq!(summary, AddressSyncSummary::default());
        assert!(kernel.journal().is_empty());
    }

    #[tokio::test]
    async fn test_manual_address_suppresses_enhanced() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0"]));
        kernel.seed_address(Address::new("eth0", prefix("10.0.0.2/24")));
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth0", &prefix("10.0.0.0/24"), ip("10.0.0.15"));

        mgr.sync_addresses(&StaticOwnerTable::new()).await.unwrap();
        KernelVerifier::new(&kernel)
            .assert_no_address("eth0", ip("10.0.0.15"))
            .unwrap();
        assert!(kernel.journal().is_empty());
    }

    #[tokio::test]
    async fn test_existing_address_owned_locally_is_kept() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0"]));
        kernel.seed_address(Address::enhanced("eth0", prefix("10.0.0.7/24")));
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth0", &prefix("10.0.0.0/24"), ip("10.0.0.15"));
        let owners: StaticOwnerTable = [(ip("10.0.0.7"), NODE.to_string())].into_iter().collect();

        mgr.sync_addresses(&owners).await.unwrap();
        let verifier = KernelVerifier::new(&kernel);
        verifier.assert_address("eth0", ip("10.0.0.7")).unwrap();
        verifier.assert_no_address("eth0", ip("10.0.0.15")).unwrap();
    }

    #[tokio::test]
    async fn test_existing_address_moved_away_is_replaced() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0"]));
        kernel.seed_address(Address::enhanced("eth0", prefix("10.0.0.7/24")));
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth0", &prefix("10.0.0.0/24"), ip("10.0.0.15"));
        let owners: StaticOwnerTable =
            [(ip("10.0.0.7"), "node-2".to_string())].into_iter().collect();

        let summary = mgr.sync_addresses(&owners).await.unwrap();
        assert_eq!(summary.added, 1);

        let verifier = KernelVerifier::new(&kernel);
        verifier.assert_address("eth0", ip("10.0.0.15")).unwrap();
        verifier.assert_no_address("eth0", ip("10.0.0.7")).unwrap();

        // The new address lands before the old one goes.
        let journal = kernel.journal();
        assert!(matches!(journal[0], KernelOp::ReplaceAddress(_)));
        assert!(matches!(journal[1], KernelOp::DeleteAddress(_)));
    }

    #[tokio::test]
    async fn test_unowned_existing_address_is_replaced() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0"]));
        kernel.seed_address(Address::enhanced("eth0", prefix("10.0.0.7/24")));
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth0", &prefix("10.0.0.0/24"), ip("10.0.0.15"));

        mgr.sync_addresses(&StaticOwnerTable::new()).await.unwrap();
        let verifier = KernelVerifier::new(&kernel);
        verifier.assert_address("eth0", ip("10.0.0.15")).unwrap();
        verifier.assert_no_address("eth0", ip("10.0.0.7")).unwrap();
    }

    #[tokio::test]
    async fn test_stale_enhanced_addresses_removed() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0", "eth1"]));
        kernel.seed_address(Address::enhanced("eth0", prefix("10.0.1.7/24")));
        kernel.seed_address(Address::enhanced("eth1", prefix("10.0.2.7/24")));
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth0", &prefix("10.0.0.0/24"), ip("10.0.0.15"));

        let summary = mgr.sync_addresses(&StaticOwnerTable::new()).await.unwrap();
        assert_eq!(summary, AddressSyncSummary { added: 1, removed: 2 });

        let verifier = KernelVerifier::new(&kernel);
        verifier.assert_no_address("eth0", ip("10.0.1.7")).unwrap();
        verifier.assert_no_address("eth1", ip("10.0.2.7")).unwrap();
    }

    #[tokio::test]
    async fn test_pod_links_are_ignored() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0", "a1b2c3_h"]));
        kernel.seed_address(Address::enhanced("a1b2c3_h", prefix("169.254.1.1/32")));
        let mgr = manager(&kernel);

        mgr.sync_addresses(&StaticOwnerTable::new()).await.unwrap();
        KernelVerifier::new(&kernel)
            .assert_address("a1b2c3_h", ip("169.254.1.1"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_custom_pod_link_suffix() {
        let kernel = Arc::new(FakeKernel::with_links(["veth9"]));
        kernel.seed_address(Address::enhanced("veth9", prefix("10.0.3.3/24")));
        let mgr = manager(&kernel).with_pod_link_suffixes(vec!["9".to_string()]);

        mgr.sync_addresses(&StaticOwnerTable::new()).await.unwrap();
        KernelVerifier::new(&kernel)
            .assert_address("veth9", ip("10.0.3.3"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_forward_interface_fails() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0"]));
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth9", &prefix("10.0.0.0/24"), ip("10.0.0.15"));

        let err = mgr
            .sync_addresses(&StaticOwnerTable::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Kernel { .. }));
    }

    #[tokio::test]
    async fn test_kernel_failure_propagates() {
        let kernel = Arc::new(FakeKernel::with_links(["eth0"]));
        kernel.fail_on(FailPoint::ReplaceAddress);
        let mut mgr = manager(&kernel);
        mgr.try_add_pod_info("eth0", &prefix("10.0.0.0/24"), ip("10.0.0.15"));

        let err = mgr
            .sync_addresses(&StaticOwnerTable::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
