//! Synchronization driver
//!
//! Each enabled address family gets its own [`FamilySyncer`] running on its
//! own task. A pass reloads the desired state, reconciles routes, then
//! reconciles enhanced addresses. Failures are logged and retried on the
//! next pass; nothing here ends the process.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fabric_common::Kernel;
use fabric_types::{IpFamily, IpPrefix, NetworkMode};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::addr_mgr::{AddressManager, AddressSyncSummary};
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::route_mgr::{RouteManager, RouteSyncOutcome};
use crate::state::DesiredState;

/// What one pass of one family did
#[derive(Debug)]
pub struct PassReport {
    pub family: IpFamily,
    /// State file entries that failed to convert
    pub invalid: Vec<(String, FabricError)>,
    pub routes: Result<RouteSyncOutcome>,
    pub addresses: Result<AddressSyncSummary>,
}

impl PassReport {
    /// Number of subnets, entries or phases that failed.
    pub fn failure_count(&self) -> usize {
        let route_failures = match &self.routes {
            Ok(outcome) => outcome.failed.len(),
            Err(_) => 1,
        };
        self.invalid.len() + route_failures + usize::from(self.addresses.is_err())
    }

    pub fn is_clean(&self) -> bool {
        self.failure_count() == 0
    }

    fn log(&self) {
        for (entry, e) in &self.invalid {
            warn!(family = %self.family, class = %e.class(), "Skipping subnet {}: {}", entry, e);
        }
        match &self.routes {
            Ok(outcome) => {
                for (subnet, e) in &outcome.failed {
                    warn!(
                        family = %self.family,
                        class = %e.class(),
                        retryable = e.is_retryable(),
                        "Subnet {} not converged: {}", subnet, e
                    );
                }
            }
            Err(e) => error!(family = %self.family, "Route sync failed: {}", e),
        }
        if let Err(e) = &self.addresses {
            error!(family = %self.family, "Address sync failed: {}", e);
        }
        if self.is_clean() {
            debug!(family = %self.family, "Pass converged");
        } else {
            info!(
                family = %self.family,
                failures = self.failure_count(),
                "Pass finished with failures"
            );
        }
    }
}

/// Route and address managers of one family
pub struct FamilySyncer {
    family: IpFamily,
    routes: RouteManager,
    addresses: AddressManager,
}

impl FamilySyncer {
    pub fn new(
        kernel: Arc<dyn Kernel>,
        family: IpFamily,
        node_name: &str,
        pod_link_suffixes: Vec<String>,
    ) -> Self {
        Self {
            family,
            routes: RouteManager::new(kernel.clone(), family),
            addresses: AddressManager::new(kernel, family, node_name)
                .with_pod_link_suffixes(pod_link_suffixes),
        }
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    /// Run one reconciliation pass against `state`.
    #[instrument(skip_all, fields(family = %self.family))]
    pub async fn run_pass(&mut self, state: &DesiredState) -> PassReport {
        let subnets = state.subnet_maps(self.family);

        let routes = self
            .routes
            .sync_routes_retaining(&subnets.local, &subnets.remote, &subnets.retained)
            .await;

        self.addresses.reset();
        for pod in &state.pods {
            let Ok(subnet) = pod.subnet.parse::<IpPrefix>() else {
                debug!("Skipping pod {} with malformed subnet {}", pod.address, pod.subnet);
                continue;
            };
            let Some(info) = subnets.local.get(&subnet.network().to_string()) else {
                continue;
            };
            if info.mode != NetworkMode::Vlan || !info.underlay_on_host {
                continue;
            }
            let Ok(address) = pod.address.parse::<IpAddr>() else {
                debug!("Skipping malformed pod address {}", pod.address);
                continue;
            };
            if !info.cidr.contains(&address) {
                debug!("Pod address {} is outside subnet {}", address, info.cidr);
                continue;
            }
            let iface = pod
                .interface
                .as_deref()
                .unwrap_or(info.forward_interface.as_str());
            self.addresses.try_add_pod_info(iface, &info.cidr, address);
        }
        let addresses = self.addresses.sync_addresses(&state.owner_table()).await;

        PassReport {
            family: self.family,
            invalid: subnets.invalid,
            routes,
            addresses,
        }
    }
}

/// Runs the per-family syncers until cancelled
pub struct Daemon {
    kernel: Arc<dyn Kernel>,
    node_name: String,
    pod_link_suffixes: Vec<String>,
    state_file: PathBuf,
    interval: Duration,
    families: Vec<IpFamily>,
}

impl Daemon {
    pub fn new(config: &FabricConfig, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            kernel,
            node_name: config.node.name.clone(),
            pod_link_suffixes: config.node.pod_link_suffixes.clone(),
            state_file: config.sync.state_file.clone(),
            interval: config.sync_interval(),
            families: config.families(),
        }
    }

    fn syncer(&self, family: IpFamily) -> FamilySyncer {
        FamilySyncer::new(
            self.kernel.clone(),
            family,
            &self.node_name,
            self.pod_link_suffixes.clone(),
        )
    }

    /// Run a single pass for every family.
    pub async fn run_once(&self) -> Result<Vec<PassReport>> {
        let state = DesiredState::load(&self.state_file)?;
        let mut reports = Vec::with_capacity(self.families.len());
        for family in &self.families {
            let report = self.syncer(*family).run_pass(&state).await;
            report.log();
            reports.push(report);
        }
        Ok(reports)
    }

    /// Run passes on every family's own task until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();
        for family in &self.families {
            let syncer = self.syncer(*family);
            let state_file = self.state_file.clone();
            let interval = self.interval;
            let shutdown = shutdown.child_token();
            tasks.spawn(run_family(syncer, state_file, interval, shutdown));
        }
        info!(
            "fabricd: Started {} family syncer(s), pass interval {:?}",
            self.families.len(),
            self.interval
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("fabricd: Family syncer task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

async fn run_family(
    mut syncer: FamilySyncer,
    state_file: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let family = syncer.family();
    loop {
        match DesiredState::load(&state_file) {
            Ok(state) => syncer.run_pass(&state).await.log(),
            Err(e) => warn!(%family, "Cannot load desired state: {}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(%family, "Syncer stopping");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
