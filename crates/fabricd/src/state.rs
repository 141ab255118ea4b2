//! Desired-state input
//!
//! The daemon reads the cluster's view of this node from a JSON file that an
//! external agent keeps current. Each entry is converted independently; a
//! malformed subnet is reported and skipped, the rest of the file still
//! applies.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use fabric_types::{
    IpFamily, IpPrefix, IpRange, NetworkMode, ParseError, SubnetInfo, SubnetInfoMap,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::addr_mgr::StaticOwnerTable;
use crate::error::{FabricError, Result};

/// Closed address range as written in the state file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    pub start: String,
    pub end: String,
}

/// One subnet as written in the state file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub cidr: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub exclude_ips: Vec<String>,
    #[serde(default)]
    pub included_ranges: Vec<RangeSpec>,
    #[serde(default)]
    pub forward_interface: String,
    #[serde(default)]
    pub auto_nat_outgoing: bool,
    #[serde(default)]
    pub underlay_on_host: bool,
    pub mode: String,
}

/// A pod address on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Forwarding interface; defaults to the subnet's
    #[serde(default)]
    pub interface: Option<String>,
    pub subnet: String,
    pub address: String,
}

/// Everything the daemon converges towards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Subnets with pods or forwarding on this node
    #[serde(default)]
    pub subnets: Vec<SubnetSpec>,
    /// Subnets of other clusters
    #[serde(default)]
    pub remote_subnets: Vec<SubnetSpec>,
    #[serde(default)]
    pub pods: Vec<PodSpec>,
    /// Pod address -> owning node
    #[serde(default)]
    pub address_owners: HashMap<String, String>,
}

/// Subnet maps of one family, plus the entries that failed to convert
#[derive(Debug, Default)]
pub struct FamilySubnets {
    pub local: SubnetInfoMap,
    pub remote: SubnetInfoMap,
    pub invalid: Vec<(String, FabricError)>,
    /// Networks of invalid local entries whose CIDR still parses. Their
    /// rules and tables stay as they are until the entry is fixed or
    /// removed.
    pub retained: HashSet<IpPrefix>,
}

fn parse_ip(s: &str) -> std::result::Result<IpAddr, ParseError> {
    s.trim()
        .parse()
        .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
}

impl SubnetSpec {
    /// Family of the CIDR, if it parses.
    pub fn family(&self) -> Option<IpFamily> {
        self.cidr.parse::<IpPrefix>().ok().map(|p| p.family())
    }

    /// Convert into a [`SubnetInfo`], checking that every address belongs
    /// to the CIDR's family.
    pub fn to_subnet_info(&self) -> Result<SubnetInfo> {
        let cidr: IpPrefix = self.cidr.parse()?;
        let mode: NetworkMode = self.mode.parse()?;
        let family = cidr.family();

        let same_family = |addr: IpAddr, field: &str| -> Result<IpAddr> {
            if IpFamily::of(&addr) != family {
                return Err(FabricError::invalid_config(
                    field,
                    format!("{} is not an {} address", addr, family),
                ));
            }
            Ok(addr)
        };

        if self.forward_interface.is_empty() {
            return Err(FabricError::invalid_config(
                "forward_interface",
                format!("subnet {} has no forward interface", cidr),
            ));
        }

        let mut info = SubnetInfo::new(cidr, mode, self.forward_interface.as_str());
        info.auto_nat_outgoing = self.auto_nat_outgoing;
        info.underlay_on_host = self.underlay_on_host;

        if let Some(gateway) = &self.gateway {
            info.gateway = Some(same_family(parse_ip(gateway)?, "gateway")?);
        }
        for ip in &self.exclude_ips {
            info.exclude_ips.push(same_family(parse_ip(ip)?, "exclude_ips")?);
        }
        for range in &self.included_ranges {
            let start = same_family(parse_ip(&range.start)?, "included_ranges")?;
            let end = same_family(parse_ip(&range.end)?, "included_ranges")?;
            match IpRange::new(start, end)? {
                Some(r) => info.included_ranges.push(r),
                None => debug!(
                    "Skipping empty range {}~{} of subnet {}",
                    range.start, range.end, cidr
                ),
            }
        }
        Ok(info)
    }
}

impl DesiredState {
    /// Load the desired state from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| match e {
            FabricError::StateFile { message, .. } => FabricError::StateFile {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| FabricError::StateFile {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Subnet maps of `family`. Entries of the other family are left out
    /// silently; entries that fail to convert are returned in `invalid`.
    pub fn subnet_maps(&self, family: IpFamily) -> FamilySubnets {
        let mut out = FamilySubnets::default();
        for (spec, error) in collect_subnets(&self.subnets, family, &mut out.local) {
            if let Ok(cidr) = spec.cidr.parse::<IpPrefix>() {
                out.retained.insert(cidr.network());
            }
            out.invalid.push((spec.cidr.clone(), error));
        }
        for (spec, error) in collect_subnets(&self.remote_subnets, family, &mut out.remote) {
            out.invalid.push((spec.cidr.clone(), error));
        }
        out
    }

    /// Owner table of the listed pod addresses. Unparseable addresses are
    /// left out.
    pub fn owner_table(&self) -> StaticOwnerTable {
        self.address_owners
            .iter()
            .filter_map(|(addr, node)| Some((parse_ip(addr).ok()?, node.clone())))
            .collect()
    }
}

/// Converts the entries of `family` into `map`, returning the ones that
/// failed.
fn collect_subnets<'a>(
    specs: &'a [SubnetSpec],
    family: IpFamily,
    map: &mut SubnetInfoMap,
) -> Vec<(&'a SubnetSpec, FabricError)> {
    let mut invalid = Vec::new();
    for spec in specs {
        if spec.family().is_some_and(|f| f != family) {
            continue;
        }
        match spec.to_subnet_info() {
            Ok(info) => {
                map.insert(info.key(), info);
            }
            Err(e) => invalid.push((spec, e)),
        }
    }
    invalid
}
