//! Node data-plane daemon for the pod network fabric
//!
//! Converges kernel policy routing and forwarding-interface addresses
//! towards a declarative description of the node's subnets.
//!
//! - [`route_mgr`]: per-subnet source rules and route tables
//! - [`addr_mgr`]: enhanced addresses on VLAN forwarding interfaces
//! - [`state`]: the desired-state file
//! - [`sync`]: per-family reconciliation passes
//! - [`config`]: daemon configuration file

pub mod addr_mgr;
pub mod config;
pub mod error;
pub mod route_mgr;
pub mod state;
pub mod sync;
mod types;

pub use addr_mgr::{AddressManager, AddressOwnerLookup, AddressSyncSummary, StaticOwnerTable};
pub use config::{FabricConfig, LogFormat, DEFAULT_CONFIG_PATH};
pub use error::{ErrorClass, FabricError, Result};
pub use route_mgr::{
    combine_subnet_maps, find_exclude_block_map, is_from_pod_subnet_rule, ExcludeBlockMap,
    RouteManager, RouteSyncOutcome,
};
pub use state::{DesiredState, FamilySubnets, PodSpec, RangeSpec, SubnetSpec};
pub use sync::{Daemon, FamilySyncer, PassReport};
pub use types::*;
