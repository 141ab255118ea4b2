//! Value types for the fabric data plane.
//!
//! This crate holds the pieces of the node daemon that never touch the
//! kernel:
//!
//! - [`IpFamily`], [`IpPrefix`]: address families and CIDR prefixes
//! - [`IpRange`]: closed address intervals used for exclusion bookkeeping
//! - [`find_exclude_blocks`]: converts included ranges and excluded points
//!   into the minimal set of CIDR blocks outside the allocatable space
//! - [`SubnetInfo`], [`SubnetInfoMap`], [`NetworkMode`]: the per-subnet
//!   description consumed by the route and address managers

mod exclude;
mod ip;
mod ip_range;
mod subnet;

pub use exclude::{find_exclude_blocks, split_range_to_blocks};
pub use ip::{next_ip, prev_ip, IpFamily, IpPrefix};
pub use ip_range::IpRange;
pub use subnet::{NetworkMode, SubnetInfo, SubnetInfoMap};

use std::net::IpAddr;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid network mode: {0}")]
    InvalidNetworkMode(String),
}

/// Errors raised while turning ranges into exclusion blocks.
///
/// All of these describe an inconsistent desired state; the caller must
/// abandon the affected subnet rather than route around it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("ip range {start}~{end} is out of cidr {cidr}")]
    OutOfCidr {
        start: IpAddr,
        end: IpAddr,
        cidr: IpPrefix,
    },

    #[error("ip range is overlapped for range {first_start}~{first_end} and {second_start}~{second_end}")]
    Overlapped {
        first_start: IpAddr,
        first_end: IpAddr,
        second_start: IpAddr,
        second_end: IpAddr,
    },

    #[error("address {addr} is not of the {expected} family")]
    FamilyMismatch { addr: IpAddr, expected: IpFamily },
}
