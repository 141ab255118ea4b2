//! Verification helpers for kernel state after a reconciliation

use std::net::IpAddr;

use fabric_common::{Address, Route, Rule};
use fabric_types::{IpFamily, IpPrefix};
use thiserror::Error;

use crate::FakeKernel;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected route to {dst} in table {table}, found none")]
    RouteNotFound { table: u32, dst: IpPrefix },

    #[error("Unexpected route {route}")]
    UnexpectedRoute { route: String },

    #[error("Expected {expected} routes in table {table}, found {actual}")]
    RouteCountMismatch {
        table: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Expected one rule from {src}, found {actual}")]
    RuleCountMismatch { src: IpPrefix, actual: usize },

    #[error("Expected address {address} on {link}")]
    AddressNotFound { link: String, address: IpAddr },

    #[error("Unexpected address {address} on {link}")]
    UnexpectedAddress { link: String, address: IpAddr },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Kernel state verification helper
pub struct KernelVerifier<'a> {
    kernel: &'a FakeKernel,
}

impl<'a> KernelVerifier<'a> {
    pub fn new(kernel: &'a FakeKernel) -> Self {
        Self { kernel }
    }

    /// Returns the route to `dst` in `table`.
    pub fn assert_route(&self, table: u32, dst: &IpPrefix) -> VerifyResult<Route> {
        self.kernel
            .table_routes(table)
            .into_iter()
            .find(|r| &r.dst == dst)
            .ok_or(VerificationError::RouteNotFound { table, dst: *dst })
    }

    pub fn assert_no_route(&self, table: u32, dst: &IpPrefix) -> VerifyResult<()> {
        match self.assert_route(table, dst) {
            Ok(route) => Err(VerificationError::UnexpectedRoute {
                route: route.to_string(),
            }),
            Err(_) => Ok(()),
        }
    }

    pub fn assert_route_count(&self, table: u32, expected: usize) -> VerifyResult<()> {
        let actual = self.kernel.table_routes(table).len();
        if actual != expected {
            return Err(VerificationError::RouteCountMismatch {
                table,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Returns the single rule whose source is `src`.
    pub fn assert_single_rule(&self, src: &IpPrefix) -> VerifyResult<Rule> {
        let matching: Vec<Rule> = self
            .kernel
            .all_rules(src.family())
            .into_iter()
            .filter(|r| r.src.as_ref() == Some(src))
            .collect();
        if matching.len() != 1 {
            return Err(VerificationError::RuleCountMismatch {
                src: *src,
                actual: matching.len(),
            });
        }
        Ok(matching[0].clone())
    }

    pub fn assert_no_rule(&self, src: &IpPrefix) -> VerifyResult<()> {
        let actual = self
            .kernel
            .all_rules(src.family())
            .iter()
            .filter(|r| r.src.as_ref() == Some(src))
            .count();
        if actual != 0 {
            return Err(VerificationError::RuleCountMismatch { src: *src, actual });
        }
        Ok(())
    }

    /// Returns the address `address` assigned to `link`.
    pub fn assert_address(&self, link: &str, address: IpAddr) -> VerifyResult<Address> {
        self.kernel
            .link_addresses(link)
            .into_iter()
            .find(|a| a.ip() == address)
            .ok_or_else(|| VerificationError::AddressNotFound {
                link: link.to_string(),
                address,
            })
    }

    pub fn assert_no_address(&self, link: &str, address: IpAddr) -> VerifyResult<()> {
        if self
            .kernel
            .link_addresses(link)
            .iter()
            .any(|a| a.ip() == address)
        {
            return Err(VerificationError::UnexpectedAddress {
                link: link.to_string(),
                address,
            });
        }
        Ok(())
    }

    /// Tables of `family` referenced by any rule.
    pub fn rule_tables(&self, family: IpFamily) -> Vec<u32> {
        self.kernel
            .all_rules(family)
            .iter()
            .map(|r| r.table)
            .collect()
    }
}
