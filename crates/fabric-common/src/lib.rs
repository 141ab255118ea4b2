//! Kernel networking access for the fabric node daemon.
//!
//! - [`kernel`]: link, route, rule and address types plus the [`Kernel`] trait
//! - [`iproute`]: [`IpCommandKernel`], the `ip(8)` backed implementation
//! - [`shell`]: running `ip(8)` and classifying its failures
//! - [`error`]: Error types for kernel operations
//!
//! # Example
//!
//! ```ignore
//! use fabric_common::{IpCommandKernel, Kernel, Route};
//! use fabric_types::{IpFamily, IpPrefix};
//!
//! async fn funnel(kernel: &IpCommandKernel) -> fabric_common::KernelResult<()> {
//!     let route = Route::new(10000, IpPrefix::default_route(IpFamily::Ipv4)).dev("vxlan4");
//!     kernel.replace_route(&route).await
//! }
//! ```

pub mod error;
pub mod iproute;
pub mod kernel;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{KernelError, KernelResult};
pub use iproute::IpCommandKernel;
pub use kernel::{
    Address, Kernel, Link, Route, RouteKind, Rule, Scope, DEFAULT_TABLE, LOCAL_TABLE, MAIN_TABLE,
};
