//! Test infrastructure for the fabric node daemon
//!
//! Provides:
//! - [`FakeKernel`], an in-memory kernel with failure injection and an
//!   operation journal
//! - Fixtures for common subnet layouts
//! - Kernel state verification helpers

mod fake_kernel;
pub mod fixtures;
mod verification;

pub use fake_kernel::{FailPoint, FakeKernel, KernelOp};
pub use fixtures::*;
pub use verification::*;
