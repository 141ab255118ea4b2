//! Error types for fabricd
//!
//! Every error belongs to one [`ErrorClass`]. None of them is fatal to the
//! process: the driver logs the failure, abandons the affected subnet, and
//! retries on the next pass.

use fabric_common::KernelError;
use fabric_types::{IpFamily, ParseError, RangeError};
use thiserror::Error;

/// Coarse classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or inconsistent desired state.
    Configuration,
    /// No free route table or rule priority.
    Exhaustion,
    /// A kernel read or write failed.
    Kernel,
    /// Existing kernel state contradicts the desired state.
    Invariant,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Exhaustion => "exhaustion",
            ErrorClass::Kernel => "kernel",
            ErrorClass::Invariant => "invariant",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in fabricd
#[derive(Debug, Error)]
pub enum FabricError {
    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    #[error("Invalid address range: {0}")]
    Range(#[from] RangeError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Subnet handed to a manager of the other family.
    #[error("Subnet {subnet} is not an {expected} subnet")]
    FamilyMismatch { subnet: String, expected: IpFamily },

    /// A pool ran dry.
    #[error("Exhausted {resource}: {message}")]
    Exhausted { resource: String, message: String },

    /// Kernel operation failed.
    #[error("Failed to {operation} {target}: {source}")]
    Kernel {
        /// The operation that failed (e.g., "replace route").
        operation: String,
        /// What it was applied to.
        target: String,
        #[source]
        source: KernelError,
    },

    /// Existing kernel state is inconsistent with the subnet description.
    #[error("Subnet {subnet}: {message}")]
    Invariant { subnet: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Desired-state file could not be decoded.
    #[error("Failed to decode state file {path}: {message}")]
    StateFile { path: String, message: String },
}

/// Result type alias for fabricd operations
pub type Result<T> = std::result::Result<T, FabricError>;

impl FabricError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a resource exhaustion error.
    pub fn exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    pub fn invariant(subnet: impl ToString, message: impl Into<String>) -> Self {
        Self::Invariant {
            subnet: subnet.to_string(),
            message: message.into(),
        }
    }

    /// Wraps a kernel error with the operation and its target.
    pub fn kernel(operation: &str, target: impl ToString, source: KernelError) -> Self {
        Self::Kernel {
            operation: operation.to_string(),
            target: target.to_string(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FabricError::InvalidConfig { .. }
            | FabricError::Range(_)
            | FabricError::Parse(_)
            | FabricError::FamilyMismatch { .. }
            | FabricError::Io(_)
            | FabricError::StateFile { .. } => ErrorClass::Configuration,
            FabricError::Exhausted { .. } => ErrorClass::Exhaustion,
            FabricError::Kernel { .. } => ErrorClass::Kernel,
            FabricError::Invariant { .. } => ErrorClass::Invariant,
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Exhaustion | ErrorClass::Kernel)
    }
}

/// Builds a `map_err` adapter that attaches kernel operation context.
pub(crate) fn kernel_op<T: ToString>(
    operation: &'static str,
    target: T,
) -> impl FnOnce(KernelError) -> FabricError {
    move |source| FabricError::kernel(operation, target, source)
}
