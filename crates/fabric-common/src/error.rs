//! Error types for kernel operations.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors that can occur while reading or programming kernel network state.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Command output could not be understood.
    #[error("Unexpected output from '{command}': {message}")]
    InvalidOutput {
        command: String,
        message: String,
    },

    /// Network interface does not exist.
    #[error("Link '{name}' not found")]
    LinkNotFound {
        /// The interface name.
        name: String,
    },

    /// The kernel refused the request.
    #[error("Kernel rejected {operation}: {message}")]
    Rejected {
        /// The operation that was refused (e.g., "route replace").
        operation: String,
        /// Error message.
        message: String,
    },
}

impl KernelError {
    /// Creates an invalid output error.
    pub fn invalid_output(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOutput {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates a link not found error.
    pub fn link_not_found(name: impl Into<String>) -> Self {
        Self::LinkNotFound { name: name.into() }
    }

    /// Creates a rejected request error.
    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KernelError::ShellExec { .. }
                | KernelError::ShellCommandFailed { .. }
                | KernelError::Rejected { .. }
                | KernelError::LinkNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KernelError::link_not_found("eth9");
        assert_eq!(err.to_string(), "Link 'eth9' not found");
    }

    #[test]
    fn test_shell_command_failed() {
        let err = KernelError::ShellCommandFailed {
            command: "/sbin/ip -4 route replace default dev eth0 table 10000".to_string(),
            exit_code: 2,
            output: "Cannot find device".to_string(),
        };
        assert!(err.to_string().contains("route replace default"));
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(KernelError::link_not_found("eth0").is_retryable());
        assert!(KernelError::rejected("rule add", "File exists").is_retryable());
        assert!(!KernelError::invalid_output("ip -j rule show", "bad json").is_retryable());
    }
}
