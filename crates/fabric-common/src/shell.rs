//! Running `ip(8)` through the shell.
//!
//! Every value interpolated into a command line goes through [`shellquote`]
//! so interface names coming from desired state cannot inject commands.
//! [`run_ip`] captures the exit status and output, and [`IpOutput::failure`]
//! sorts a failed invocation by what `ip` complained about.

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{KernelError, KernelResult};

/// Path to the `ip` command for routes, rules, links and addresses.
pub const IP_CMD: &str = "/sbin/ip";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// # Example
///
/// ```
/// use fabric_common::shell::shellquote;
///
/// assert_eq!(shellquote("eth0"), "\"eth0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Messages meaning the object (or the whole table) is not there.
///
/// Listing a route table that never held a route fails with
/// "FIB table does not exist", which is an empty table to us.
const ABSENT_MARKERS: &[&str] = &[
    "FIB table does not exist",
    "No such process",
    "No such file or directory",
    "Cannot assign requested address",
];

const NO_DEVICE_MARKERS: &[&str] = &["Cannot find device", "does not exist"];

const EXISTS_MARKERS: &[&str] = &["File exists"];

/// Why an `ip` invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFailure {
    /// The route, rule, address or table is absent.
    Absent,
    /// The named device is absent.
    NoDevice,
    /// The object to add is already present.
    Exists,
    Other,
}

/// Captured result of one `ip` invocation.
#[derive(Debug, Clone)]
pub struct IpOutput {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl IpOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Classifies a failed invocation; `None` on success.
    pub fn failure(&self) -> Option<IpFailure> {
        if self.success() {
            return None;
        }
        // `ip -j` starts the JSON array on stdout before it hits the error
        let text = format!("{}\n{}", self.stdout, self.stderr);
        let has = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

        Some(if has(ABSENT_MARKERS) {
            IpFailure::Absent
        } else if has(NO_DEVICE_MARKERS) {
            IpFailure::NoDevice
        } else if has(EXISTS_MARKERS) {
            IpFailure::Exists
        } else {
            IpFailure::Other
        })
    }

    fn message(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Returns stdout, or the failure as a [`KernelError`].
    ///
    /// A refusal because the object already exists becomes
    /// [`KernelError::Rejected`]; any other failure keeps the full command
    /// and output in [`KernelError::ShellCommandFailed`].
    pub fn into_stdout(self) -> KernelResult<String> {
        match self.failure() {
            None => Ok(self.stdout),
            Some(IpFailure::Exists) => Err(KernelError::rejected(self.command, self.stderr)),
            Some(_) => Err(KernelError::ShellCommandFailed {
                exit_code: self.exit_code,
                output: self.message(),
                command: self.command,
            }),
        }
    }
}

/// Runs one `ip` command line through `/bin/sh -c`.
///
/// A non-zero exit is returned as an [`IpOutput`] for the caller to
/// classify. Only a failure to spawn the shell is an error here.
pub async fn run_ip(cmd: &str) -> KernelResult<IpOutput> {
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| KernelError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = IpOutput {
        command: cmd.to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if let Some(failure) = result.failure() {
        tracing::trace!(
            command = %cmd,
            exit_code = result.exit_code,
            ?failure,
            stderr = %result.stderr,
            "ip failed"
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stdout: &str, stderr: &str) -> IpOutput {
        IpOutput {
            command: "/sbin/ip -4 -j route show table 10000".to_string(),
            exit_code: 2,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_shellquote_simple() {
        assert_eq!(shellquote("simple"), "\"simple\"");
        assert_eq!(shellquote("eth0.100"), "\"eth0.100\"");
        assert_eq!(shellquote("10.0.0.0/24"), "\"10.0.0.0/24\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hello\""), "\"say \\\"hello\\\"\"");
        assert_eq!(shellquote("path\\to"), "\"path\\\\to\"");
        assert_eq!(shellquote("line1\nline2"), "\"line1\\\nline2\"");
    }

    #[test]
    fn test_shellquote_empty() {
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            failed("[", "Error: ipv4: FIB table does not exist.\nDump terminated").failure(),
            Some(IpFailure::Absent)
        );
        assert_eq!(
            failed("", "RTNETLINK answers: No such process").failure(),
            Some(IpFailure::Absent)
        );
        assert_eq!(
            failed("", "Device \"eth9\" does not exist.").failure(),
            Some(IpFailure::NoDevice)
        );
        assert_eq!(
            failed("", "Cannot find device \"eth9\"").failure(),
            Some(IpFailure::NoDevice)
        );
        assert_eq!(
            failed("", "RTNETLINK answers: File exists").failure(),
            Some(IpFailure::Exists)
        );
        assert_eq!(
            failed("", "RTNETLINK answers: Operation not permitted").failure(),
            Some(IpFailure::Other)
        );

        let ok = IpOutput {
            exit_code: 0,
            ..failed("[]", "")
        };
        assert_eq!(ok.failure(), None);
    }

    #[test]
    fn test_into_stdout_maps_failures() {
        match failed("", "RTNETLINK answers: File exists").into_stdout() {
            Err(KernelError::Rejected { message, .. }) => assert!(message.contains("File exists")),
            other => panic!("Expected Rejected, got {:?}", other),
        }

        match failed("", "RTNETLINK answers: Operation not permitted").into_stdout() {
            Err(KernelError::ShellCommandFailed {
                command,
                exit_code,
                output,
            }) => {
                assert!(command.contains("route show table 10000"));
                assert_eq!(exit_code, 2);
                assert!(output.contains("Operation not permitted"));
            }
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_ip_captures_exit_and_output() {
        let result = run_ip("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");

        let result = run_ip("echo 'RTNETLINK answers: No such process' >&2; exit 2")
            .await
            .unwrap();
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.failure(), Some(IpFailure::Absent));
    }
}
