//! Privilege elevation for system operations
//!
//! portshift runs as an unprivileged user and only elevates for specific
//! programs:
//!
//! - **systemctl**: service state queries, restarts and daemon reloads
//! - **iptables** / **iptables-save**: NAT rule mutation and observation
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-terminal fallback**: `pkexec` for graphical authentication
//!
//! # Environment Variables
//!
//! - `PORTSHIFT_ELEVATION_METHOD`: force a specific method (`sudo`, `run0`
//!   or `pkexec`), e.g. for scripts with sudoers NOPASSWD rules.
//! - `PORTSHIFT_TEST_NO_ELEVATION`: bypass elevation entirely (testing only).
//!
//! # Security
//!
//! Only the whitelisted binaries above can be elevated, and arguments are
//! passed directly without shell interpretation. Mutations are additionally
//! audit logged by the caller.

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `PORTSHIFT_ELEVATION_METHOD`
    #[error("Invalid PORTSHIFT_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Internal helper to build an elevated command for a specific program.
///
/// Not exposed publicly - callers go through the per-program constructors
/// below so only whitelisted binaries can be elevated.
fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict test mode override (highest priority)
    if std::env::var("PORTSHIFT_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct root execution (no prompt needed)
    let is_root = nix::unistd::getuid().is_root();
    if is_root {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("PORTSHIFT_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    let mut cmd = Command::new(&method);
                    cmd.arg(program).args(args);
                    Ok(cmd)
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fall back to
    //    sudo on a terminal, pkexec otherwise.
    if binary_exists("run0") {
        let mut cmd = Command::new("run0");
        cmd.arg(program).args(args);
        return Ok(cmd);
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);

    if is_atty {
        let mut cmd = Command::new("sudo");
        cmd.arg(program).args(args);
        Ok(cmd)
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }

        let mut cmd = Command::new("pkexec");
        cmd.arg(program).args(args);
        Ok(cmd)
    }
}

/// Creates an elevated `systemctl` command with the specified arguments.
///
/// Arguments are passed directly to `systemctl` without shell
/// interpretation; unit names must be validated by the caller.
pub fn create_elevated_systemctl_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command("systemctl", args)
}

/// Creates an elevated `iptables` command with the specified arguments.
pub fn create_elevated_iptables_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command("iptables", args)
}

/// Creates an elevated `iptables-save` command. Takes no arguments; the
/// full dump is always requested.
pub fn create_elevated_iptables_save_command() -> Result<Command, ElevationError> {
    build_elevated_command("iptables-save", &[])
}
