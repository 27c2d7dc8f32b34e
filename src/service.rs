//! System service and NAT table collaborators
//!
//! Two seams the registry drives side effects through: [`ServiceControl`]
//! for systemd units (state queries, restarts, daemon reloads) and
//! [`NatTable`] for kernel NAT rules (dump, directive apply, full flush).
//! The production implementations shell out through the elevation layer;
//! tests substitute in-memory fakes.

use tracing::{info, warn};

use crate::core::codec::iptables::NatDirective;
use crate::core::error::{Error, Result};
use crate::elevation;

/// systemd access seam.
#[allow(async_fn_in_trait)]
pub trait ServiceControl {
    async fn is_active(&self, unit: &str) -> Result<bool>;
    async fn is_enabled(&self, unit: &str) -> Result<bool>;
    async fn daemon_reload(&self) -> Result<()>;
    async fn restart(&self, unit: &str) -> Result<()>;
}

/// Kernel NAT table seam.
#[allow(async_fn_in_trait)]
pub trait NatTable {
    /// Full `iptables-save` dump, or an empty string when the tool reports
    /// nothing.
    async fn dump(&self) -> Result<String>;
    async fn apply(&self, directives: &[NatDirective]) -> Result<()>;
    async fn flush(&self) -> Result<()>;
}

/// Production [`ServiceControl`] shelling out to `systemctl` with
/// elevation.
#[derive(Debug, Clone, Default)]
pub struct SystemdControl;

impl SystemdControl {
    /// Runs `systemctl <verb> <unit>` and reports whether it exited zero.
    ///
    /// `is-active`/`is-enabled` use the exit code as the answer, so a
    /// non-zero status is a `false`, not an error.
    async fn query(&self, verb: &str, unit: &str) -> Result<bool> {
        let output = elevation::create_elevated_systemctl_command(&[verb, unit])
            .map_err(|e| Error::Elevation(e.to_string()))?
            .output()
            .await
            .map_err(|e| Error::ServiceControl {
                unit: unit.to_string(),
                message: format!("failed to spawn systemctl {verb}: {e}"),
            })?;
        Ok(output.status.success())
    }

    async fn run(&self, args: &[&str], unit: &str) -> Result<()> {
        let output = elevation::create_elevated_systemctl_command(args)
            .map_err(|e| Error::Elevation(e.to_string()))?
            .output()
            .await
            .map_err(|e| Error::ServiceControl {
                unit: unit.to_string(),
                message: format!("failed to spawn systemctl: {e}"),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::ServiceControl {
                unit: unit.to_string(),
                message: stderr.trim().to_string(),
            })
        }
    }
}

impl ServiceControl for SystemdControl {
    async fn is_active(&self, unit: &str) -> Result<bool> {
        self.query("is-active", unit).await
    }

    async fn is_enabled(&self, unit: &str) -> Result<bool> {
        self.query("is-enabled", unit).await
    }

    async fn daemon_reload(&self) -> Result<()> {
        info!("reloading systemd unit definitions");
        self.run(&["daemon-reload"], "systemd").await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        info!(unit, "restarting service");
        self.run(&["restart", unit], unit).await
    }
}

/// Production [`NatTable`] shelling out to `iptables`/`iptables-save`.
#[derive(Debug, Clone, Default)]
pub struct IptablesNat;

impl NatTable for IptablesNat {
    async fn dump(&self) -> Result<String> {
        let output = elevation::create_elevated_iptables_save_command()
            .map_err(|e| Error::Elevation(e.to_string()))?
            .output()
            .await?;
        if !output.status.success() {
            warn!("iptables-save exited non-zero; treating dump as empty");
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn apply(&self, directives: &[NatDirective]) -> Result<()> {
        for directive in directives {
            let args: Vec<&str> = directive.0.iter().map(String::as_str).collect();
            let output = elevation::create_elevated_iptables_command(&args)
                .map_err(|e| Error::Elevation(e.to_string()))?
                .output()
                .await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::ServiceControl {
                    unit: "iptables".to_string(),
                    message: format!("iptables {} failed: {}", args.join(" "), stderr.trim()),
                });
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.apply(&crate::core::codec::iptables::flush_directives())
            .await
    }
}

/// Resolves the distro's NAT persistence unit from `/etc/os-release`:
/// `netfilter-persistent` on apt systems, `iptables` on dnf/yum systems.
pub async fn detect_persistence_unit() -> String {
    match tokio::fs::read_to_string("/etc/os-release").await {
        Ok(text) => persistence_unit_for(&text),
        Err(e) => {
            warn!("could not read /etc/os-release: {e}; assuming netfilter-persistent");
            "netfilter-persistent".to_string()
        }
    }
}

fn persistence_unit_for(os_release: &str) -> String {
    let ids: Vec<String> = os_release
        .lines()
        .filter_map(|line| {
            line.strip_prefix("ID=")
                .or_else(|| line.strip_prefix("ID_LIKE="))
        })
        .map(|v| v.trim_matches('"').to_ascii_lowercase())
        .collect();
    let matches_any = |names: &[&str]| {
        ids.iter()
            .any(|id| id.split_whitespace().any(|word| names.contains(&word)))
    };
    if matches_any(&["debian", "ubuntu"]) {
        "netfilter-persistent".to_string()
    } else if matches_any(&["fedora", "rhel", "centos"]) {
        "iptables".to_string()
    } else {
        "netfilter-persistent".to_string()
    }
}
