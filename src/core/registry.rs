//! Rule registry: one mutation = one transaction
//!
//! The registry owns the three side-effect seams (document store, service
//! control, NAT table) and drives every mutation through the same shape:
//! read the document, decode, check preconditions, mutate, write back under
//! the concurrency guard, restart the owning service. A restart failure
//! after a committed write is reported as a warning, never rolled back; the
//! document already says what the operator asked for.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::config::AppConfig;
use crate::core::codec::{gost, haproxy, iptables, xray};
use crate::core::error::{Error, Result};
use crate::core::rule::{ProtocolSet, RuleRecord};
use crate::service::{NatTable, ServiceControl};
use crate::store::DocumentStore;

/// The four rule backends.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Gost,
    Haproxy,
    Xray,
    Iptables,
}

/// Parameters of an add mutation. `ports` holds one entry for the
/// file-backed backends and the whole multiport group for iptables.
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub ports: Vec<u16>,
    pub host: String,
    pub dest_port: Option<u16>,
    pub protocols: ProtocolSet,
}

/// Backend-specific removal key: a listen port, or a stanza/tag name.
#[derive(Debug, Clone)]
pub enum RemoveKey {
    Port(u16),
    Name(String),
}

impl std::fmt::Display for RemoveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Port(port) => write!(f, "port {port}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// What a committed mutation reports back. `restart_error` carries a
/// post-commit restart failure; the edit itself stands.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub detail: String,
    pub restart_error: Option<String>,
}

pub struct Registry<S, C, N> {
    store: S,
    control: C,
    nat: N,
    config: AppConfig,
    audit: Option<AuditLog>,
}

impl<S, C, N> Registry<S, C, N>
where
    S: DocumentStore,
    C: ServiceControl,
    N: NatTable,
{
    pub fn new(store: S, control: C, nat: N, config: AppConfig) -> Self {
        Self {
            store,
            control,
            nat,
            config,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub(crate) fn control(&self) -> &C {
        &self.control
    }

    fn document_path(&self, backend: Backend) -> PathBuf {
        match backend {
            Backend::Gost => self.config.gost_unit_path.clone(),
            Backend::Haproxy => self.config.haproxy_config_path.clone(),
            Backend::Xray => self.config.xray_config_path.clone(),
            Backend::Iptables => self.config.iptables_rules_path.clone(),
        }
    }

    /// systemd unit fronting a file-backed backend.
    pub(crate) fn unit_name(&self, backend: Backend) -> &str {
        match backend {
            Backend::Gost => &self.config.gost_unit_name,
            Backend::Haproxy => &self.config.haproxy_unit_name,
            Backend::Xray => &self.config.xray_unit_name,
            Backend::Iptables => unreachable!("iptables has no owning unit"),
        }
    }

    /// Decodes the live document. The document is the sole source of truth;
    /// nothing is cached between calls.
    pub async fn list(&self, backend: Backend) -> Result<Vec<RuleRecord>> {
        match backend {
            Backend::Gost => gost::decode(&self.read_document(backend).await?),
            Backend::Haproxy => haproxy::decode(&self.read_document(backend).await?),
            Backend::Xray => xray::decode(&self.read_document(backend).await?),
            Backend::Iptables => Ok(iptables::decode(&self.nat.dump().await?)),
        }
    }

    async fn read_document(&self, backend: Backend) -> Result<String> {
        Ok(self.store.read(&self.document_path(backend)).await?.text)
    }

    /// An edit to a dead service would silently change nothing until
    /// someone else starts it, so mutations require the unit to be active.
    async fn require_active(&self, backend: Backend) -> Result<()> {
        let unit = self.unit_name(backend);
        if self.control.is_active(unit).await? {
            Ok(())
        } else {
            Err(Error::ServiceControl {
                unit: unit.to_string(),
                message: "unit is not active; start it before editing rules".to_string(),
            })
        }
    }

    pub async fn add(&self, backend: Backend, req: &AddRequest) -> Result<MutationOutcome> {
        let outcome = match backend {
            Backend::Iptables => self.add_nat(req).await,
            _ => self.add_document(backend, req).await,
        };
        self.record(
            EventType::AddRule,
            backend,
            &outcome,
            serde_json::json!({ "ports": req.ports, "host": req.host }),
        )
        .await;
        outcome
    }

    pub async fn remove(&self, backend: Backend, key: &RemoveKey) -> Result<MutationOutcome> {
        let outcome = match backend {
            Backend::Iptables => Err(Error::Validation(
                "iptables rules have no per-rule removal; use flush".to_string(),
            )),
            _ => self.remove_document(backend, key).await,
        };
        self.record(
            EventType::RemoveRule,
            backend,
            &outcome,
            serde_json::json!({ "key": key.to_string() }),
        )
        .await;
        outcome
    }

    async fn add_document(&self, backend: Backend, req: &AddRequest) -> Result<MutationOutcome> {
        let &[port] = req.ports.as_slice() else {
            return Err(Error::Validation(format!(
                "{backend} takes exactly one listen port"
            )));
        };
        let dest_port = req.dest_port.unwrap_or(port);

        self.require_active(backend).await?;
        let path = self.document_path(backend);
        let snapshot = self.store.read(&path).await?;

        let updated = match backend {
            Backend::Gost => gost::add(&snapshot.text, port, &req.host, dest_port, req.protocols)?,
            Backend::Haproxy => haproxy::add(&snapshot.text, port, &req.host, dest_port)?,
            Backend::Xray => xray::add(&snapshot.text, port, &req.host, dest_port, req.protocols)?,
            Backend::Iptables => unreachable!(),
        };

        self.store
            .write(&path, &updated, Some(&snapshot.digest))
            .await?;
        info!(%backend, port, host = %req.host, "rule added");

        let restart_error = self.restart_after_edit(backend).await;
        Ok(MutationOutcome {
            detail: format!("{backend}: forwarding {port} -> {}:{dest_port}", req.host),
            restart_error,
        })
    }

    async fn remove_document(&self, backend: Backend, key: &RemoveKey) -> Result<MutationOutcome> {
        self.require_active(backend).await?;
        let path = self.document_path(backend);
        let snapshot = self.store.read(&path).await?;

        let updated = match (backend, key) {
            (Backend::Gost, RemoveKey::Port(port)) => gost::remove(&snapshot.text, *port)?,
            (Backend::Xray, RemoveKey::Port(port)) => xray::remove(&snapshot.text, *port)?,
            (Backend::Haproxy, RemoveKey::Name(name)) => haproxy::remove(&snapshot.text, name)?,
            (Backend::Haproxy, RemoveKey::Port(port)) => {
                // Convenience spelling; stanza names encode the port.
                haproxy::remove(&snapshot.text, &format!("tunnel-{port}"))?
            }
            (Backend::Gost | Backend::Xray, RemoveKey::Name(name)) => {
                return Err(Error::Validation(format!(
                    "{backend} rules are removed by port, not by name '{name}'"
                )));
            }
            (Backend::Iptables, _) => unreachable!(),
        };

        self.store
            .write(&path, &updated, Some(&snapshot.digest))
            .await?;
        info!(%backend, key = %key, "rule removed");

        let restart_error = self.restart_after_edit(backend).await;
        Ok(MutationOutcome {
            detail: format!("{backend}: removed {key}"),
            restart_error,
        })
    }

    /// Restarts the unit that owns a freshly edited document. gost unit
    /// files need a daemon-reload first so systemd picks up the new
    /// `ExecStart=` line.
    async fn restart_after_edit(&self, backend: Backend) -> Option<String> {
        let unit = self.unit_name(backend);
        let result = async {
            if backend == Backend::Gost {
                self.control.daemon_reload().await?;
            }
            self.control.restart(unit).await
        }
        .await;
        match result {
            Ok(()) => None,
            Err(e) => {
                warn!(unit, "edit committed but restart failed: {e}");
                Some(e.to_string())
            }
        }
    }

    /// Installs a NAT forward: four directives into the kernel, then the
    /// full dump into the rules file so the forward survives a reboot.
    /// Nothing de-duplicates here; iptables happily appends twins.
    async fn add_nat(&self, req: &AddRequest) -> Result<MutationOutcome> {
        if req.ports.is_empty() {
            return Err(Error::Validation(
                "iptables takes at least one port".to_string(),
            ));
        }
        self.nat
            .apply(&iptables::add_directives(&req.ports, &req.host))
            .await?;

        let dump = self.nat.dump().await?;
        self.store
            .write(&self.config.iptables_rules_path, &dump, None)
            .await?;
        info!(ports = ?req.ports, host = %req.host, "nat forward installed");

        Ok(MutationOutcome {
            detail: format!(
                "iptables: forwarding {} -> {}",
                req.ports
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                req.host
            ),
            restart_error: None,
        })
    }

    /// Tears down every NAT rule and deletes the persisted rules file.
    pub async fn flush_nat(&self) -> Result<MutationOutcome> {
        let outcome = async {
            self.nat.flush().await?;
            self.store
                .remove(&self.config.iptables_rules_path)
                .await?;
            info!("nat table flushed");
            Ok(MutationOutcome {
                detail: "iptables: flushed all rules".to_string(),
                restart_error: None,
            })
        }
        .await;
        self.record(
            EventType::FlushNat,
            Backend::Iptables,
            &outcome,
            serde_json::Value::Null,
        )
        .await;
        outcome
    }

    async fn record(
        &self,
        event_type: EventType,
        backend: Backend,
        outcome: &Result<MutationOutcome>,
        details: serde_json::Value,
    ) {
        let Some(audit) = &self.audit else { return };
        let event = AuditEvent::new(
            event_type,
            backend.as_ref(),
            outcome.is_ok(),
            details,
            outcome.as_ref().err().map(ToString::to_string),
        );
        if let Err(e) = audit.log(event).await {
            warn!("audit log write failed: {e}");
        }
    }
}
