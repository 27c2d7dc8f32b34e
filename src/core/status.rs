//! Status aggregation across backends
//!
//! Reconciles live systemd state with the rules each backend document
//! declares. Collection never fails as a whole: a backend that cannot be
//! read or decoded reports its error in its own row and leaves the others
//! alone.

use serde::Serialize;
use strum::IntoEnumIterator;

use crate::core::error::Error;
use crate::core::registry::{Backend, Registry};
use crate::core::rule::RuleRecord;
use crate::service::{NatTable, ServiceControl, detect_persistence_unit};
use crate::store::DocumentStore;

/// One backend's reconciled view: unit state plus declared rules.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub backend: Backend,
    /// The unit queried: the backend's own service, or the distro NAT
    /// persistence unit for iptables.
    pub unit: String,
    pub active: bool,
    pub enabled: bool,
    pub rules: Vec<RuleRecord>,
    /// Read or decode failure for this backend, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct StatusAggregator<'a, S, C, N> {
    registry: &'a Registry<S, C, N>,
}

impl<'a, S, C, N> StatusAggregator<'a, S, C, N>
where
    S: DocumentStore,
    C: ServiceControl,
    N: NatTable,
{
    pub fn new(registry: &'a Registry<S, C, N>) -> Self {
        Self { registry }
    }

    pub async fn collect(&self, backend: Backend) -> BackendStatus {
        let unit = match backend {
            Backend::Iptables => detect_persistence_unit().await,
            _ => self.registry.unit_name(backend).to_string(),
        };
        let control = self.registry.control();
        let active = control.is_active(&unit).await.unwrap_or(false);
        let enabled = control.is_enabled(&unit).await.unwrap_or(false);

        let (rules, error) = match self.registry.list(backend).await {
            Ok(rules) => (rules, None),
            // A document that is not there yet just means no rules.
            Err(Error::ConfigNotFound(_)) => (Vec::new(), None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        BackendStatus {
            backend,
            unit,
            active,
            enabled,
            rules,
            error,
        }
    }

    /// All four backends, each collected independently.
    pub async fn collect_all(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::with_capacity(4);
        for backend in Backend::iter() {
            statuses.push(self.collect(backend).await);
        }
        statuses
    }
}
