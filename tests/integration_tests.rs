//! Integration tests for portshift
//!
//! End-to-end registry flows driven through in-memory collaborators, so no
//! test touches systemd, the kernel NAT table or system config paths.

#![allow(clippy::uninlined_format_args)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use portshift::config::AppConfig;
use portshift::core::codec::iptables::NatDirective;
use portshift::service::{NatTable, ServiceControl};
use portshift::store::{DocumentStore, Snapshot, content_hash};
use portshift::{AddRequest, Backend, Error, ProtocolSet, Registry, RemoveKey, StatusAggregator};

/// In-memory document store with the same compare-and-swap semantics as
/// the filesystem store.
#[derive(Clone, Default)]
struct MemStore {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl MemStore {
    fn insert(&self, path: &Path, text: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), text.to_string());
    }

    fn get(&self, path: &Path) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

impl DocumentStore for MemStore {
    async fn read(&self, path: &Path) -> portshift::Result<Snapshot> {
        let files = self.files.lock().unwrap();
        let text = files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::ConfigNotFound(path.to_path_buf()))?;
        let digest = content_hash(&text);
        Ok(Snapshot { text, digest })
    }

    async fn write(
        &self,
        path: &Path,
        text: &str,
        expected_digest: Option<&str>,
    ) -> portshift::Result<()> {
        let mut files = self.files.lock().unwrap();
        if let Some(expected) = expected_digest
            && let Some(current) = files.get(path)
            && content_hash(current) != expected
        {
            return Err(Error::ConcurrentModification);
        }
        files.insert(path.to_path_buf(), text.to_string());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> portshift::Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Fake systemd: a set of active/enabled units plus a record of restarts
/// and daemon reloads.
#[derive(Clone, Default)]
struct FakeControl {
    active: Arc<Mutex<HashSet<String>>>,
    enabled: Arc<Mutex<HashSet<String>>>,
    restarts: Arc<Mutex<Vec<String>>>,
    reloads: Arc<Mutex<u32>>,
    fail_restart: Arc<Mutex<bool>>,
}

impl FakeControl {
    fn set_active(&self, unit: &str) {
        self.active.lock().unwrap().insert(unit.to_string());
        self.enabled.lock().unwrap().insert(unit.to_string());
    }

    fn restarts(&self) -> Vec<String> {
        self.restarts.lock().unwrap().clone()
    }

    fn reloads(&self) -> u32 {
        *self.reloads.lock().unwrap()
    }
}

impl ServiceControl for FakeControl {
    async fn is_active(&self, unit: &str) -> portshift::Result<bool> {
        Ok(self.active.lock().unwrap().contains(unit))
    }

    async fn is_enabled(&self, unit: &str) -> portshift::Result<bool> {
        Ok(self.enabled.lock().unwrap().contains(unit))
    }

    async fn daemon_reload(&self) -> portshift::Result<()> {
        *self.reloads.lock().unwrap() += 1;
        Ok(())
    }

    async fn restart(&self, unit: &str) -> portshift::Result<()> {
        if *self.fail_restart.lock().unwrap() {
            return Err(Error::ServiceControl {
                unit: unit.to_string(),
                message: "job failed".to_string(),
            });
        }
        self.restarts.lock().unwrap().push(unit.to_string());
        Ok(())
    }
}

/// Fake NAT table that echoes applied DNAT directives back through `dump`
/// the way `iptables-save` would.
#[derive(Clone, Default)]
struct FakeNat {
    applied: Arc<Mutex<Vec<NatDirective>>>,
    flushes: Arc<Mutex<u32>>,
}

impl FakeNat {
    fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    fn flushes(&self) -> u32 {
        *self.flushes.lock().unwrap()
    }
}

impl NatTable for FakeNat {
    async fn dump(&self) -> portshift::Result<String> {
        let dump = self
            .applied
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.0.join(" "))
            .filter(|line| line.contains("PREROUTING"))
            .map(|line| {
                format!(
                    "{}\n",
                    line.trim_start_matches("-t nat ").replace("--match", "-m")
                )
            })
            .collect();
        Ok(dump)
    }

    async fn apply(&self, directives: &[NatDirective]) -> portshift::Result<()> {
        self.applied.lock().unwrap().extend_from_slice(directives);
        Ok(())
    }

    async fn flush(&self) -> portshift::Result<()> {
        self.applied.lock().unwrap().clear();
        *self.flushes.lock().unwrap() += 1;
        Ok(())
    }
}

const GOST_UNIT: &str = "[Unit]\n\
    Description=GO Simple Tunnel\n\
    \n\
    [Service]\n\
    ExecStart=/opt/gost/gost -L=tcp://:9000/1.1.1.1:9000 -L=udp://:9000/1.1.1.1:9000\n\
    Restart=always\n";

const HAPROXY_CONFIG: &str = "global\n    log /dev/log local0\n\n\
    defaults\n    mode tcp\n\n\
    frontend tunnel-8443\n    bind :::8443 v4v6\n    mode tcp\n    default_backend tunnel-2.2.2.2-443\n\n\
    backend tunnel-2.2.2.2-443\n    mode tcp\n    server target_server 2.2.2.2:443\n";

const XRAY_CONFIG: &str = r#"{
    "inbounds": [
        {
            "tag": "api",
            "port": 10085,
            "protocol": "dokodemo-door",
            "settings": { "address": "127.0.0.1" }
        }
    ],
    "outbounds": [ { "protocol": "freedom", "tag": "direct" } ]
}
"#;

struct Fixture {
    store: MemStore,
    control: FakeControl,
    nat: FakeNat,
    registry: Registry<MemStore, FakeControl, FakeNat>,
    config: AppConfig,
}

fn fixture() -> Fixture {
    let config = AppConfig::default();
    let store = MemStore::default();
    store.insert(&config.gost_unit_path, GOST_UNIT);
    store.insert(&config.haproxy_config_path, HAPROXY_CONFIG);
    store.insert(&config.xray_config_path, XRAY_CONFIG);

    let control = FakeControl::default();
    control.set_active("gost");
    control.set_active("haproxy");
    control.set_active("xray");

    let nat = FakeNat::default();
    let registry = Registry::new(store.clone(), control.clone(), nat.clone(), config.clone());
    Fixture {
        store,
        control,
        nat,
        registry,
        config,
    }
}

fn add_request(port: u16, host: &str) -> AddRequest {
    AddRequest {
        ports: vec![port],
        host: host.to_string(),
        dest_port: None,
        protocols: ProtocolSet::both(),
    }
}

#[tokio::test]
async fn test_gost_add_writes_unit_and_restarts() {
    let fx = fixture();

    let outcome = fx
        .registry
        .add(Backend::Gost, &add_request(8443, "2.2.2.2"))
        .await
        .unwrap();
    assert!(outcome.restart_error.is_none());

    let unit = fx.store.get(&fx.config.gost_unit_path).unwrap();
    assert!(unit.contains("-L=tcp://:8443/2.2.2.2:8443"));
    assert!(unit.contains("-L=udp://:8443/2.2.2.2:8443"));
    assert!(unit.contains("Description=GO Simple Tunnel"));

    // Unit file edits need a daemon-reload before the restart.
    assert_eq!(fx.control.reloads(), 1);
    assert_eq!(fx.control.restarts(), ["gost"]);

    let rules = fx.registry.list(Backend::Gost).await.unwrap();
    assert_eq!(rules.len(), 2);
}

#[tokio::test]
async fn test_add_requires_active_unit() {
    let fx = fixture();
    fx.control.active.lock().unwrap().remove("gost");

    let err = fx
        .registry
        .add(Backend::Gost, &add_request(8443, "2.2.2.2"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceControl { .. }));

    // Nothing was written and nothing was restarted.
    assert_eq!(fx.store.get(&fx.config.gost_unit_path).unwrap(), GOST_UNIT);
    assert!(fx.control.restarts().is_empty());
}

#[tokio::test]
async fn test_remove_requires_active_unit() {
    let fx = fixture();
    fx.control.active.lock().unwrap().remove("xray");

    let err = fx
        .registry
        .remove(Backend::Xray, &RemoveKey::Port(10085))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceControl { .. }));
}

#[tokio::test]
async fn test_restart_failure_is_warning_not_rollback() {
    let fx = fixture();
    *fx.control.fail_restart.lock().unwrap() = true;

    let outcome = fx
        .registry
        .add(Backend::Gost, &add_request(8443, "2.2.2.2"))
        .await
        .unwrap();

    // The edit stands even though the restart failed.
    assert!(outcome.restart_error.is_some());
    let unit = fx.store.get(&fx.config.gost_unit_path).unwrap();
    assert!(unit.contains("-L=tcp://:8443/2.2.2.2:8443"));
}

#[tokio::test]
async fn test_gost_duplicate_and_collision_errors() {
    let fx = fixture();

    let err = fx
        .registry
        .add(Backend::Gost, &add_request(9000, "1.1.1.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRule));

    let err = fx
        .registry
        .add(Backend::Gost, &add_request(9000, "9.9.9.9"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PortInUse(9000)));
}

#[tokio::test]
async fn test_gost_remove_unknown_port() {
    let fx = fixture();
    let err = fx
        .registry
        .remove(Backend::Gost, &RemoveKey::Port(1234))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuleNotFound(_)));
    assert!(fx.control.restarts().is_empty());
}

#[tokio::test]
async fn test_haproxy_full_cycle() {
    let fx = fixture();

    let req = AddRequest {
        ports: vec![9090],
        host: "3.3.3.3".to_string(),
        dest_port: Some(9090),
        protocols: ProtocolSet::both(),
    };
    fx.registry.add(Backend::Haproxy, &req).await.unwrap();
    assert_eq!(fx.control.restarts(), ["haproxy"]);
    // Config edits restart without a daemon-reload.
    assert_eq!(fx.control.reloads(), 0);

    let rules = fx.registry.list(Backend::Haproxy).await.unwrap();
    assert_eq!(rules.len(), 2);

    fx.registry
        .remove(Backend::Haproxy, &RemoveKey::Name("tunnel-9090".to_string()))
        .await
        .unwrap();
    let rules = fx.registry.list(Backend::Haproxy).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].identity, "tunnel-8443");
}

#[tokio::test]
async fn test_xray_cycle_preserves_reserved_inbound() {
    let fx = fixture();

    fx.registry
        .add(Backend::Xray, &add_request(8443, "2.2.2.2"))
        .await
        .unwrap();
    let config = fx.store.get(&fx.config.xray_config_path).unwrap();
    assert!(config.contains("\"api\""));
    assert!(config.contains("\"inbound-8443\""));
    assert!(config.contains("\"freedom\""));

    fx.registry
        .remove(Backend::Xray, &RemoveKey::Port(8443))
        .await
        .unwrap();
    let config = fx.store.get(&fx.config.xray_config_path).unwrap();
    assert!(config.contains("\"api\""));
    assert!(!config.contains("inbound-8443"));
    assert_eq!(fx.control.restarts(), ["xray", "xray"]);
}

#[tokio::test]
async fn test_iptables_add_applies_and_persists() {
    let fx = fixture();

    let req = AddRequest {
        ports: vec![80, 443],
        host: "1.1.1.1".to_string(),
        dest_port: None,
        protocols: ProtocolSet::both(),
    };
    fx.registry.add(Backend::Iptables, &req).await.unwrap();

    // Four directives: tcp/udp in both chains.
    assert_eq!(fx.nat.applied_count(), 4);

    // The dump landed in the rules file for reboot survival.
    let persisted = fx.store.get(&fx.config.iptables_rules_path).unwrap();
    assert!(persisted.contains("--to-destination 1.1.1.1"));

    let rules = fx.registry.list(Backend::Iptables).await.unwrap();
    assert_eq!(rules.len(), 2);
    assert!(rules.iter().all(|r| r.protocols == ProtocolSet::both()));
    // No unit restart for NAT mutations.
    assert!(fx.control.restarts().is_empty());
}

#[tokio::test]
async fn test_iptables_add_does_not_deduplicate() {
    let fx = fixture();
    let req = AddRequest {
        ports: vec![80],
        host: "1.1.1.1".to_string(),
        dest_port: None,
        protocols: ProtocolSet::both(),
    };
    fx.registry.add(Backend::Iptables, &req).await.unwrap();
    fx.registry.add(Backend::Iptables, &req).await.unwrap();
    assert_eq!(fx.nat.applied_count(), 8);
}

#[tokio::test]
async fn test_iptables_remove_is_rejected() {
    let fx = fixture();
    let err = fx
        .registry
        .remove(Backend::Iptables, &RemoveKey::Port(80))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_iptables_flush_clears_kernel_and_rules_file() {
    let fx = fixture();
    fx.store.insert(&fx.config.iptables_rules_path, "*nat\nCOMMIT\n");

    fx.registry.flush_nat().await.unwrap();

    assert_eq!(fx.nat.flushes(), 1);
    assert!(fx.store.get(&fx.config.iptables_rules_path).is_none());
    assert!(fx.registry.list(Backend::Iptables).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_edit_rejected_by_store_guard() {
    let store = MemStore::default();
    let path = PathBuf::from("/tmp/doc.cfg");
    store.insert(&path, "alpha\n");
    let snapshot = store.read(&path).await.unwrap();

    // Another writer slips in.
    store.write(&path, "beta\n", None).await.unwrap();

    let err = store
        .write(&path, "gamma\n", Some(&snapshot.digest))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrentModification));
    assert_eq!(store.get(&path).unwrap(), "beta\n");
}

#[tokio::test]
async fn test_status_collects_all_backends_independently() {
    let fx = fixture();
    // Break the xray document and drop the haproxy one entirely.
    fx.store.insert(&fx.config.xray_config_path, "{ not json");
    fx.store
        .files
        .lock()
        .unwrap()
        .remove(&fx.config.haproxy_config_path);

    let aggregator = StatusAggregator::new(&fx.registry);
    let statuses = aggregator.collect_all().await;
    assert_eq!(statuses.len(), 4);

    let gost = statuses.iter().find(|s| s.backend == Backend::Gost).unwrap();
    assert!(gost.active);
    assert!(gost.enabled);
    assert_eq!(gost.rules.len(), 1);
    assert!(gost.error.is_none());

    // A missing document is an empty rule list, not an error.
    let haproxy = statuses
        .iter()
        .find(|s| s.backend == Backend::Haproxy)
        .unwrap();
    assert!(haproxy.rules.is_empty());
    assert!(haproxy.error.is_none());

    // A corrupt document is captured per-backend.
    let xray = statuses.iter().find(|s| s.backend == Backend::Xray).unwrap();
    assert!(xray.rules.is_empty());
    assert!(xray.error.is_some());

    let iptables = statuses
        .iter()
        .find(|s| s.backend == Backend::Iptables)
        .unwrap();
    assert!(iptables.rules.is_empty());
    assert!(!iptables.active);
}

#[tokio::test]
async fn test_status_single_backend() {
    let fx = fixture();
    let aggregator = StatusAggregator::new(&fx.registry);
    let status = aggregator.collect(Backend::Haproxy).await;
    assert_eq!(status.unit, "haproxy");
    assert!(status.active);
    assert_eq!(status.rules.len(), 1);
    assert_eq!(status.rules[0].destination(), "2.2.2.2:443");
}
