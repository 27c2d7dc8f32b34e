//! Shared test utilities for core module tests
//!
//! Only compiled in test mode.

use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Hold the guard for the whole test when temporarily changing
/// `PORTSHIFT_*` env vars, and restore them before dropping it.
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// A gost unit file carrying one TCP+UDP forward on port 9000.
pub fn sample_gost_unit() -> String {
    "[Unit]\n\
     Description=GO Simple Tunnel\n\
     After=network.target\n\
     \n\
     [Service]\n\
     Type=simple\n\
     ExecStart=/opt/gost/gost -L=tcp://:9000/1.1.1.1:9000 -L=udp://:9000/1.1.1.1:9000\n\
     Restart=always\n\
     \n\
     [Install]\n\
     WantedBy=multi-user.target\n"
        .to_string()
}

/// A haproxy config carrying one forward on port 8443.
pub fn sample_haproxy_config() -> String {
    "global\n    log /dev/log local0\n\n\
     defaults\n    mode tcp\n    timeout connect 10s\n\n\
     frontend tunnel-8443\n    bind :::8443 v4v6\n    mode tcp\n    default_backend tunnel-2.2.2.2-443\n\n\
     backend tunnel-2.2.2.2-443\n    mode tcp\n    server target_server 2.2.2.2:443\n"
        .to_string()
}

/// An xray config with the reserved `api` inbound plus one forward on 8443.
pub fn sample_xray_config() -> String {
    serde_json::json!({
        "log": { "loglevel": "warning" },
        "inbounds": [
            {
                "tag": "api",
                "port": 10085,
                "protocol": "dokodemo-door",
                "settings": { "address": "127.0.0.1" }
            },
            {
                "tag": "inbound-8443",
                "port": 8443,
                "protocol": "dokodemo-door",
                "settings": {
                    "address": "2.2.2.2",
                    "followRedirect": false,
                    "network": "tcp,udp",
                    "port": 443
                }
            }
        ],
        "outbounds": [ { "protocol": "freedom", "tag": "direct" } ]
    })
    .to_string()
}

/// An `iptables-save` dump forwarding 80 and 443 to 1.1.1.1.
pub fn sample_nat_dump() -> String {
    "*nat\n\
     :PREROUTING ACCEPT [0:0]\n\
     :POSTROUTING ACCEPT [0:0]\n\
     -A PREROUTING -p tcp -m multiport --dports 80,443 -j DNAT --to-destination 1.1.1.1\n\
     -A PREROUTING -p udp -m multiport --dports 80,443 -j DNAT --to-destination 1.1.1.1\n\
     -A POSTROUTING -p tcp -m multiport --dports 80,443 -j MASQUERADE\n\
     -A POSTROUTING -p udp -m multiport --dports 80,443 -j MASQUERADE\n\
     COMMIT\n"
        .to_string()
}
