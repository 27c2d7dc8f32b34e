//! Codec for the xray JSON configuration
//!
//! Forwarding rules are `dokodemo-door` entries of the top-level
//! `inbounds` array:
//!
//! ```json
//! {
//!     "tag": "inbound-8443",
//!     "port": 8443,
//!     "protocol": "dokodemo-door",
//!     "settings": {
//!         "address": "2.2.2.2",
//!         "followRedirect": false,
//!         "network": "tcp,udp",
//!         "port": 443
//!     }
//! }
//! ```
//!
//! The document is held as a `serde_json` value tree and edited in place,
//! so the key order of everything we do not touch (outbounds, routing, the
//! reserved `api` inbound) survives re-encoding. `serde_json`'s
//! `preserve_order` feature keeps object keys in document order, and output
//! is re-encoded with four-space indentation to match what xray ships.

use serde::Serialize;
use serde_json::map::Map;
use serde_json::ser::{PrettyFormatter, Serializer};
use serde_json::Value;

use crate::core::error::{Error, Result};
use crate::core::rule::{ProtocolSet, RuleRecord};

pub const BACKEND: &str = "xray";

/// Inbounds carrying this tag belong to xray's own stats API and are
/// never listed or removed.
const RESERVED_TAG: &str = "api";

fn parse(document: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(document).map_err(|e| Error::Parse {
        backend: BACKEND,
        reason: e.to_string(),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Parse {
            backend: BACKEND,
            reason: "top level is not a JSON object".to_string(),
        }),
    }
}

fn render(doc: &Map<String, Value>) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = Serializer::with_formatter(&mut buf, formatter);
    doc.serialize(&mut ser)?;
    let mut out = String::from_utf8(buf).map_err(|e| Error::Parse {
        backend: BACKEND,
        reason: e.to_string(),
    })?;
    out.push('\n');
    Ok(out)
}

fn inbounds(doc: &Map<String, Value>) -> &[Value] {
    doc.get("inbounds")
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn inbound_port(inbound: &Value) -> Option<u16> {
    inbound
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
}

fn inbound_tag(inbound: &Value) -> Option<&str> {
    inbound.get("tag").and_then(Value::as_str)
}

fn is_reserved(inbound: &Value) -> bool {
    inbound_tag(inbound) == Some(RESERVED_TAG)
}

fn protocols_of(settings: Option<&Value>) -> ProtocolSet {
    let Some(network) = settings
        .and_then(|s| s.get("network"))
        .and_then(Value::as_str)
    else {
        return ProtocolSet::both();
    };
    let mut set = ProtocolSet::default();
    for word in network.split(',') {
        if let Ok(proto) = word.trim().parse() {
            set.insert(proto);
        }
    }
    if set.is_empty() { ProtocolSet::both() } else { set }
}

/// Decodes inbounds into logical rules, in document order.
///
/// Entries that are not `dokodemo-door` forwards still get a row, with an
/// empty destination, so foreign inbounds on a port stay visible.
pub fn decode(document: &str) -> Result<Vec<RuleRecord>> {
    let doc = parse(document)?;
    Ok(inbounds(&doc)
        .iter()
        .filter(|inbound| !is_reserved(inbound))
        .filter_map(|inbound| {
            let port = inbound_port(inbound)?;
            let forward = inbound.get("protocol").and_then(Value::as_str) == Some("dokodemo-door");
            let settings = inbound.get("settings").filter(|_| forward);
            let host = settings
                .and_then(|s| s.get("address"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let dest_port = settings
                .and_then(|s| s.get("port"))
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or_default();
            Some(RuleRecord {
                port,
                host,
                dest_port,
                protocols: protocols_of(settings),
                identity: inbound_tag(inbound)
                    .map_or_else(|| format!("inbound-{port}"), str::to_string),
            })
        })
        .collect())
}

/// Appends a `dokodemo-door` inbound tagged `inbound-<port>`. Any inbound
/// already sitting on the port, the reserved one included, is a collision.
pub fn add(
    document: &str,
    port: u16,
    host: &str,
    dest_port: u16,
    protocols: ProtocolSet,
) -> Result<String> {
    let mut doc = parse(document)?;
    if inbounds(&doc)
        .iter()
        .any(|inbound| inbound_port(inbound) == Some(port))
    {
        return Err(Error::PortInUse(port));
    }

    let network = protocols
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let mut settings = Map::new();
    settings.insert("address".to_string(), Value::from(host));
    settings.insert("followRedirect".to_string(), Value::Bool(false));
    settings.insert("network".to_string(), Value::from(network));
    settings.insert("port".to_string(), Value::from(dest_port));

    let mut inbound = Map::new();
    inbound.insert("listen".to_string(), Value::Null);
    inbound.insert("port".to_string(), Value::from(port));
    inbound.insert("protocol".to_string(), Value::from("dokodemo-door"));
    inbound.insert("settings".to_string(), Value::Object(settings));
    inbound.insert("tag".to_string(), Value::from(format!("inbound-{port}")));

    let list = doc
        .entry("inbounds".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(list) = list.as_array_mut() else {
        return Err(Error::Parse {
            backend: BACKEND,
            reason: "inbounds is not an array".to_string(),
        });
    };
    list.push(Value::Object(inbound));
    render(&doc)
}

/// Removes the inbound listening on `port`. The reserved `api` inbound is
/// never a removal candidate, whatever port it sits on.
pub fn remove(document: &str, port: u16) -> Result<String> {
    let mut doc = parse(document)?;
    let Some(list) = doc.get_mut("inbounds").and_then(Value::as_array_mut) else {
        return Err(Error::RuleNotFound(format!("port {port}")));
    };
    let before = list.len();
    list.retain(|inbound| is_reserved(inbound) || inbound_port(inbound) != Some(port));
    if list.len() == before {
        return Err(Error::RuleNotFound(format!("port {port}")));
    }
    render(&doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::Protocol;

    const CONFIG: &str = r#"{
    "log": {
        "loglevel": "warning"
    },
    "inbounds": [
        {
            "tag": "api",
            "port": 10085,
            "protocol": "dokodemo-door",
            "settings": {
                "address": "127.0.0.1"
            }
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
    "outbounds": [
        {
            "protocol": "freedom",
            "tag": "direct"
        }
    ]
}
"#;

    #[test]
    fn test_decode_skips_reserved_inbound() {
        let rules = decode(CONFIG).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].port, 8443);
        assert_eq!(rules[0].host, "2.2.2.2");
        assert_eq!(rules[0].dest_port, 443);
        assert_eq!(rules[0].protocols, ProtocolSet::both());
        assert_eq!(rules[0].identity, "inbound-8443");
    }

    #[test]
    fn test_decode_foreign_inbound_has_empty_destination() {
        let doc = r#"{"inbounds":[{"tag":"socks-in","port":1080,"protocol":"socks"}]}"#;
        let rules = decode(doc).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host, "");
        assert_eq!(rules[0].dest_port, 0);
        assert_eq!(rules[0].protocols, ProtocolSet::both());
    }

    #[test]
    fn test_decode_single_network() {
        let doc = r#"{"inbounds":[{"tag":"inbound-53","port":53,"protocol":"dokodemo-door",
            "settings":{"address":"dns.example","network":"udp","port":53}}]}"#;
        let rules = decode(doc).unwrap();
        assert_eq!(rules[0].protocols, ProtocolSet::single(Protocol::Udp));
    }

    #[test]
    fn test_decode_invalid_json_is_parse_error() {
        let err = decode("{ not json").unwrap_err();
        assert!(matches!(err, Error::Parse { backend: "xray", .. }));
    }

    #[test]
    fn test_add_appends_tagged_inbound() {
        let out = add(CONFIG, 9000, "1.1.1.1", 9000, ProtocolSet::both()).unwrap();
        let rules = decode(&out).unwrap();
        assert_eq!(rules.len(), 2);
        let added = rules.iter().find(|r| r.port == 9000).unwrap();
        assert_eq!(added.identity, "inbound-9000");
        assert_eq!(added.host, "1.1.1.1");
        assert!(out.contains("\"listen\": null"));
        assert!(out.contains("\"followRedirect\": false"));
        assert!(out.contains("\"network\": \"tcp,udp\""));
    }

    #[test]
    fn test_add_preserves_foreign_sections_and_indent() {
        let out = add(CONFIG, 9000, "1.1.1.1", 9000, ProtocolSet::single(Protocol::Tcp)).unwrap();
        assert!(out.contains("\"loglevel\": \"warning\""));
        assert!(out.contains("\"freedom\""));
        // Four-space indentation, like the document we started from.
        assert!(out.contains("\n    \"inbounds\""));
        assert!(out.contains("\"network\": \"tcp\""));
    }

    #[test]
    fn test_add_occupied_port_is_collision() {
        // Same destination or not, an occupied port is a collision.
        let err = add(CONFIG, 8443, "2.2.2.2", 443, ProtocolSet::both()).unwrap_err();
        assert!(matches!(err, Error::PortInUse(8443)));
        let err = add(CONFIG, 8443, "9.9.9.9", 443, ProtocolSet::both()).unwrap_err();
        assert!(matches!(err, Error::PortInUse(8443)));
        // The reserved inbound's port is occupied too.
        let err = add(CONFIG, 10085, "9.9.9.9", 443, ProtocolSet::both()).unwrap_err();
        assert!(matches!(err, Error::PortInUse(10085)));
    }

    #[test]
    fn test_mutations_keep_key_order() {
        // Top-level sections and the reserved inbound keep the key order
        // the document came with.
        let removed = remove(CONFIG, 8443).unwrap();
        let log = removed.find("\"log\"").unwrap();
        let inbounds = removed.find("\"inbounds\"").unwrap();
        let outbounds = removed.find("\"outbounds\"").unwrap();
        assert!(log < inbounds && inbounds < outbounds);
        let api_tag = removed.find("\"tag\": \"api\"").unwrap();
        let api_port = removed.find("\"port\": 10085").unwrap();
        assert!(api_tag < api_port);

        let added = add(CONFIG, 9000, "1.1.1.1", 9000, ProtocolSet::both()).unwrap();
        assert!(added.find("\"log\"").unwrap() < added.find("\"inbounds\"").unwrap());
        assert!(added.find("\"tag\": \"api\"").unwrap() < added.find("\"port\": 10085").unwrap());
    }

    #[test]
    fn test_remove_drops_inbound() {
        let out = remove(CONFIG, 8443).unwrap();
        assert!(decode(&out).unwrap().is_empty());
        // Reserved inbound survives.
        assert!(out.contains("\"api\""));
    }

    #[test]
    fn test_remove_never_touches_reserved_inbound() {
        let err = remove(CONFIG, 10085).unwrap_err();
        assert!(matches!(err, Error::RuleNotFound(_)));
    }

    #[test]
    fn test_remove_missing_port() {
        let err = remove(CONFIG, 1).unwrap_err();
        assert!(matches!(err, Error::RuleNotFound(_)));
    }
}
