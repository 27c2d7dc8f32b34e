//! Forwarding rule data structures
//!
//! A [`RuleRecord`] is the uniform in-memory representation of one
//! forwarding rule, regardless of which backend document it was decoded
//! from. Records are transient: every `list` re-decodes the live document,
//! and mutations re-encode the whole collection immediately. Nothing is
//! cached across invocations; the document is the sole source of truth.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Network protocol carried by a forwarding rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    /// Returns lowercase protocol name as a static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Non-empty subset of {TCP, UDP}
///
/// Two single-protocol entries for the same `(port, destination)` pair in a
/// backend document collapse into one [`RuleRecord`] carrying both flags.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolSet {
    tcp: bool,
    udp: bool,
}

impl ProtocolSet {
    pub const fn single(proto: Protocol) -> Self {
        match proto {
            Protocol::Tcp => Self {
                tcp: true,
                udp: false,
            },
            Protocol::Udp => Self {
                tcp: false,
                udp: true,
            },
        }
    }

    pub const fn both() -> Self {
        Self {
            tcp: true,
            udp: true,
        }
    }

    pub const fn contains(&self, proto: Protocol) -> bool {
        match proto {
            Protocol::Tcp => self.tcp,
            Protocol::Udp => self.udp,
        }
    }

    pub const fn is_empty(&self) -> bool {
        !self.tcp && !self.udp
    }

    pub fn insert(&mut self, proto: Protocol) {
        match proto {
            Protocol::Tcp => self.tcp = true,
            Protocol::Udp => self.udp = true,
        }
    }

    /// Iterates the contained protocols in a fixed order (tcp first).
    pub fn iter(&self) -> impl Iterator<Item = Protocol> + use<> {
        let mut protos = Vec::with_capacity(2);
        if self.tcp {
            protos.push(Protocol::Tcp);
        }
        if self.udp {
            protos.push(Protocol::Udp);
        }
        protos.into_iter()
    }
}

impl fmt::Display for ProtocolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tcp, self.udp) {
            (true, true) => write!(f, "TCP/UDP"),
            (true, false) => write!(f, "TCP"),
            (false, true) => write!(f, "UDP"),
            // Unreachable by construction; render something greppable anyway.
            (false, false) => write!(f, "NONE"),
        }
    }
}

impl std::str::FromStr for ProtocolSet {
    type Err = String;

    /// Parses CLI spellings: `tcp`, `udp`, `tcp+udp`, `both`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::single(Protocol::Tcp)),
            "udp" => Ok(Self::single(Protocol::Udp)),
            "tcp+udp" | "udp+tcp" | "both" => Ok(Self::both()),
            other => Err(format!(
                "invalid protocol '{other}' (use tcp, udp or tcp+udp)"
            )),
        }
    }
}

/// One logical forwarding rule: listen port → destination over one or more
/// protocols.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleRecord {
    /// Listen port on this host
    pub port: u16,
    /// Destination host (IP or domain); empty when the backend entry does
    /// not carry a destination
    pub host: String,
    /// Destination port; equals `port` when the backend has no independent
    /// value
    pub dest_port: u16,
    /// Non-empty protocol set
    pub protocols: ProtocolSet,
    /// Backend-specific removal key: a stanza name, an inbound tag, or the
    /// port rendered as text
    pub identity: String,
}

impl RuleRecord {
    /// Renders the destination as `host:port`, or `-` when unknown.
    pub fn destination(&self) -> String {
        if self.host.is_empty() {
            "-".to_string()
        } else {
            format!("{}:{}", self.host, self.dest_port)
        }
    }
}

impl fmt::Display for RuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} port {} -> {}",
            self.protocols,
            self.port,
            self.destination()
        )
    }
}

/// Collapses per-protocol document entries into logical rules.
///
/// Both the gost unit file and the iptables NAT table persist one entry per
/// protocol; a tunnel forwarding tcp+udp therefore appears twice. Entries
/// sharing `(port, host, dest_port)` merge into a single record with the
/// union of their protocols, ordered by `(port, host)`. Identity is the
/// listen port, which is how both of those backends address rules.
pub fn merge_protocol_entries(
    entries: impl IntoIterator<Item = (u16, String, u16, Protocol)>,
) -> Vec<RuleRecord> {
    let mut groups: BTreeMap<(u16, String, u16), ProtocolSet> = BTreeMap::new();
    for (port, host, dest_port, proto) in entries {
        groups
            .entry((port, host, dest_port))
            .and_modify(|set| set.insert(proto))
            .or_insert_with(|| ProtocolSet::single(proto));
    }

    groups
        .into_iter()
        .map(|((port, host, dest_port), protocols)| RuleRecord {
            port,
            host,
            dest_port,
            protocols,
            identity: port.to_string(),
        })
        .collect()
}
