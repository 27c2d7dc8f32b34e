//! Codec for kernel NAT rules
//!
//! Unlike the file-backed backends, iptables rules live in the kernel and
//! are observed through `iptables-save` output:
//!
//! ```text
//! -A PREROUTING -p tcp -m multiport --dports 80,443 -j DNAT --to-destination 1.1.1.1
//! ```
//!
//! Decoding is lenient: the dump is machine generated, so lines that do not
//! carry a complete DNAT forward are skipped rather than rejected. Mutation
//! happens through directives handed to the NAT table collaborator, never
//! by rewriting the dump text.

use crate::core::rule::{Protocol, RuleRecord, merge_protocol_entries};

pub const BACKEND: &str = "iptables";

/// One argument vector for the `iptables` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDirective(pub Vec<String>);

impl NatDirective {
    fn new(args: &[&str]) -> Self {
        Self(args.iter().map(ToString::to_string).collect())
    }
}

fn token_after<'a>(tokens: &[&'a str], flag: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == flag)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

/// Extracts DNAT forwards from `iptables-save` output, expanding each
/// multiport group to one record per port and merging tcp/udp twins.
pub fn decode(dump: &str) -> Vec<RuleRecord> {
    let mut entries: Vec<(u16, String, u16, Protocol)> = Vec::new();
    for line in dump.lines() {
        if !(line.contains("-A PREROUTING") && line.contains("-j DNAT")) {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(proto) = token_after(&tokens, "-p").and_then(|p| p.parse::<Protocol>().ok())
        else {
            continue;
        };
        let Some(dest) = token_after(&tokens, "--to-destination") else {
            continue;
        };
        let Some(dports) = token_after(&tokens, "--dports") else {
            continue;
        };
        // A destination of the form host:port overrides the listen port.
        let (host, dest_override) = match dest.rsplit_once(':') {
            Some((host, p)) => (host, p.parse::<u16>().ok()),
            None => (dest, None),
        };
        for port in dports.split(',').filter_map(|p| p.trim().parse::<u16>().ok()) {
            entries.push((port, host.to_string(), dest_override.unwrap_or(port), proto));
        }
    }
    merge_protocol_entries(entries)
}

/// The four directives one forward installs: MASQUERADE in POSTROUTING and
/// DNAT in PREROUTING, once per protocol.
pub fn add_directives(ports: &[u16], host: &str) -> Vec<NatDirective> {
    let csv = ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let mut out = Vec::with_capacity(4);
    for proto in [Protocol::Tcp, Protocol::Udp] {
        out.push(NatDirective::new(&[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-p",
            proto.as_str(),
            "--match",
            "multiport",
            "--dports",
            &csv,
            "-j",
            "MASQUERADE",
        ]));
        out.push(NatDirective::new(&[
            "-t",
            "nat",
            "-A",
            "PREROUTING",
            "-p",
            proto.as_str(),
            "--match",
            "multiport",
            "--dports",
            &csv,
            "-j",
            "DNAT",
            "--to-destination",
            host,
        ]));
    }
    out
}

/// Full teardown: flush and delete chains in the filter and nat tables.
/// There is no per-rule removal; the dump carries no stable rule identity.
pub fn flush_directives() -> Vec<NatDirective> {
    vec![
        NatDirective::new(&["-F"]),
        NatDirective::new(&["-X"]),
        NatDirective::new(&["-t", "nat", "-F"]),
        NatDirective::new(&["-t", "nat", "-X"]),
    ]
}
