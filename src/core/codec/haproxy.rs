//! Codec for the haproxy configuration file
//!
//! Forwarding rules live as paired stanzas appended after the stock
//! `global`/`defaults` sections:
//!
//! ```text
//! frontend tunnel-8443
//!     bind :::8443 v4v6
//!     mode tcp
//!     default_backend tunnel-2.2.2.2-443
//!
//! backend tunnel-2.2.2.2-443
//!     mode tcp
//!     server target_server 2.2.2.2:443
//! ```
//!
//! Mutations only ever touch stanzas carrying the `tunnel-` prefix; every
//! other line passes through untouched. Listing covers all frontends, owned
//! or not, so a foreign binding on a port stays visible. haproxy forwards
//! TCP only.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::core::error::{Error, Result};
use crate::core::rule::{Protocol, ProtocolSet, RuleRecord};

pub const BACKEND: &str = "haproxy";

const RULE_PREFIX: &str = "tunnel-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StanzaKind {
    Frontend,
    Backend,
    Other,
}

/// One top-level stanza: a column-0 header line plus its indented body,
/// bounded by the next column-0 line.
struct Stanza<'a> {
    kind: StanzaKind,
    name: &'a str,
    /// Line span in the original document, header included.
    lines: (usize, usize),
    body: Vec<&'a str>,
}

fn split_stanzas(document: &str) -> Vec<Stanza<'_>> {
    let lines: Vec<&str> = document.lines().collect();
    let mut stanzas = Vec::new();
    let mut current: Option<Stanza<'_>> = None;

    for (idx, line) in lines.iter().enumerate() {
        let is_header = !line.is_empty() && !line.starts_with([' ', '\t']);
        if is_header {
            if let Some(mut s) = current.take() {
                s.lines.1 = idx;
                stanzas.push(s);
            }
            let mut words = line.split_whitespace();
            let keyword = words.next().unwrap_or("");
            let name = words.next().unwrap_or("");
            let kind = match keyword {
                "frontend" => StanzaKind::Frontend,
                "backend" => StanzaKind::Backend,
                _ => StanzaKind::Other,
            };
            current = Some(Stanza {
                kind,
                name,
                lines: (idx, idx + 1),
                body: Vec::new(),
            });
        } else if let Some(s) = current.as_mut() {
            s.lines.1 = idx + 1;
            s.body.push(line);
        }
    }
    if let Some(s) = current.take() {
        stanzas.push(s);
    }
    stanzas
}

/// First value of `keyword` among a stanza's body lines.
fn body_value<'a>(stanza: &Stanza<'a>, keyword: &str) -> Option<&'a str> {
    stanza.body.iter().find_map(|line| {
        let mut words = line.split_whitespace();
        (words.next() == Some(keyword)).then(|| words.next().unwrap_or(""))
    })
}

/// Listen port of a frontend's first `bind` line: whatever follows the
/// last colon, so `:::8443`, `*:8443` and `0.0.0.0:8443` all work.
fn bind_port(stanza: &Stanza<'_>) -> Option<u16> {
    let bind = body_value(stanza, "bind")?;
    bind.rsplit(':').next().and_then(|p| p.parse().ok())
}

/// `server <label> host:port` of a backend stanza.
fn server_target(stanza: &Stanza<'_>) -> Option<(String, u16)> {
    let line = stanza
        .body
        .iter()
        .find(|line| line.split_whitespace().next() == Some("server"))?;
    let addr = line.split_whitespace().nth(2)?;
    let (host, port) = addr.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

/// Decodes the configuration into logical rules, ordered by port, one per
/// frontend whether we own it or not.
///
/// A frontend whose `default_backend` points at a missing stanza still
/// decodes, with an empty destination, so the dangling link stays visible
/// in listings. A tunnel frontend without a usable `bind` is a parse
/// error; a foreign one is skipped, since a port we cannot read cannot
/// collide with anything.
pub fn decode(document: &str) -> Result<Vec<RuleRecord>> {
    let stanzas = split_stanzas(document);
    let backends: HashMap<&str, &Stanza<'_>> = stanzas
        .iter()
        .filter(|s| s.kind == StanzaKind::Backend)
        .map(|s| (s.name, s))
        .collect();

    let mut rules = Vec::new();
    for stanza in stanzas.iter().filter(|s| s.kind == StanzaKind::Frontend) {
        let Some(port) = bind_port(stanza) else {
            if stanza.name.starts_with(RULE_PREFIX) {
                return Err(Error::Parse {
                    backend: BACKEND,
                    reason: format!("frontend {} has no usable bind port", stanza.name),
                });
            }
            continue;
        };
        let (host, dest_port) = body_value(stanza, "default_backend")
            .and_then(|name| backends.get(name))
            .and_then(|backend| server_target(backend))
            .unwrap_or_default();
        rules.push(RuleRecord {
            port,
            host,
            dest_port,
            protocols: ProtocolSet::single(Protocol::Tcp),
            identity: stanza.name.to_string(),
        });
    }
    rules.sort_by_key(|r| r.port);
    Ok(rules)
}

fn frontend_name(port: u16) -> String {
    format!("{RULE_PREFIX}{port}")
}

fn backend_name(host: &str, dest_port: u16) -> String {
    format!("{RULE_PREFIX}{host}-{dest_port}")
}

/// Appends a frontend/backend stanza pair for the new rule.
///
/// A backend stanza for the same `(host, dest_port)` pair is reused rather
/// than duplicated; only the frontend is added then.
pub fn add(document: &str, port: u16, host: &str, dest_port: u16) -> Result<String> {
    for rule in decode(document)? {
        if rule.port == port {
            return Err(Error::PortInUse(port));
        }
    }

    let backend = backend_name(host, dest_port);
    let backend_exists = split_stanzas(document)
        .iter()
        .any(|s| s.kind == StanzaKind::Backend && s.name == backend);

    let mut out = document.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    let _ = write!(
        out,
        "\nfrontend {front}\n    bind :::{port} v4v6\n    mode tcp\n    default_backend {backend}\n",
        front = frontend_name(port),
    );
    if !backend_exists {
        let _ = write!(
            out,
            "\nbackend {backend}\n    mode tcp\n    server target_server {host}:{dest_port}\n",
        );
    }
    Ok(out)
}

/// Removes the frontend stanza called `name` and its backend stanza, unless
/// another frontend still points at that backend.
pub fn remove(document: &str, name: &str) -> Result<String> {
    let stanzas = split_stanzas(document);
    let frontend = stanzas
        .iter()
        .find(|s| s.kind == StanzaKind::Frontend && s.name == name)
        .ok_or_else(|| Error::RuleNotFound(name.to_string()))?;

    let backend = body_value(frontend, "default_backend").ok_or_else(|| Error::Parse {
        backend: BACKEND,
        reason: format!("frontend {name} has no default_backend line"),
    })?;
    let backend_stanza = stanzas
        .iter()
        .find(|s| s.kind == StanzaKind::Backend && s.name == backend)
        .ok_or_else(|| Error::BackendNotFound(backend.to_string()))?;

    let still_referenced = stanzas
        .iter()
        .filter(|s| s.kind == StanzaKind::Frontend && s.name != name)
        .any(|s| body_value(s, "default_backend") == Some(backend));

    let mut doomed: Vec<(usize, usize)> = vec![frontend.lines];
    if !still_referenced {
        doomed.push(backend_stanza.lines);
    }

    let lines: Vec<&str> = document.lines().collect();
    let mut kept: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(idx, _)| !doomed.iter().any(|(start, end)| (*start..*end).contains(idx)))
        .map(|(_, line)| *line)
        .collect();

    // A stanza's span already covers the blank lines trailing it, so
    // splicing the doomed spans out leaves every kept line verbatim. Only
    // a stanza deleted at the end of the file strands the separator blank
    // line above it; drop that.
    if doomed.iter().any(|&(_, end)| end >= lines.len()) {
        while kept.last().is_some_and(|l| l.trim().is_empty()) {
            kept.pop();
        }
    }
    let mut out = String::with_capacity(document.len());
    for line in kept {
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}
