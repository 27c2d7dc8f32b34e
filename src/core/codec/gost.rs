//! Codec for the gost systemd unit file
//!
//! gost keeps its forwarding rules as `-L=` flags on the `ExecStart=` line
//! of its unit file:
//!
//! ```text
//! ExecStart=/opt/gost/gost -L=tcp://:9000/1.1.1.1:9000 -L=udp://:9000/1.1.1.1:9000
//! ```
//!
//! Every other line of the unit file is owned by systemd, not by us, and
//! passes through byte-for-byte. Mutations edit only the flag list: add
//! appends to the end of the line, remove strips the exact flag substrings
//! for a `(port, host)` pair.

use crate::core::error::{Error, Result};
use crate::core::rule::{Protocol, ProtocolSet, RuleRecord, merge_protocol_entries};

pub const BACKEND: &str = "gost";

/// One parsed `-L=` flag, keeping the raw token so removal can strip the
/// exact substring without disturbing surrounding spacing.
struct ForwardFlag<'a> {
    proto: Protocol,
    port: u16,
    host: String,
    dest_port: u16,
    raw: &'a str,
}

fn exec_start_line(document: &str) -> Result<&str> {
    document
        .lines()
        .find(|line| line.starts_with("ExecStart="))
        .ok_or_else(|| Error::Parse {
            backend: BACKEND,
            reason: "no ExecStart= line in unit file".to_string(),
        })
}

/// Scans the flag tokens of an `ExecStart=` line.
///
/// Tokens that are not well-formed `-L=<proto>://:<port>/<dest>` flags are
/// ignored (the binary path and any unrelated gost options live on the same
/// line).
fn parse_flags(line: &str) -> Vec<ForwardFlag<'_>> {
    line.split_whitespace()
        .filter_map(|token| {
            let flag = token.strip_prefix("-L=")?;
            let (proto, rest) = flag.split_once("://:")?;
            let proto = proto.parse::<Protocol>().ok()?;
            let (port, dest) = rest.split_once('/')?;
            let port = port.parse::<u16>().ok()?;
            if dest.is_empty() {
                return None;
            }
            // Destination is host[:port]; without an explicit port the
            // destination port follows the listen port.
            let (host, dest_port) = match dest.rsplit_once(':') {
                Some((host, p)) => match p.parse::<u16>() {
                    Ok(dp) => (host.to_string(), dp),
                    Err(_) => (dest.to_string(), port),
                },
                None => (dest.to_string(), port),
            };
            Some(ForwardFlag {
                proto,
                port,
                host,
                dest_port,
                raw: token,
            })
        })
        .collect()
}

fn flag_text(proto: Protocol, port: u16, host: &str, dest_port: u16) -> String {
    format!("-L={}://:{}/{}:{}", proto.as_str(), port, host, dest_port)
}

/// Decodes the unit file into logical rules, one per `(port, host)` pair
/// with protocols merged, ordered by `(port, host)`.
pub fn decode(document: &str) -> Result<Vec<RuleRecord>> {
    let line = exec_start_line(document)?;
    Ok(merge_protocol_entries(
        parse_flags(line)
            .into_iter()
            .map(|f| (f.port, f.host, f.dest_port, f.proto)),
    ))
}

/// Appends one `-L=` flag per requested protocol to the `ExecStart=` line.
///
/// Rejects the exact same `(port, host)` pair with [`Error::DuplicateRule`]
/// and a port already bound to a different host with [`Error::PortInUse`].
pub fn add(
    document: &str,
    port: u16,
    host: &str,
    dest_port: u16,
    protocols: ProtocolSet,
) -> Result<String> {
    let line = exec_start_line(document)?;
    for flag in parse_flags(line) {
        if flag.port == port {
            if flag.host == host {
                return Err(Error::DuplicateRule);
            }
            return Err(Error::PortInUse(port));
        }
    }

    let mut suffix = String::new();
    for proto in protocols.iter() {
        suffix.push(' ');
        suffix.push_str(&flag_text(proto, port, host, dest_port));
    }

    let new_line = format!("{line}{suffix}");
    Ok(replace_line(document, line, &new_line))
}

/// Removes every flag forwarding `port`, whichever protocols it carries.
pub fn remove(document: &str, port: u16) -> Result<String> {
    let line = exec_start_line(document)?;
    let doomed: Vec<String> = parse_flags(line)
        .into_iter()
        .filter(|f| f.port == port)
        .map(|f| f.raw.to_string())
        .collect();

    if doomed.is_empty() {
        return Err(Error::RuleNotFound(format!("port {port}")));
    }

    let mut new_line = line.to_string();
    for raw in &doomed {
        // Strip the flag together with the space that introduced it,
        // leaving the rest of the line untouched.
        let with_space = format!(" {raw}");
        if new_line.contains(&with_space) {
            new_line = new_line.replacen(&with_space, "", 1);
        } else {
            new_line = new_line.replacen(raw.as_str(), "", 1);
        }
    }

    Ok(replace_line(document, line, &new_line))
}

/// Replaces a single line of the document, preserving everything else.
fn replace_line(document: &str, old_line: &str, new_line: &str) -> String {
    let mut out = String::with_capacity(document.len() + new_line.len());
    let mut replaced = false;
    for (i, line) in document.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if !replaced && line == old_line {
            out.push_str(new_line);
            replaced = true;
        } else {
            out.push_str(line);
        }
    }
    out
}
