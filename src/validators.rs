//! Input validation and sanitization
//!
//! Centralized validation for user inputs shared by the CLI and the codec
//! layer. Hosts feed elevated `iptables` invocations and hand-written
//! config stanzas, so only a conservative character set is accepted.

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a destination host: an IPv4 address or a hostname.
///
/// # Errors
///
/// Returns `Err` if:
/// - the host is empty or longer than 253 bytes
/// - it contains characters outside `[A-Za-z0-9.-]`
/// - a label starts or ends with `-`, or is empty
pub fn validate_host(host: &str) -> Result<&str, String> {
    if host.is_empty() {
        return Err("Host must not be empty".to_string());
    }
    if host.len() > 253 {
        return Err("Host too long (max 253 characters)".to_string());
    }
    // ASCII-only to keep elevated command arguments unambiguous.
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
    {
        return Err(format!("Host '{host}' contains invalid characters"));
    }
    for label in host.split('.') {
        if label.is_empty() {
            return Err(format!("Host '{host}' has an empty label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("Host '{host}' has a label starting or ending with '-'"));
        }
    }
    Ok(host)
}

/// Parses a comma-separated port list (`80,443,8080`).
///
/// # Errors
///
/// Returns `Err` if the list is empty, a port fails [`validate_port`], or
/// a port repeats.
pub fn validate_port_list(input: &str) -> Result<Vec<u16>, String> {
    let mut ports = Vec::new();
    for word in input.split(',') {
        let word = word.trim();
        if word.is_empty() {
            continue;
        }
        let port: u16 = word
            .parse()
            .map_err(|_| format!("Invalid port '{word}' (expected 1-65535)"))?;
        validate_port(port)?;
        if ports.contains(&port) {
            return Err(format!("Duplicate port {port} in list"));
        }
        ports.push(port);
    }
    if ports.is_empty() {
        return Err("Port list must contain at least one port".to_string());
    }
    Ok(ports)
}
