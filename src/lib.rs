//! portshift - port forwarding rule registry
//!
//! Manages forwarding rules across four backends, each persisting rules in
//! its own on-disk format:
//!
//! - [`core::codec::gost`] - `-L=` flags on a systemd unit's `ExecStart=` line
//! - [`core::codec::haproxy`] - frontend/backend stanza pairs
//! - [`core::codec::xray`] - `dokodemo-door` inbounds in a JSON config
//! - [`core::codec::iptables`] - DNAT/MASQUERADE rules in the kernel NAT table
//!
//! # Architecture
//!
//! - [`core`] - Rule model, codecs, the transactional registry and status
//! - [`store`] - Atomic document persistence with a SHA-256 write guard
//! - [`service`] - systemd and NAT table collaborators
//! - [`elevation`] - Privilege escalation for whitelisted binaries
//! - [`audit`] - JSON-lines audit log of privileged mutations
//! - [`validators`] - Input validation shared by CLI and codecs
//!
//! # Safety Features
//!
//! - Every mutation re-decodes the live document; nothing is cached
//! - SHA-256 compare-and-swap rejects concurrent edits
//! - Atomic writes (temp file + rename) for every document
//! - Foreign content in each document passes through byte-for-byte

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod service;
pub mod store;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use self::core::error::{Error, Result};
pub use self::core::registry::{AddRequest, Backend, MutationOutcome, Registry, RemoveKey};
pub use self::core::rule::{Protocol, ProtocolSet, RuleRecord};
pub use self::core::status::{BackendStatus, StatusAggregator};
