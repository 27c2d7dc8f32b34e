//! Per-backend codecs: decode a persisted document into [`RuleRecord`]s and
//! re-encode mutations while preserving everything the rules do not own.
//!
//! [`RuleRecord`]: crate::core::rule::RuleRecord

pub mod gost;
pub mod haproxy;
pub mod iptables;
pub mod xray;
