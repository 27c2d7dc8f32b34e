//! Core rule management functionality
//!
//! - [`rule`]: The uniform rule model the backends decode into
//! - [`codec`]: Per-backend document codecs
//! - [`registry`]: Transactional mutations over the backend documents
//! - [`status`]: Aggregated unit-state and rule reporting
//! - [`error`]: Error types for registry operations

pub mod codec;
pub mod error;
pub mod registry;
pub mod rule;
pub mod status;

#[cfg(test)]
pub mod test_helpers;
