use std::path::PathBuf;
use thiserror::Error;

/// Core error types for portshift
#[derive(Debug, Error)]
pub enum Error {
    /// Backend document does not exist. Status treats this as an empty rule
    /// list; mutations treat it as fatal.
    #[error("configuration file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// Document is present but structurally unrecognizable. No mutation is
    /// attempted on a document that fails to decode.
    #[error("{backend} configuration is malformed: {reason}")]
    Parse {
        backend: &'static str,
        reason: String,
    },

    /// Add rejected: another rule already binds this port.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// Add rejected: this exact rule already exists.
    #[error("this exact rule already exists")]
    DuplicateRule,

    /// Remove rejected: no rule matches the given key.
    #[error("no rule found for {0}")]
    RuleNotFound(String),

    /// Remove rejected: the frontend's backend link is dangling.
    #[error("backend '{0}' not found")]
    BackendNotFound(String),

    /// The document changed between read and write; nothing was written.
    #[error("document was modified by another process; no changes written")]
    ConcurrentModification,

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// systemctl / iptables invocation failed
    #[error("service control failed for {unit}: {message}")]
    ServiceControl { unit: String, message: String },

    /// Privilege escalation failed
    #[error("elevation error: {0}")]
    Elevation(String),

    /// Input validation failed
    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that mean "the document simply is not there".
    ///
    /// The status aggregator uses this to render an absent backend as an
    /// empty rule list instead of a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ConfigNotFound(_))
    }
}
