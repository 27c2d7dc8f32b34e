//! Document persistence with an optimistic concurrency guard.
//!
//! Every mutation is a read-modify-write of one backend document. The store
//! hands back the raw text plus its SHA-256 digest at read time; the write
//! re-checks that digest against what is on disk and refuses to clobber a
//! document something else edited in between.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::core::error::{Error, Result};

/// SHA-256 of a document, rendered as lowercase hex.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A document read together with the digest the write guard checks against.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub text: String,
    pub digest: String,
}

/// File access seam for the registry. Tests swap in an in-memory
/// implementation; production uses [`FsStore`].
#[allow(async_fn_in_trait)]
pub trait DocumentStore {
    /// Reads a document, or [`Error::ConfigNotFound`] when it is absent.
    async fn read(&self, path: &Path) -> Result<Snapshot>;

    /// Writes a document atomically. When `expected_digest` is given, the
    /// write fails with [`Error::ConcurrentModification`] if the on-disk
    /// content no longer hashes to it.
    async fn write(&self, path: &Path, text: &str, expected_digest: Option<&str>) -> Result<()>;

    /// Deletes a document; absence is not an error.
    async fn remove(&self, path: &Path) -> Result<()>;
}

/// Real filesystem store. Writes go through a temp file in the target
/// directory followed by a rename, so a crash mid-write never leaves a
/// half-written unit file or proxy config behind.
#[derive(Debug, Clone, Default)]
pub struct FsStore;

impl FsStore {
    fn persist(path: &Path, text: &str) -> Result<()> {
        let dir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut temp = NamedTempFile::new_in(&dir)?;
        temp.write_all(text.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl DocumentStore for FsStore {
    async fn read(&self, path: &Path) -> Result<Snapshot> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let digest = content_hash(&text);
                Ok(Snapshot { text, digest })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ConfigNotFound(path.to_path_buf()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write(&self, path: &Path, text: &str, expected_digest: Option<&str>) -> Result<()> {
        if let Some(expected) = expected_digest {
            let current = tokio::fs::read_to_string(path).await.ok();
            if let Some(current) = current
                && content_hash(&current) != expected
            {
                tracing::warn!(path = %path.display(), "document changed mid-transaction");
                return Err(Error::ConcurrentModification);
            }
        }
        let path = path.to_path_buf();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || Self::persist(&path, &text))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
