//! Durable backing stores for the pewter provisioning engine.
//!
//! This crate provides the persistence layer: a per-prefix key-value
//! [`Backing`] contract with a file-backed implementation (atomic
//! writes via tempfile + rename + dir fsync), an in-memory variant for
//! tests, the [`SecretsStore`] for per-object key material, the on-disk
//! [`StoreLayout`], and an advisory [`StoreLock`] so only one engine
//! process owns a store root at a time.

pub mod file;
pub mod layout;
pub mod lock;
pub mod memory;
pub mod secrets;

pub use file::{Backing, FileStore};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::StoreLock;
pub use memory::MemoryStore;
pub use secrets::SecretsStore;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee rename durability without fsyncing the
/// parent directory, even on filesystems where it usually holds.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{prefix}:{key} not found")]
    NotFound { prefix: String, key: String },
    #[error("{prefix}:{key} already exists")]
    AlreadyExists { prefix: String, key: String },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("store lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("write rejected: {0}")]
    WriteFailed(String),
}

impl StoreError {
    pub fn not_found(prefix: &str, key: &str) -> Self {
        Self::NotFound {
            prefix: prefix.to_owned(),
            key: key.to_owned(),
        }
    }

    pub fn already_exists(prefix: &str, key: &str) -> Self {
        Self::AlreadyExists {
            prefix: prefix.to_owned(),
            key: key.to_owned(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Reject keys that would escape a prefix directory or hide as dot
/// files.
pub(crate) fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("empty key".to_owned()));
    }
    if key.contains('/') || key.contains('\\') || key.starts_with('.') {
        return Err(StoreError::InvalidKey(key.to_owned()));
    }
    Ok(())
}
