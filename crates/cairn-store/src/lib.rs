//! Document store adapter and multi-document transactions for Cairn.
//!
//! This crate provides the storage layer: the `DocumentStore` trait offering
//! single-document conditional writes plus a capped, append-only change log;
//! two backends (`MemoryStore` for in-process use and `FileStore`, a
//! directory-backed store shared between processes through file locks); and
//! the transaction `Runner`, which synthesizes all-or-nothing updates across
//! documents on top of those single-document primitives.

pub mod backend;
pub mod document;
pub mod fault;
pub mod file;
pub mod layout;
pub mod memory;
pub mod txn;

pub use backend::{ChangeEntry, DocumentStore, Expect, LogRead, DEFAULT_LOG_CAPACITY};
pub use document::{Document, Fields};
pub use fault::FaultyStore;
pub use file::FileStore;
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use memory::MemoryStore;
pub use txn::{Assert, Change, FieldOp, Op, Runner, TxnError, TxnRecord, TxnState, TXNS};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("integrity check failed for document '{id}' in '{collection}'")]
    IntegrityFailure { collection: String, id: String },
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid collection name: {0}")]
    InvalidCollection(String),
}

impl StoreError {
    /// Whether the failure is a connectivity problem worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Unavailable(_) | StoreError::LockFailed(_)
        )
    }
}

/// Collection names become directory names in the file backend, so keep
/// them to a conservative alphabet.
pub(crate) fn validate_collection(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || name.len() > 64
        || name.starts_with('.')
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(StoreError::InvalidCollection(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(StoreError::Unavailable("down".to_owned()).is_transient());
        assert!(StoreError::Io(std::io::Error::other("x")).is_transient());
        assert!(!StoreError::InvalidCollection("x".to_owned()).is_transient());
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            collection: "units".to_owned(),
            id: "wordpress/0".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("units"));
        assert!(msg.contains("wordpress/0"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 2,
            found: 1,
        };
        let msg = e.to_string();
        assert!(msg.contains('2'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn collection_names() {
        assert!(validate_collection("units").is_ok());
        assert!(validate_collection("txns.log").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("../etc").is_err());
        assert!(validate_collection("a/b").is_err());
        assert!(validate_collection("..").is_err());
    }
}
