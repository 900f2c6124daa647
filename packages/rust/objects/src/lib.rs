//! Object store collaborator: blob storage keyed by `bucket` + `key`.
//!
//! This crate provides:
//! - [`ObjectStore`]: the put/get/list interface every stage consumes
//! - [`FsObjectStore`]: a directory-backed store (one sub-directory per bucket)
//! - [`MemoryObjectStore`]: an in-process store that counts writes
//! - [`layout`]: the deterministic key layout for raw, transformed and scored artifacts

pub mod fs;
pub mod layout;
pub mod memory;

use async_trait::async_trait;

use ledgerflow_shared::{LedgerflowError, Result};

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

/// A listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full key within the bucket, `/`-separated.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
}

/// Hierarchical key-value blob store.
///
/// Writes of the same bytes to the same key must be idempotent; stages rely on
/// that to redo a unit whose ledger commit was lost.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `key`, replacing any existing object.
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the object at `key`. Missing objects are [`LedgerflowError::NotFound`].
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// List objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

/// Reject keys that could escape the bucket or are otherwise unusable.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(LedgerflowError::validation("object key must not be empty"));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(LedgerflowError::validation(format!(
            "object key must be relative and '/'-separated: {key}"
        )));
    }
    if key.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(LedgerflowError::validation(format!(
            "object key must not contain relative segments: {key}"
        )));
    }
    Ok(())
}
