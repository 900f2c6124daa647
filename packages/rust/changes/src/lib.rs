//! Content hashing and batch-level change detection.
//!
//! Two independent dedup layers live on top of [`digest`]:
//! - the ledger uses the digest of a unit's bytes as its identity key;
//! - the batch detector in [`batch`] keeps a name → digest side file and
//!   answers the coarser question "has anything in this batch changed?".

pub mod batch;

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use ledgerflow_shared::{LedgerflowError, Result};

pub use batch::{BatchCheck, BatchDecision, BatchDiff, ChangeDigest, check_batch, diff_digests, should_reprocess};

/// Length of a hex digest produced by [`digest`].
pub const DIGEST_HEX_LEN: usize = 64;

/// SHA-256 of `bytes` as lowercase hex.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a file's contents, streamed in fixed-size chunks.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| LedgerflowError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| LedgerflowError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether `s` looks like a digest produced by this crate.
pub fn is_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
