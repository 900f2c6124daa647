//! In-process object store, used by tests and by dry runs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use ledgerflow_shared::{LedgerflowError, Result};

use crate::{ObjectMeta, ObjectStore, validate_key};

/// Object store backed by a map, with a running count of writes.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls since creation.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), Vec<u8>>>> {
        self.objects
            .lock()
            .map_err(|_| LedgerflowError::Storage("object map lock poisoned".into()))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.lock()?
            .insert((bucket.to_string(), key.to_string()), bytes.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.lock()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| LedgerflowError::not_found(format!("object {bucket}/{key}")))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), v)| ObjectMeta {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }
}
