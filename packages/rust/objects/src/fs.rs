//! Directory-backed object store.
//!
//! Layout on disk: `{root}/{bucket}/{key}`. Writes go to a temp file in the
//! destination directory and are renamed into place, so readers never see a
//! half-written object.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use ledgerflow_shared::{LedgerflowError, Result};

use crate::{ObjectMeta, ObjectStore, validate_key};

/// Marker in temp file names; such files are never listed.
const TMP_MARKER: &str = ".lf-tmp-";

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        validate_key(bucket)?;
        if bucket.contains('/') {
            return Err(LedgerflowError::validation(format!(
                "bucket name must not contain '/': {bucket}"
            )));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let mut path = self.bucket_dir(bucket)?;
        for seg in key.split('/').filter(|s| !s.is_empty()) {
            path.push(seg);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerflowError::io(parent, e))?;
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LedgerflowError::validation(format!("invalid object key: {key}")))?;
        let tmp = path.with_file_name(format!("{file_name}{TMP_MARKER}{}", Uuid::now_v7()));

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| LedgerflowError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(LedgerflowError::io(&path, e));
        }

        debug!(bucket, key, size = bytes.len(), "object stored");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(LedgerflowError::not_found(format!("object {bucket}/{key}")))
            }
            Err(e) => Err(LedgerflowError::io(&path, e)),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let base = self.bucket_dir(bucket)?;
        if !tokio::fs::try_exists(&base)
            .await
            .map_err(|e| LedgerflowError::io(&base, e))?
        {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        let mut pending: Vec<(PathBuf, String)> = vec![(base, String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| LedgerflowError::io(&dir, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| LedgerflowError::io(&dir, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| LedgerflowError::io(entry.path(), e))?;

                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if file_type.is_file() && !name.contains(TMP_MARKER) && key.starts_with(prefix) {
                    let size = entry
                        .metadata()
                        .await
                        .map_err(|e| LedgerflowError::io(entry.path(), e))?
                        .len();
                    objects.push(ObjectMeta { key, size });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}
