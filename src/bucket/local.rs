//! Filesystem-backed bucket for single-node deployments and integration
//! tests: keys map to paths under a root directory, writes go through a
//! temp-file rename so a crashed put never leaves a half-written segment.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use super::Bucket;
use crate::errors::GitError;

/// A bucket rooted at a local directory.
pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, GitError> {
        // Keys are forward-slash scoped; refuse anything that would escape
        // the root.
        if key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(GitError::Bucket(format!("invalid bucket key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|rel| rel.components().fold(String::new(), |mut acc, c| {
                if !acc.is_empty() {
                    acc.push('/');
                }
                acc.push_str(&c.as_os_str().to_string_lossy());
                acc
            }))
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GitError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp-write");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, GitError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GitError::IOError(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(GitError::IOError(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) && !key.ends_with(".tmp-write") {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), GitError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GitError::IOError(e)),
        }
    }
}
