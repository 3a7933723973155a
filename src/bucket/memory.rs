//! In-memory bucket used by unit and pipeline tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::Bucket;
use crate::errors::GitError;

/// DashMap-backed bucket. Durability is trivially immediate; useful wherever
/// the engine is exercised without real storage.
#[derive(Debug, Default)]
pub struct MemBucket {
    entries: DashMap<String, Bytes>,
}

impl MemBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Bucket for MemBucket {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GitError> {
        self.entries.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, GitError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, GitError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), GitError> {
        self.entries.remove(key);
        Ok(())
    }
}
