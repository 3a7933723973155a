//! The shared blob bucket: durable, append-only home of Parquet segments,
//! tombstones, large-object side blobs, and the persisted ref-log tail. All
//! repositories share one bucket; every key is scoped under the repository
//! prefix so list and delete stay per-repo.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{errors::GitError, hash::ObjectHash};

/// Minimal object-bucket surface the engine needs. Implementations must make
/// `put` durable before returning: a flush or compaction treats the returned
/// `Ok` as its commit point.
#[async_trait]
pub trait Bucket: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GitError>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>, GitError>;
    /// Keys under `prefix`, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, GitError>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), GitError>;
}

/// Key layout for one repository's slice of the bucket.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    prefix: String,
}

impl RepoPaths {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            prefix: repo.into(),
        }
    }

    pub fn repo(&self) -> &str {
        &self.prefix
    }

    /// `<repo>/objects/<uuid>.parquet`. The uuid is v7 so keys sort by
    /// creation time; the read path walks them newest-first.
    pub fn new_segment_key(&self) -> String {
        format!("{}/objects/{}.parquet", self.prefix, uuid::Uuid::now_v7())
    }

    pub fn segment_prefix(&self) -> String {
        format!("{}/objects/", self.prefix)
    }

    /// `<repo>/objects/tombstones/<uuid>.parquet`
    pub fn new_tombstone_key(&self) -> String {
        format!(
            "{}/objects/tombstones/{}.parquet",
            self.prefix,
            uuid::Uuid::now_v7()
        )
    }

    pub fn tombstone_prefix(&self) -> String {
        format!("{}/objects/tombstones/", self.prefix)
    }

    /// Whether a key under the segment prefix is a tombstone rather than a
    /// live segment. `list(segment_prefix)` returns both.
    pub fn is_tombstone_key(&self, key: &str) -> bool {
        key.starts_with(&self.tombstone_prefix())
    }

    /// `<repo>/large/<sha>`
    pub fn large_object_key(&self, id: &ObjectHash) -> String {
        format!("{}/large/{id}", self.prefix)
    }

    /// `<repo>/refs/<version>.parquet`
    pub fn ref_log_key(&self, version: u64) -> String {
        format!("{}/refs/{version:020}.parquet", self.prefix)
    }

    pub fn ref_log_prefix(&self) -> String {
        format!("{}/refs/", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Segment keys are repo-scoped and unique; tombstones are recognizable.
    #[test]
    fn test_key_layout() {
        let paths = RepoPaths::new("acme/widgets");
        let a = paths.new_segment_key();
        let b = paths.new_segment_key();
        assert!(a.starts_with("acme/widgets/objects/"));
        assert!(a.ends_with(".parquet"));
        assert_ne!(a, b);

        let t = paths.new_tombstone_key();
        assert!(paths.is_tombstone_key(&t));
        assert!(!paths.is_tombstone_key(&a));
        assert!(t.starts_with(&paths.segment_prefix()));
    }

    /// Ref-log keys order lexicographically by version.
    #[test]
    fn test_ref_log_key_ordering() {
        let paths = RepoPaths::new("r");
        assert!(paths.ref_log_key(2) < paths.ref_log_key(10));
    }

    /// Large-object keys embed the object id.
    #[test]
    fn test_large_object_key() {
        let paths = RepoPaths::new("r");
        let id = ObjectHash::new(b"x");
        assert_eq!(paths.large_object_key(&id), format!("r/large/{id}"));
    }
}
