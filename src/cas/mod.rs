//! The content-addressed store: an in-memory write buffer with a WAL in
//! front of append-only Parquet segments in the shared bucket, fronted by a
//! bloom filter, an exact sha table, and an LRU read cache.
//!
//! Locking follows the single-writer model: `get`/`has`/`put`/`flush` take
//! the segment-index read lock, `compact` takes the write lock so no segment
//! disappears mid-read, and a dedicated mutex serializes flushes.

pub mod bloom;
pub mod buffer;
pub mod compaction;
pub mod segment;

use std::collections::HashSet;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use lru_mem::LruCache;
use tokio::sync::mpsc;

use crate::{
    bucket::{Bucket, RepoPaths},
    config::StoreConfig,
    errors::GitError,
    hash::ObjectHash,
    internal::{
        object::{types::ObjectType, verify_object},
        pack::decode::DeltaBaseResolver,
    },
    scratchpad::Scratchpad,
};

use self::bloom::BloomCache;
use self::buffer::{FlushEvent, WriteBuffer};
use self::segment::SegmentRow;

/// Segment membership as seen by readers. Keys sort by creation time (v7
/// uuids), held newest-first.
#[derive(Default)]
struct SegmentIndex {
    segments: Vec<String>,
    tombstone_keys: Vec<String>,
    tombstoned: HashSet<String>,
}

/// Content-addressed object store for one repository.
pub struct CasStore {
    scratchpad: Scratchpad,
    bucket: Arc<dyn Bucket>,
    paths: RepoPaths,
    config: StoreConfig,
    bloom: BloomCache,
    buffer: WriteBuffer,
    index: tokio::sync::RwLock<SegmentIndex>,
    flush_lock: tokio::sync::Mutex<()>,
    read_cache: Mutex<LruCache<String, Vec<u8>>>,
    flush_armed: AtomicBool,
    flush_tx: Mutex<Option<mpsc::UnboundedSender<FlushEvent>>>,
}

impl CasStore {
    /// Build the store and restore durable state: finish or roll back any
    /// interrupted compaction, reload the segment index and tombstones,
    /// replay the WAL, and flush whatever the crash left buffered.
    pub async fn open(
        scratchpad: Scratchpad,
        bucket: Arc<dyn Bucket>,
        paths: RepoPaths,
        config: StoreConfig,
    ) -> Result<Arc<Self>, GitError> {
        let bloom = BloomCache::load(scratchpad.clone(), config.bloom.clone()).await?;
        let buffer = WriteBuffer::new(scratchpad.clone(), config.buffer.clone());
        let store = Arc::new(Self {
            scratchpad,
            bucket,
            paths,
            read_cache: Mutex::new(LruCache::new(config.segment.read_cache_bytes)),
            config,
            bloom,
            buffer,
            index: tokio::sync::RwLock::new(SegmentIndex::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_armed: AtomicBool::new(false),
            flush_tx: Mutex::new(None),
        });
        store.recover().await?;
        Ok(store)
    }

    /// Register the flush-event subscriber.
    pub fn subscribe_flushes(&self) -> mpsc::UnboundedReceiver<FlushEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.flush_tx.lock().expect("flush tx lock poisoned") = Some(tx);
        rx
    }

    pub fn paths(&self) -> &RepoPaths {
        &self.paths
    }

    async fn recover(&self) -> Result<(), GitError> {
        self.recover_compaction().await?;
        self.reload_index().await?;

        // WAL replay: acknowledged writes must survive the restart.
        let rows = self.buffer.replay_wal().await?;
        for row in &rows {
            let id: ObjectHash = row.sha.parse().map_err(GitError::InvalidHashValue)?;
            let obj_type = ObjectType::from_string(&row.otype)?;
            if let Some(path) = &row.path {
                if let Some(body) = self.bucket.get(path).await? {
                    self.buffer.prime_body(&id, body.to_vec());
                }
                self.bloom.add(&id, obj_type, 0).await?;
            } else {
                self.bloom.add(&id, obj_type, row.body.len()).await?;
            }
        }

        if self.bloom.needs_rebuild() {
            self.rebuild_bloom().await?;
        }

        if !self.buffer.is_empty() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Finish or roll back interrupted compactions before trusting the
    /// bucket listing.
    async fn recover_compaction(&self) -> Result<(), GitError> {
        for row in compaction::pending_journals(&self.scratchpad).await? {
            let sources = compaction::journal_sources(&row)?;
            match row.status.as_str() {
                crate::scratchpad::entity::compaction_journal::STATUS_IN_PROGRESS => {
                    // Target may be partial or missing; sources are intact.
                    tracing::warn!(target = %row.target_key, "rolling back interrupted compaction");
                    self.bucket.delete(&row.target_key).await?;
                }
                crate::scratchpad::entity::compaction_journal::STATUS_WRITTEN => {
                    // Target is durable; resume by deleting the sources.
                    tracing::warn!(target = %row.target_key, "resuming compaction source cleanup");
                    for key in &sources {
                        self.bucket.delete(key).await?;
                    }
                }
                _ => {}
            }
            compaction::journal_finish(&self.scratchpad, &row.id).await?;
        }
        Ok(())
    }

    async fn reload_index(&self) -> Result<(), GitError> {
        let all = self.bucket.list(&self.paths.segment_prefix()).await?;
        let mut segments = Vec::new();
        let mut tombstone_keys = Vec::new();
        for key in all {
            if self.paths.is_tombstone_key(&key) {
                tombstone_keys.push(key);
            } else {
                segments.push(key);
            }
        }
        segments.sort_by(|a, b| b.cmp(a)); // newest-first

        let mut tombstoned = HashSet::new();
        for key in &tombstone_keys {
            if let Some(bytes) = self.bucket.get(key).await? {
                tombstoned.extend(segment::read_tombstones(&bytes)?);
            }
        }

        let mut index = self.index.write().await;
        index.segments = segments;
        index.tombstone_keys = tombstone_keys;
        index.tombstoned = tombstoned;
        Ok(())
    }

    async fn rebuild_bloom(&self) -> Result<(), GitError> {
        let keys = {
            let index = self.index.read().await;
            index.segments.clone()
        };
        let mut ids: Vec<ObjectHash> = Vec::new();
        for key in keys {
            if let Some(bytes) = self.bucket.get(&key).await? {
                for sha in segment::list_shas(&bytes)? {
                    ids.push(sha.parse().map_err(GitError::InvalidHashValue)?);
                }
            }
        }
        for (id, _) in self.buffer.snapshot() {
            ids.push(id);
        }
        tracing::debug!(items = ids.len(), "rebuilding bloom filter from segments");
        self.bloom.rebuild(ids).await
    }

    /// Store an object. Re-putting an existing body is a no-op thanks to
    /// content addressing; a put of a tombstoned id resurrects it.
    pub async fn put(&self, obj_type: ObjectType, body: Vec<u8>) -> Result<ObjectHash, GitError> {
        let id = ObjectHash::from_type_and_data(obj_type, &body);

        {
            let index = self.index.read().await;
            if index.tombstoned.contains(&id.to_string()) {
                drop(index);
                self.untombstone(&id).await?;
            }
        }

        if self.buffer.contains(&id) || self.bloom.definitely_exists(&id).await? {
            return Ok(id);
        }

        let large_path = if body.len() >= self.config.segment.inline_threshold {
            let key = self.paths.large_object_key(&id);
            self.bucket.put(&key, Bytes::from(body.clone())).await?;
            Some(key)
        } else {
            None
        };

        let size = body.len();
        self.buffer.stage(id, obj_type, body, large_path).await?;
        self.bloom.add(&id, obj_type, size).await?;

        if self.buffer.over_hard_cap() {
            self.flush().await?;
            if self.buffer.over_hard_cap() {
                return Err(GitError::BufferOverflow(format!(
                    "buffer still over cap after flush ({} objects, {} bytes)",
                    self.buffer.len(),
                    self.buffer.buffered_bytes()
                )));
            }
        } else if self.buffer.over_flush_threshold() {
            self.flush_armed.store(true, Ordering::Relaxed);
        }

        Ok(id)
    }

    /// Whether an async flush has been armed by the lower thresholds; reading
    /// clears the flag.
    pub fn take_flush_armed(&self) -> bool {
        self.flush_armed.swap(false, Ordering::Relaxed)
    }

    /// Existence check: buffer, then exact table, then bloom + segments.
    pub async fn has(&self, id: &ObjectHash) -> Result<bool, GitError> {
        if self.buffer.contains(id) || self.bloom.definitely_exists(id).await? {
            let index = self.index.read().await;
            return Ok(!index.tombstoned.contains(&id.to_string()));
        }
        if !self.bloom.may_exist(id) && !self.bloom.verify_negatives() {
            return Ok(false);
        }
        Ok(self.get(id).await?.is_some())
    }

    /// Fetch an object: write buffer, LRU cache, then segments newest-first
    /// with row-group pruning, indirecting through the side blob for large
    /// rows. Verifies integrity on every segment read.
    pub async fn get(&self, id: &ObjectHash) -> Result<Option<(ObjectType, Vec<u8>)>, GitError> {
        if let Some(obj) = self.buffer.get(id) {
            return Ok(Some((obj.obj_type, obj.body)));
        }

        let key = id.to_string();
        if let Some(cached) = self
            .read_cache
            .lock()
            .expect("read cache lock poisoned")
            .get(&key)
        {
            let obj_type = ObjectType::from_u8(cached[0])?;
            return Ok(Some((obj_type, cached[1..].to_vec())));
        }

        if !self.bloom.may_exist(id)
            && !self.bloom.definitely_exists(id).await?
            && !self.bloom.verify_negatives()
        {
            return Ok(None);
        }

        // Hold the read lock across the scan so compaction cannot delete a
        // segment from under the point queries.
        let found = {
            let index = self.index.read().await;
            if index.tombstoned.contains(&key) {
                return Ok(None);
            }
            let mut found = None;
            for seg_key in &index.segments {
                let Some(bytes) = self.bucket.get(seg_key).await? else {
                    continue;
                };
                if let Some(row) = segment::point_query(&bytes, &key)? {
                    found = Some(row);
                    break;
                }
            }
            found
        };
        let Some(row) = found else {
            return Ok(None);
        };

        let obj_type = ObjectType::from_string(&row.otype)?;
        let body = match row.data {
            Some(data) => data,
            None => {
                let blob_key = self.paths.large_object_key(id);
                self.bucket
                    .get(&blob_key)
                    .await?
                    .map(|b| b.to_vec())
                    .ok_or_else(|| GitError::ObjectNotFound(format!("side blob {blob_key}")))?
            }
        };

        verify_object(*id, obj_type, &body)?;

        if !self.bloom.may_exist(id) {
            // A persisted-filter corruption; heal it on read.
            self.bloom.add(id, obj_type, body.len()).await?;
        }

        let mut cached = Vec::with_capacity(body.len() + 1);
        cached.push(obj_type.to_u8());
        cached.extend_from_slice(&body);
        let _ = self
            .read_cache
            .lock()
            .expect("read cache lock poisoned")
            .insert(key, cached);

        Ok(Some((obj_type, body)))
    }

    /// Tombstone an object. The Parquet row is reclaimed at compaction; the
    /// side blob (if any) is deleted with the last tombstoned row.
    pub async fn delete(&self, id: &ObjectHash) -> Result<(), GitError> {
        let sha = id.to_string();
        let tombstone = segment::write_tombstones(vec![sha.clone()])?;
        let key = self.paths.new_tombstone_key();
        self.bucket.put(&key, tombstone).await?;

        let mut index = self.index.write().await;
        index.tombstone_keys.push(key);
        index.tombstoned.insert(sha.clone());
        drop(index);

        self.bloom.remove_exact(id).await?;
        self.read_cache
            .lock()
            .expect("read cache lock poisoned")
            .remove(&sha);
        Ok(())
    }

    /// Resurrect a tombstoned id by rewriting the tombstone listing without
    /// it. Rare; only `put` of identical content reaches this.
    async fn untombstone(&self, id: &ObjectHash) -> Result<(), GitError> {
        let sha = id.to_string();
        let mut index = self.index.write().await;
        if !index.tombstoned.remove(&sha) {
            return Ok(());
        }
        let remaining: Vec<String> = index.tombstoned.iter().cloned().collect();
        let old_keys = std::mem::take(&mut index.tombstone_keys);
        if !remaining.is_empty() {
            let key = self.paths.new_tombstone_key();
            self.bucket
                .put(&key, segment::write_tombstones(remaining)?)
                .await?;
            index.tombstone_keys.push(key);
        }
        for key in old_keys {
            self.bucket.delete(&key).await?;
        }
        Ok(())
    }

    /// Write the current buffer generation as one new segment. Serialized by
    /// a dedicated mutex; WAL rows are deleted only after the bucket ack.
    pub async fn flush(&self) -> Result<Option<FlushEvent>, GitError> {
        let _flush_guard = self.flush_lock.lock().await;
        self.flush_armed.store(false, Ordering::Relaxed);

        let snapshot = self.buffer.snapshot();
        if snapshot.is_empty() {
            return Ok(None);
        }

        let rows: Vec<SegmentRow> = snapshot
            .iter()
            .map(|(id, obj)| SegmentRow {
                sha: id.to_string(),
                otype: obj.obj_type.to_string(),
                size: obj.body.len() as i64,
                data: if obj.large_path.is_some() {
                    None
                } else {
                    Some(obj.body.clone())
                },
            })
            .collect();
        let record_count = rows.len();

        let bytes = segment::write_segment(rows, self.config.segment.row_group_size)?;
        let byte_len = bytes.len() as u64;
        let key = self.paths.new_segment_key();
        self.bucket.put(&key, bytes).await?;

        // Only now is the generation durable: publish the segment, drop the
        // WAL rows, persist the filter.
        {
            let mut index = self.index.write().await;
            index.segments.insert(0, key.clone());
        }
        self.buffer.discard_flushed(&snapshot).await?;
        self.bloom.persist().await?;

        let event = FlushEvent {
            segment_key: key,
            bytes: byte_len,
            record_count,
        };
        tracing::debug!(segment = %event.segment_key, records = record_count, "flushed write buffer");
        if let Some(tx) = self.flush_tx.lock().expect("flush tx lock poisoned").as_ref() {
            let _ = tx.send(event.clone());
        }
        Ok(Some(event))
    }

    /// Live segment count, the compaction trigger input.
    pub async fn segment_count(&self) -> usize {
        self.index.read().await.segments.len()
    }

    /// Whether the segment count is past the configured threshold.
    pub async fn needs_compaction(&self) -> bool {
        self.segment_count().await > self.config.compaction.segment_threshold
    }

    /// Merge all live segments into one, eliminating duplicate and
    /// tombstoned rows. Journaled so a crash at any point recovers cleanly.
    pub async fn compact(&self) -> Result<(), GitError> {
        // Excludes flushes for the duration; readers continue against the
        // pre-compaction view until the swap below.
        let _flush_guard = self.flush_lock.lock().await;

        let (sources, tombstone_keys, tombstoned) = {
            let index = self.index.read().await;
            (
                index.segments.clone(),
                index.tombstone_keys.clone(),
                index.tombstoned.clone(),
            )
        };
        if sources.len() < 2 && tombstoned.is_empty() {
            return Ok(());
        }

        let mut sources_rows = Vec::with_capacity(sources.len());
        for key in &sources {
            let bytes = self.bucket.get(key).await?.ok_or_else(|| {
                GitError::Bucket(format!("segment {key} vanished during compaction"))
            })?;
            sources_rows.push(segment::read_all_rows(&bytes)?);
        }
        let merged = compaction::merge_rows(sources_rows, &tombstoned);

        let target_key = self.paths.new_segment_key();
        let journal_id =
            compaction::journal_begin(&self.scratchpad, &sources, &target_key).await?;

        let bytes = segment::write_segment(merged, self.config.segment.row_group_size)?;
        self.bucket.put(&target_key, bytes).await?;
        compaction::journal_mark_written(&self.scratchpad, &journal_id).await?;

        // Swap: delete sources and consumed tombstones under the write lock
        // so no reader observes a segment disappearing mid-scan.
        {
            let mut index = self.index.write().await;
            for key in &sources {
                self.bucket.delete(key).await?;
            }
            for key in &tombstone_keys {
                self.bucket.delete(key).await?;
            }
            for sha in &tombstoned {
                let id: ObjectHash = sha.parse().map_err(GitError::InvalidHashValue)?;
                self.bucket.delete(&self.paths.large_object_key(&id)).await?;
            }
            index.segments = vec![target_key.clone()];
            index.tombstone_keys.clear();
            index.tombstoned.clear();
        }
        compaction::journal_finish(&self.scratchpad, &journal_id).await?;
        tracing::debug!(target = %target_key, merged_from = sources.len(), "compacted segments");
        Ok(())
    }

    /// All object ids currently reachable in the store (buffer + segments,
    /// minus tombstones). Used by the bloom rebuild and diagnostics.
    pub async fn list_object_ids(&self) -> Result<Vec<ObjectHash>, GitError> {
        let mut out: HashSet<String> = self
            .buffer
            .snapshot()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        let index = self.index.read().await;
        for key in &index.segments {
            if let Some(bytes) = self.bucket.get(key).await? {
                out.extend(segment::list_shas(&bytes)?);
            }
        }
        let tombstoned = index.tombstoned.clone();
        drop(index);
        out.retain(|sha| !tombstoned.contains(sha));
        out.into_iter()
            .map(|sha| sha.parse().map_err(GitError::InvalidHashValue))
            .collect()
    }

    /// Direct bloom probe, exposed for pack negotiation.
    pub fn may_exist(&self, id: &ObjectHash) -> bool {
        self.bloom.may_exist(id) || self.buffer.contains(id)
    }

    /// Exact probe against the sha cache.
    pub async fn definitely_exists(&self, id: &ObjectHash) -> Result<bool, GitError> {
        if self.buffer.contains(id) {
            return Ok(true);
        }
        self.bloom.definitely_exists(id).await
    }
}

#[async_trait]
impl DeltaBaseResolver for CasStore {
    async fn resolve_base(
        &self,
        hash: &ObjectHash,
    ) -> Result<Option<(ObjectType, Vec<u8>)>, GitError> {
        self.get(hash).await
    }
}
