//! The in-memory write buffer and its write-ahead log. Every `put` lands in
//! the WAL before the buffer so an acknowledged write survives a crash; rows
//! are deleted only after their buffer generation is durably inside a
//! segment.

use std::collections::HashMap;
use std::sync::Mutex;

use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, EntityTrait, QueryFilter};

use crate::{
    config::BufferConfig,
    errors::GitError,
    hash::ObjectHash,
    internal::object::types::ObjectType,
    scratchpad::{Scratchpad, entity, now_secs},
};

/// One buffered object awaiting flush.
#[derive(Debug, Clone)]
pub struct BufferedObject {
    pub obj_type: ObjectType,
    pub body: Vec<u8>,
    /// Side-blob key for large objects already copied to the bucket; their
    /// segment row will carry a null data column.
    pub large_path: Option<String>,
    pub wal_id: i64,
}

/// Emitted after every successful flush; consumers (e.g. an analytics
/// publisher) may act on it idempotently, keyed by `segment_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushEvent {
    pub segment_key: String,
    pub bytes: u64,
    pub record_count: usize,
}

#[derive(Default)]
struct BufferInner {
    objects: HashMap<ObjectHash, BufferedObject>,
    bytes: usize,
}

/// SHA-indexed write buffer backed by the `write_buffer_wal` table.
pub struct WriteBuffer {
    scratchpad: Scratchpad,
    config: BufferConfig,
    inner: Mutex<BufferInner>,
}

impl WriteBuffer {
    pub fn new(scratchpad: Scratchpad, config: BufferConfig) -> Self {
        Self {
            scratchpad,
            config,
            inner: Mutex::new(BufferInner::default()),
        }
    }

    /// Durably record an object in the WAL, then stage it in memory.
    /// Duplicate ids are a no-op returning `false`.
    pub async fn stage(
        &self,
        id: ObjectHash,
        obj_type: ObjectType,
        body: Vec<u8>,
        large_path: Option<String>,
    ) -> Result<bool, GitError> {
        if self.contains(&id) {
            return Ok(false);
        }

        let wal_body = if large_path.is_some() {
            Vec::new()
        } else {
            body.clone()
        };
        let row = entity::write_buffer_wal::ActiveModel {
            sha: Set(id.to_string()),
            otype: Set(obj_type.to_string()),
            body: Set(wal_body),
            path: Set(large_path.clone()),
            created_at: Set(now_secs()),
            ..Default::default()
        }
        .insert(self.scratchpad.conn())
        .await?;

        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        // A racing stage for the same id loses; the WAL row is redundant but
        // harmless, flush cleanup removes it by id list.
        if inner.objects.contains_key(&id) {
            return Ok(false);
        }
        inner.bytes += body.len();
        inner.objects.insert(
            id,
            BufferedObject {
                obj_type,
                body,
                large_path,
                wal_id: row.id,
            },
        );
        Ok(true)
    }

    pub fn contains(&self, id: &ObjectHash) -> bool {
        self.inner
            .lock()
            .expect("buffer lock poisoned")
            .objects
            .contains_key(id)
    }

    pub fn get(&self, id: &ObjectHash) -> Option<BufferedObject> {
        self.inner
            .lock()
            .expect("buffer lock poisoned")
            .objects
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer lock poisoned").objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().expect("buffer lock poisoned").bytes
    }

    /// The async-flush watermark.
    pub fn over_flush_threshold(&self) -> bool {
        let inner = self.inner.lock().expect("buffer lock poisoned");
        inner.objects.len() >= self.config.flush_object_threshold
            || inner.bytes >= self.config.flush_byte_threshold
    }

    /// The hard cap that forces a flush before `put` returns.
    pub fn over_hard_cap(&self) -> bool {
        let inner = self.inner.lock().expect("buffer lock poisoned");
        inner.objects.len() > self.config.max_buffer_objects
            || inner.bytes > self.config.max_buffer_bytes
    }

    /// Snapshot the current generation for flushing. The buffer stays
    /// readable while the segment write is in flight.
    pub fn snapshot(&self) -> Vec<(ObjectHash, BufferedObject)> {
        let inner = self.inner.lock().expect("buffer lock poisoned");
        inner.objects.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Drop a flushed generation: remove the ids from memory and their rows
    /// from the WAL. Called only after the segment write was acknowledged.
    pub async fn discard_flushed(
        &self,
        flushed: &[(ObjectHash, BufferedObject)],
    ) -> Result<(), GitError> {
        let wal_ids: Vec<i64> = flushed.iter().map(|(_, obj)| obj.wal_id).collect();
        let shas: Vec<String> = flushed.iter().map(|(id, _)| id.to_string()).collect();

        // Remove by sha as well as id: a racing duplicate stage may have left
        // an extra WAL row for an object this flush just made durable.
        entity::write_buffer_wal::Entity::delete_many()
            .filter(
                Condition::any()
                    .add(entity::write_buffer_wal::Column::Id.is_in(wal_ids))
                    .add(entity::write_buffer_wal::Column::Sha.is_in(shas)),
            )
            .exec(self.scratchpad.conn())
            .await?;

        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        for (id, _) in flushed {
            if let Some(obj) = inner.objects.remove(id) {
                inner.bytes = inner.bytes.saturating_sub(obj.body.len());
            }
        }
        Ok(())
    }

    /// Reload WAL rows into the in-memory buffer, deduplicated by sha.
    /// Returns the loaded rows so the caller can re-prime the bloom cache and
    /// fetch large-object bodies.
    pub async fn replay_wal(&self) -> Result<Vec<entity::write_buffer_wal::Model>, GitError> {
        let rows = entity::write_buffer_wal::Entity::find()
            .all(self.scratchpad.conn())
            .await?;

        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        for row in &rows {
            let id: ObjectHash = row
                .sha
                .parse()
                .map_err(GitError::InvalidHashValue)?;
            if inner.objects.contains_key(&id) {
                continue;
            }
            let obj_type = ObjectType::from_string(&row.otype)?;
            inner.bytes += row.body.len();
            inner.objects.insert(
                id,
                BufferedObject {
                    obj_type,
                    body: row.body.clone(),
                    large_path: row.path.clone(),
                    wal_id: row.id,
                },
            );
        }
        tracing::debug!(rows = rows.len(), "replayed write-buffer WAL");
        Ok(rows)
    }

    /// Load a large-object body fetched during recovery back into the staged
    /// entry so reads can serve it from memory.
    pub fn prime_body(&self, id: &ObjectHash, body: Vec<u8>) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        let body_len = body.len();
        let mut primed = false;
        if let Some(obj) = inner.objects.get_mut(id)
            && obj.body.is_empty()
        {
            obj.body = body;
            primed = true;
        }
        if primed {
            inner.bytes += body_len;
        }
    }
}
