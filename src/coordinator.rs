//! The per-repository coordinator: single writer owning the scratchpad and
//! the storage components, with alarm-driven compaction and backoff.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    bucket::{Bucket, RepoPaths},
    cas::{CasStore, buffer::FlushEvent, compaction},
    config::StoreConfig,
    errors::GitError,
    hash::ObjectHash,
    protocol::smart::SmartProtocol,
    refs::{log::RefLog, protection::ProtectionStore, store::RefStore},
    scratchpad::{Scratchpad, now_secs},
};

/// Snapshot served by the operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorInfo {
    pub namespace: String,
    pub started_at: i64,
    pub segment_count: usize,
    pub ref_count: usize,
    pub ref_log_version: u64,
    pub compaction_attempts: u32,
    pub compaction_needed: bool,
}

/// Per-repository coordinator. One instance per repo; all writes flow
/// through it.
pub struct Coordinator {
    namespace: String,
    started_at: i64,
    config: StoreConfig,
    scratchpad: Scratchpad,
    cas: Arc<CasStore>,
    refs: Arc<RefStore>,
    ref_log: Arc<RefLog>,
    protection: Arc<ProtectionStore>,
    compaction_needed: AtomicBool,
}

impl Coordinator {
    /// Bring a repository online: apply the scratchpad schema, recover the
    /// CAS (journal rollforward + WAL replay; failure refuses writes), and
    /// reload the ref log tail.
    pub async fn initialize(
        namespace: &str,
        bucket: Arc<dyn Bucket>,
        scratchpad: Scratchpad,
        config: StoreConfig,
    ) -> Result<Arc<Self>, GitError> {
        let paths = RepoPaths::new(namespace);
        let cas = CasStore::open(
            scratchpad.clone(),
            bucket.clone(),
            paths.clone(),
            config.clone(),
        )
        .await?;
        let ref_log = Arc::new(RefLog::load(bucket, paths, config.ref_log.clone()).await?);
        let refs = Arc::new(RefStore::new(scratchpad.clone()));
        let protection = Arc::new(ProtectionStore::new(scratchpad.clone()));

        tracing::debug!(namespace, "coordinator initialized");
        Ok(Arc::new(Self {
            namespace: namespace.to_string(),
            started_at: now_secs(),
            config,
            scratchpad,
            cas,
            refs,
            ref_log,
            protection,
            compaction_needed: AtomicBool::new(false),
        }))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cas(&self) -> &Arc<CasStore> {
        &self.cas
    }

    pub fn refs(&self) -> &Arc<RefStore> {
        &self.refs
    }

    pub fn ref_log(&self) -> &Arc<RefLog> {
        &self.ref_log
    }

    pub fn protection(&self) -> &Arc<ProtectionStore> {
        &self.protection
    }

    /// A fresh protocol handler bound to this repository's components.
    pub fn smart_protocol(&self) -> SmartProtocol {
        SmartProtocol::new(
            self.cas.clone(),
            self.refs.clone(),
            self.ref_log.clone(),
            self.protection.clone(),
            self.scratchpad.clone(),
            self.config.clone(),
        )
    }

    /// Subscribe to flush events (segment key, bytes, record count).
    pub fn subscribe_flushes(&self) -> mpsc::UnboundedReceiver<FlushEvent> {
        self.cas.subscribe_flushes()
    }

    /// Post-request maintenance: run an armed flush and arm compaction when
    /// the segment count passed its threshold.
    pub async fn maintain(&self) -> Result<(), GitError> {
        if self.cas.take_flush_armed() {
            self.cas.flush().await?;
        }
        if self.cas.needs_compaction().await {
            self.compaction_needed.store(true, Ordering::Relaxed);
        }
        self.ref_log.persist_tail().await?;
        Ok(())
    }

    pub fn mark_compaction_needed(&self) {
        self.compaction_needed.store(true, Ordering::Relaxed);
    }

    /// Alarm entry point. Runs compaction when armed. Returns the backoff
    /// delay (seconds) when the attempt failed and a retry should be
    /// scheduled, `None` when there is nothing further to do.
    pub async fn alarm(&self) -> Result<Option<u64>, GitError> {
        if self.cas.take_flush_armed() {
            self.cas.flush().await?;
        }

        if !self.compaction_needed.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let attempts = compaction::load_attempts(&self.scratchpad).await?;
        if attempts >= self.config.compaction.max_attempts {
            // Recorded and skipped; operators reset the counter explicitly.
            let last = format!("compaction skipped after {attempts} failed attempts");
            tracing::error!(namespace = %self.namespace, "{last}");
            return Err(GitError::CompactionExhausted {
                attempts,
                last_error: last,
            });
        }

        match self.cas.compact().await {
            Ok(()) => {
                compaction::clear_failures(&self.scratchpad).await?;
                self.compaction_needed.store(false, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                let attempts = compaction::record_failure(&self.scratchpad, &e.to_string()).await?;
                let backoff = self
                    .config
                    .compaction
                    .backoff_for_attempt(attempts.saturating_sub(1));
                tracing::warn!(
                    namespace = %self.namespace,
                    attempts,
                    backoff,
                    error = %e,
                    "compaction failed, rescheduling"
                );
                Ok(Some(backoff))
            }
        }
    }

    /// Drop the read-through caches (namespace reset or explicit call).
    pub fn invalidate(&self) {
        self.refs.invalidate_all();
    }

    /// Liveness probe.
    pub fn health(&self) -> &'static str {
        "ok"
    }

    /// Operational snapshot for the `/info` endpoint.
    pub async fn info(&self) -> Result<CoordinatorInfo, GitError> {
        Ok(CoordinatorInfo {
            namespace: self.namespace.clone(),
            started_at: self.started_at,
            segment_count: self.cas.segment_count().await,
            ref_count: self.refs.list(None).await?.len(),
            ref_log_version: self.ref_log.head_version(),
            compaction_attempts: compaction::load_attempts(&self.scratchpad).await?,
            compaction_needed: self.compaction_needed.load(Ordering::Relaxed),
        })
    }

    /// Reclaimable orphan candidates: objects in the CAS no ref resolves to
    /// through the commit graph entry points. Diagnostic surface for GC.
    pub async fn orphan_candidates(&self) -> Result<Vec<ObjectHash>, GitError> {
        let mut referenced = std::collections::HashSet::new();
        for record in self.refs.list(Some("refs/")).await? {
            if let Ok(id) = record.target.parse::<ObjectHash>() {
                self.collect_reachable(id, &mut referenced).await?;
            }
        }
        let mut orphans = Vec::new();
        for id in self.cas.list_object_ids().await? {
            if !referenced.contains(&id) {
                orphans.push(id);
            }
        }
        Ok(orphans)
    }

    async fn collect_reachable(
        &self,
        start: ObjectHash,
        out: &mut std::collections::HashSet<ObjectHash>,
    ) -> Result<(), GitError> {
        use crate::internal::object::{ObjectTrait, commit::Commit, tag::Tag, tree::Tree};
        use crate::internal::object::types::ObjectType;

        let mut queue = std::collections::VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !out.insert(id) {
                continue;
            }
            let Some((obj_type, body)) = self.cas.get(&id).await? else {
                continue;
            };
            match obj_type {
                ObjectType::Commit => {
                    let commit = Commit::from_bytes(&body, id)?;
                    queue.push_back(commit.tree_id);
                    queue.extend(commit.parent_commit_ids);
                }
                ObjectType::Tree => {
                    let tree = Tree::from_bytes(&body, id)?;
                    queue.extend(tree.tree_items.iter().map(|i| i.id));
                }
                ObjectType::Tag => {
                    let tag = Tag::from_bytes(&body, id)?;
                    queue.push_back(tag.object_hash);
                }
                ObjectType::Blob => {}
                _ => {}
            }
        }
        Ok(())
    }
}
