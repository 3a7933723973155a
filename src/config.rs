//! Engine configuration. Every threshold the storage pipeline consults lives
//! here with the production defaults; tests override individual fields.

use serde::{Deserialize, Serialize};

/// Write buffer and WAL thresholds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BufferConfig {
    /// Arm an async flush once this many objects are buffered.
    pub flush_object_threshold: usize,
    /// Arm an async flush once this many bytes are buffered.
    pub flush_byte_threshold: usize,
    /// Hard cap on buffered objects; exceeding it auto-flushes before `put` returns.
    pub max_buffer_objects: usize,
    /// Hard cap on buffered bytes; exceeding it auto-flushes before `put` returns.
    pub max_buffer_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_object_threshold: 256,
            flush_byte_threshold: 8 * 1024 * 1024,
            max_buffer_objects: 4096,
            max_buffer_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Parquet segment parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SegmentConfig {
    /// Objects at or above this size are stored as side blobs with a null
    /// `data` column.
    pub inline_threshold: usize,
    /// Maximum rows per Parquet row group.
    pub row_group_size: usize,
    /// Memory budget of the decoded-object LRU cache fronting segment reads.
    pub read_cache_bytes: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 1024 * 1024,
            row_group_size: 1024,
            read_cache_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Bloom filter sizing and verification policy.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BloomConfig {
    /// Target false-positive rate.
    pub false_positive_rate: f64,
    /// Capacity the bitset is sized for.
    pub expected_items: usize,
    /// Rebuild the filter from segment listings once `item_count` drifts past
    /// this fraction of `expected_items`.
    pub rebuild_drift: f64,
    /// Verify bloom negatives against the segments so a corrupted persisted
    /// filter self-heals on read.
    pub verify_negatives: bool,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            false_positive_rate: 0.01,
            expected_items: 100_000,
            rebuild_drift: 2.0,
            verify_negatives: false,
        }
    }
}

/// Compaction scheduling and retry policy.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompactionConfig {
    /// Compact once the live segment count exceeds this.
    pub segment_threshold: usize,
    /// Give up after this many consecutive failures.
    pub max_attempts: u32,
    /// Backoff schedule in seconds between retries; the last entry repeats.
    pub backoff_secs: Vec<u64>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            segment_threshold: 8,
            max_attempts: 3,
            backoff_secs: vec![10, 30, 90],
        }
    }
}

impl CompactionConfig {
    /// Backoff delay for the given zero-based attempt number.
    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        let idx = (attempt as usize).min(self.backoff_secs.len().saturating_sub(1));
        self.backoff_secs.get(idx).copied().unwrap_or(10)
    }
}

/// Ref log checkpointing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RefLogConfig {
    /// Take a replay checkpoint every N entries.
    pub checkpoint_interval: u64,
}

impl Default for RefLogConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
        }
    }
}

/// Top-level engine configuration for one repository coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StoreConfig {
    pub buffer: BufferConfig,
    pub segment: SegmentConfig,
    pub bloom: BloomConfig,
    pub compaction: CompactionConfig,
    pub ref_log: RefLogConfig,
}
