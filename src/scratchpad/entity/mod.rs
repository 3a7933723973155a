//! sea-orm entity definitions for the per-repository scratchpad tables.
pub mod bloom_filter;
pub mod branch_protection;
pub mod compaction_journal;
pub mod compaction_retries;
pub mod refs;
pub mod sha_cache;
pub mod write_buffer_wal;
