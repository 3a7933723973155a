//! Compaction bookkeeping: the journal rows that make the merge protocol
//! crash-safe, the consecutive-failure counter, and the pure merge of
//! segment rows (newest occurrence wins, tombstones drop rows).

use std::collections::HashSet;

use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};

use crate::{
    cas::segment::SegmentRow,
    errors::GitError,
    scratchpad::{
        Scratchpad,
        entity::{self, compaction_journal},
        now_secs,
    },
};

/// Start a compaction: record sources and target with `in_progress` status.
pub async fn journal_begin(
    scratchpad: &Scratchpad,
    source_keys: &[String],
    target_key: &str,
) -> Result<String, GitError> {
    let id = uuid::Uuid::new_v4().to_string();
    entity::compaction_journal::ActiveModel {
        id: Set(id.clone()),
        source_keys: Set(serde_json::to_string(source_keys)
            .map_err(|e| GitError::CustomError(format!("journal encode: {e}")))?),
        target_key: Set(target_key.to_string()),
        status: Set(compaction_journal::STATUS_IN_PROGRESS.to_string()),
        created_at: Set(now_secs()),
    }
    .insert(scratchpad.conn())
    .await?;
    Ok(id)
}

/// The target segment is durable; sources may now be deleted.
pub async fn journal_mark_written(scratchpad: &Scratchpad, id: &str) -> Result<(), GitError> {
    entity::compaction_journal::ActiveModel {
        id: Set(id.to_string()),
        status: Set(compaction_journal::STATUS_WRITTEN.to_string()),
        ..Default::default()
    }
    .update(scratchpad.conn())
    .await?;
    Ok(())
}

/// Compaction complete; drop the journal row.
pub async fn journal_finish(scratchpad: &Scratchpad, id: &str) -> Result<(), GitError> {
    entity::compaction_journal::Entity::delete_by_id(id)
        .exec(scratchpad.conn())
        .await?;
    Ok(())
}

/// Journal rows left behind by a crash, for startup recovery.
pub async fn pending_journals(
    scratchpad: &Scratchpad,
) -> Result<Vec<compaction_journal::Model>, GitError> {
    Ok(entity::compaction_journal::Entity::find()
        .all(scratchpad.conn())
        .await?)
}

/// Decode the JSON source key list of a journal row.
pub fn journal_sources(row: &compaction_journal::Model) -> Result<Vec<String>, GitError> {
    serde_json::from_str(&row.source_keys)
        .map_err(|e| GitError::CustomError(format!("journal decode: {e}")))
}

/// Consecutive-failure counter, a singleton row.
pub async fn load_attempts(scratchpad: &Scratchpad) -> Result<u32, GitError> {
    Ok(entity::compaction_retries::Entity::find_by_id(1)
        .one(scratchpad.conn())
        .await?
        .map(|row| row.attempt_count.max(0) as u32)
        .unwrap_or(0))
}

/// Record a failed attempt and return the new count.
pub async fn record_failure(scratchpad: &Scratchpad, error: &str) -> Result<u32, GitError> {
    let existing = entity::compaction_retries::Entity::find_by_id(1)
        .one(scratchpad.conn())
        .await?;
    let attempts = existing.as_ref().map(|r| r.attempt_count).unwrap_or(0) + 1;
    let model = entity::compaction_retries::ActiveModel {
        id: Set(1),
        attempt_count: Set(attempts),
        last_error: Set(Some(error.to_string())),
        updated_at: Set(now_secs()),
    };
    if existing.is_some() {
        model.update(scratchpad.conn()).await?;
    } else {
        model.insert(scratchpad.conn()).await?;
    }
    Ok(attempts.max(0) as u32)
}

/// Reset the counter after a successful run.
pub async fn clear_failures(scratchpad: &Scratchpad) -> Result<(), GitError> {
    let existing = entity::compaction_retries::Entity::find_by_id(1)
        .one(scratchpad.conn())
        .await?;
    if existing.is_some() {
        entity::compaction_retries::ActiveModel {
            id: Set(1),
            attempt_count: Set(0),
            last_error: Set(None),
            updated_at: Set(now_secs()),
        }
        .update(scratchpad.conn())
        .await?;
    }
    Ok(())
}

/// Merge source rows, newest segment first: the first occurrence of a sha
/// wins, tombstoned shas are dropped entirely. The result is what the target
/// segment will hold.
pub fn merge_rows(
    sources_newest_first: Vec<Vec<SegmentRow>>,
    tombstoned: &HashSet<String>,
) -> Vec<SegmentRow> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged = Vec::new();
    for rows in sources_newest_first {
        for row in rows {
            if tombstoned.contains(&row.sha) || !seen.insert(row.sha.clone()) {
                continue;
            }
            merged.push(row);
        }
    }
    merged
}
