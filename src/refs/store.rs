//! The authoritative ref table: `{name -> target}` in the scratchpad with a
//! read-through cache and compare-and-swap under a database transaction. The
//! table is a materialized view of the ref log and must stay derivable from
//! it.

use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};

use crate::{
    errors::GitError,
    hash::ZERO_ID,
    scratchpad::{Scratchpad, entity, now_secs},
};

/// Ref kinds as stored in the `kind` column.
pub const KIND_DIRECT: &str = "direct";
pub const KIND_SYMBOLIC: &str = "symbolic";

/// One listed ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub name: String,
    pub target: String,
    pub symbolic: bool,
}

/// Expected-old values that mean "the ref must not exist" (create-only CAS).
pub fn expects_absent(expected_old: Option<&str>) -> bool {
    match expected_old {
        None => true,
        Some(s) => s.is_empty() || s == ZERO_ID,
    }
}

/// Ref table with read-through cache.
pub struct RefStore {
    scratchpad: Scratchpad,
    cache: DashMap<String, RefRecord>,
}

impl RefStore {
    pub fn new(scratchpad: Scratchpad) -> Self {
        Self {
            scratchpad,
            cache: DashMap::new(),
        }
    }

    /// Read one ref, returning its raw target (a sha, or a ref name for
    /// symbolic refs).
    pub async fn read(&self, name: &str) -> Result<Option<RefRecord>, GitError> {
        if let Some(hit) = self.cache.get(name) {
            return Ok(Some(hit.value().clone()));
        }
        let row = entity::refs::Entity::find_by_id(name)
            .one(self.scratchpad.conn())
            .await?;
        Ok(row.map(|row| {
            let record = RefRecord {
                name: row.name,
                target: row.target,
                symbolic: row.kind == KIND_SYMBOLIC,
            };
            self.cache.insert(record.name.clone(), record.clone());
            record
        }))
    }

    /// Resolve a name to a sha, following symbolic refs (bounded depth).
    pub async fn resolve(&self, name: &str) -> Result<Option<String>, GitError> {
        let mut current = name.to_string();
        for _ in 0..5 {
            match self.read(&current).await? {
                None => return Ok(None),
                Some(record) if record.symbolic => current = record.target,
                Some(record) => return Ok(Some(record.target)),
            }
        }
        Err(GitError::CustomError(format!(
            "symbolic ref chain too deep at {name}"
        )))
    }

    /// List refs, optionally under a prefix, name-ordered.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<RefRecord>, GitError> {
        let mut query = entity::refs::Entity::find();
        if let Some(prefix) = prefix {
            query = query.filter(entity::refs::Column::Name.starts_with(prefix));
        }
        let mut rows = query.all(self.scratchpad.conn()).await?;
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows
            .into_iter()
            .map(|row| RefRecord {
                name: row.name,
                target: row.target,
                symbolic: row.kind == KIND_SYMBOLIC,
            })
            .collect())
    }

    /// Unconditional write; rare, used by restore and bootstrap paths.
    pub async fn write(&self, name: &str, sha: &str) -> Result<(), GitError> {
        self.upsert(name, sha, KIND_DIRECT).await
    }

    /// Unconditional symbolic write (e.g. HEAD -> refs/heads/main).
    pub async fn write_symbolic(&self, name: &str, target_ref: &str) -> Result<(), GitError> {
        self.upsert(name, target_ref, KIND_SYMBOLIC).await
    }

    async fn upsert(&self, name: &str, target: &str, kind: &str) -> Result<(), GitError> {
        let existing = entity::refs::Entity::find_by_id(name)
            .one(self.scratchpad.conn())
            .await?;
        let model = entity::refs::ActiveModel {
            name: Set(name.to_string()),
            target: Set(target.to_string()),
            kind: Set(kind.to_string()),
            updated_at: Set(now_secs()),
        };
        if existing.is_some() {
            model.update(self.scratchpad.conn()).await?;
        } else {
            model.insert(self.scratchpad.conn()).await?;
        }
        self.cache.remove(name);
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), GitError> {
        entity::refs::Entity::delete_by_id(name)
            .exec(self.scratchpad.conn())
            .await?;
        self.cache.remove(name);
        Ok(())
    }

    /// Compare-and-swap under a scratchpad transaction.
    ///
    /// `expected_old` of `None`/`""`/the zero id means create-only; `new` of
    /// the zero id means delete. Returns `false` with no state change on
    /// mismatch; a successful swap invalidates the read-through cache.
    pub async fn compare_and_swap(
        &self,
        name: &str,
        expected_old: Option<&str>,
        new: &str,
    ) -> Result<bool, GitError> {
        let txn = self.scratchpad.begin().await?;

        let current = entity::refs::Entity::find_by_id(name).one(&txn).await?;
        let matches = match (&current, expects_absent(expected_old)) {
            (None, true) => true,
            (None, false) => false,
            (Some(_), true) => false,
            (Some(row), false) => Some(row.target.as_str()) == expected_old,
        };
        if !matches {
            txn.rollback().await?;
            return Ok(false);
        }

        apply_ref_update(&txn, name, new, current.is_some(), now_secs()).await?;
        txn.commit().await?;
        self.cache.remove(name);
        Ok(true)
    }

    /// Drop a cache entry; push batches call this per updated ref after
    /// commit.
    pub fn invalidate(&self, name: &str) {
        self.cache.remove(name);
    }

    /// Drop the whole cache (namespace reset).
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}

/// Apply one update inside an open transaction: insert, replace, or (for the
/// zero id) delete. Shared by the CAS and the push batch.
pub async fn apply_ref_update<C: ConnectionTrait>(
    conn: &C,
    name: &str,
    new: &str,
    exists: bool,
    timestamp: i64,
) -> Result<(), GitError> {
    if new == ZERO_ID {
        entity::refs::Entity::delete_by_id(name).exec(conn).await?;
        return Ok(());
    }
    let model = entity::refs::ActiveModel {
        name: Set(name.to_string()),
        target: Set(new.to_string()),
        kind: Set(KIND_DIRECT.to_string()),
        updated_at: Set(timestamp),
    };
    if exists {
        model.update(conn).await?;
    } else {
        model.insert(conn).await?;
    }
    Ok(())
}

/// Read the current target of a ref inside an open transaction.
pub async fn read_ref_in<C: ConnectionTrait>(
    conn: &C,
    name: &str,
) -> Result<Option<String>, GitError> {
    Ok(entity::refs::Entity::find_by_id(name)
        .one(conn)
        .await?
        .map(|row| row.target))
}
