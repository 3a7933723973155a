//! The local scratchpad: a cheap per-repository SQLite database holding the
//! WAL, the ref table, bloom state, protection rules, and the compaction
//! journal. Everything here is rebuildable from the bucket except the WAL
//! tail, which is exactly what it protects.

pub mod entity;

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, Schema,
    TransactionTrait,
};

use crate::errors::GitError;

/// Handle to the scratchpad database with the schema applied.
#[derive(Clone)]
pub struct Scratchpad {
    db: DatabaseConnection,
}

impl Scratchpad {
    /// Connect to the given database URL and create any missing tables.
    ///
    /// The pool is pinned to a single connection: the coordinator is the only
    /// writer, and an in-memory sqlite database exists per connection.
    pub async fn connect(url: &str) -> Result<Self, GitError> {
        let mut options = ConnectOptions::new(url.to_owned());
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options).await?;
        let pad = Self { db };
        pad.ensure_schema().await?;
        Ok(pad)
    }

    /// Fresh in-memory scratchpad; used by tests and ephemeral repos.
    pub async fn in_memory() -> Result<Self, GitError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Open a transaction; CAS and the push ref batch run inside one.
    pub async fn begin(&self) -> Result<DatabaseTransaction, GitError> {
        Ok(self.db.begin().await?)
    }

    async fn ensure_schema(&self) -> Result<(), GitError> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        macro_rules! create {
            ($entity:path) => {{
                let mut stmt = schema.create_table_from_entity($entity);
                stmt.if_not_exists();
                self.db.execute(backend.build(&stmt)).await?;
            }};
        }

        create!(entity::refs::Entity);
        create!(entity::bloom_filter::Entity);
        create!(entity::sha_cache::Entity);
        create!(entity::compaction_journal::Entity);
        create!(entity::compaction_retries::Entity);
        create!(entity::write_buffer_wal::Entity);
        create!(entity::branch_protection::Entity);
        Ok(())
    }
}

/// Current time as unix seconds, the timestamp convention for every
/// scratchpad row.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
