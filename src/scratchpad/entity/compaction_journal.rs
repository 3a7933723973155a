//! Compaction journal rows. Consulted only at startup to finish or roll back
//! an interrupted compaction.

use sea_orm::entity::prelude::*;

/// Journal states: `in_progress` (target may be partial), `written` (target
/// durable, sources not yet deleted), `done`.
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_WRITTEN: &str = "written";
pub const STATUS_DONE: &str = "done";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "compaction_journal")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// JSON array of source segment keys.
    pub source_keys: String,
    pub target_key: String,
    pub status: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
