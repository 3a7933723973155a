//! Write-ahead log for the in-memory object buffer. Rows are removed only
//! after the containing buffer has been durably written to a segment.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "write_buffer_wal")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub sha: String,
    #[sea_orm(column_name = "type")]
    pub otype: String,
    #[sea_orm(column_type = "Blob")]
    pub body: Vec<u8>,
    /// Side-blob key for bodies that went straight to the bucket; the WAL row
    /// then carries an empty body.
    pub path: Option<String>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
