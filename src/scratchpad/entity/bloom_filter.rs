//! Persisted bloom filter state: a single row holding the bitset.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "bloom_filter")]
pub struct Model {
    /// Always 1; the filter is a singleton row.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    /// Raw bitset.
    #[sea_orm(column_type = "Blob")]
    pub bits: Vec<u8>,
    /// Number of hash functions.
    pub k: i32,
    /// Items added since the last rebuild.
    pub item_count: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
