//! Authoritative ref table: `{name -> target}` plus the ref kind. The ref
//! log is the ordering authority; this table is its materialized view.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "refs")]
pub struct Model {
    /// Full ref path, e.g. `refs/heads/main` or `HEAD`.
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,
    /// 40-hex object id for direct refs, a ref name for symbolic refs.
    pub target: String,
    /// `direct` or `symbolic`.
    pub kind: String,
    /// Unix seconds of the last update.
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
