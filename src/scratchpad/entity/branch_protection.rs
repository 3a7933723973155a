//! Branch protection rules, one row per pattern.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "branch_protection")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// Exact ref name, a `/*` single-segment glob, or bare `*`.
    pub pattern: String,
    pub required_reviews: i32,
    pub prevent_force_push: bool,
    pub prevent_deletion: bool,
    pub enabled: bool,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
