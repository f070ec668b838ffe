//! User entity: a user is known iff a row exists for its token

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Opaque token presented by the agent at registration (unique)
    #[sea_orm(unique)]
    pub user_token: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Persisted aliases owned by this user
    #[sea_orm(has_many = "super::user_alias::Entity")]
    Aliases,
}

impl Related<super::user_alias::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Aliases.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
