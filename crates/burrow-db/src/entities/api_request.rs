//! ApiRequest entity: one row per completed public request

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "api_requests")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub alias: String,

    /// Reported port, taken from `x-forwarded-port` (0 when absent)
    pub port: i32,

    pub method: String,
    pub path: String,
    pub status_code: i32,

    /// Serialized request headers plus body, in bytes
    pub bytes_in: i64,

    /// Response body as transmitted, in bytes
    pub bytes_out: i64,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
