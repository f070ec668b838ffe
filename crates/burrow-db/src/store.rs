//! Typed queries over the relay's three tables
//!
//! The alias allocator treats storage as required (a failed query fails the
//! registration); the request logger treats it as best-effort.

use crate::entities::{api_request, user, user_alias};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, Set,
};
use tracing::debug;

/// One completed public request, ready to be logged
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub alias: String,
    pub port: i32,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

/// Shared handle over the relay database
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Look up a user by its opaque token. A user is known iff a row exists.
    pub async fn find_user_by_token(&self, token: &str) -> Result<Option<user::Model>, DbErr> {
        user::Entity::find()
            .filter(user::Column::UserToken.eq(token))
            .one(&self.db)
            .await
    }

    /// Insert a user row for a token
    pub async fn insert_user(&self, token: &str) -> Result<user::Model, DbErr> {
        let row = user::ActiveModel {
            user_token: Set(token.to_string()),
            ..Default::default()
        };
        row.insert(&self.db).await
    }

    /// Find the persisted alias row for a (user, port) pair
    pub async fn find_alias(
        &self,
        user_id: i64,
        port: i32,
    ) -> Result<Option<user_alias::Model>, DbErr> {
        user_alias::Entity::find()
            .filter(user_alias::Column::UserId.eq(user_id))
            .filter(user_alias::Column::Port.eq(port))
            .one(&self.db)
            .await
    }

    /// Count the persisted aliases a user currently holds
    pub async fn count_aliases(&self, user_id: i64) -> Result<u64, DbErr> {
        user_alias::Entity::find()
            .filter(user_alias::Column::UserId.eq(user_id))
            .count(&self.db)
            .await
    }

    /// Persist a fresh (user, alias, port) mapping
    pub async fn insert_alias(
        &self,
        user_id: i64,
        alias: &str,
        port: i32,
    ) -> Result<user_alias::Model, DbErr> {
        let row = user_alias::ActiveModel {
            user_id: Set(user_id),
            alias: Set(alias.to_string()),
            port: Set(port),
            ..Default::default()
        };
        row.insert(&self.db).await
    }

    /// Write one request-log row
    pub async fn log_request(&self, entry: RequestLog) -> Result<(), DbErr> {
        debug!(
            alias = %entry.alias,
            method = %entry.method,
            path = %entry.path,
            status = entry.status_code,
            "Logging request"
        );

        let row = api_request::ActiveModel {
            alias: Set(entry.alias),
            port: Set(entry.port),
            method: Set(entry.method),
            path: Set(entry.path),
            status_code: Set(entry.status_code),
            bytes_in: Set(entry.bytes_in),
            bytes_out: Set(entry.bytes_out),
            created_at: Set(chrono::Utc::now()),
            ..Default::default()
        };
        row.insert(&self.db).await?;

        Ok(())
    }

    /// Close the underlying connection pool
    pub async fn close(self) -> Result<(), DbErr> {
        self.db.close().await
    }
}
