//! Consolidated initial schema migration

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Create users table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(big_integer(User::Id).auto_increment().primary_key())
                    .col(string_len(User::UserToken, 255).not_null().unique_key())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_user_token")
                    .table(User::Table)
                    .col(User::UserToken)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Create user_aliases table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(UserAlias::Table)
                    .if_not_exists()
                    .col(big_integer(UserAlias::Id).auto_increment().primary_key())
                    .col(big_integer(UserAlias::UserId).not_null())
                    .col(string_len(UserAlias::Alias, 64).not_null().unique_key())
                    .col(integer(UserAlias::Port).not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_user_aliases_user_id")
                            .from(UserAlias::Table, UserAlias::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_user_aliases_user_id")
                    .table(UserAlias::Table)
                    .col(UserAlias::UserId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Create api_requests table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ApiRequest::Table)
                    .if_not_exists()
                    .col(big_integer(ApiRequest::Id).auto_increment().primary_key())
                    .col(string_len(ApiRequest::Alias, 64).not_null())
                    .col(integer(ApiRequest::Port).not_null().default(0))
                    .col(string_len(ApiRequest::Method, 16).not_null())
                    .col(text(ApiRequest::Path).not_null())
                    .col(integer(ApiRequest::StatusCode).not_null())
                    .col(big_integer(ApiRequest::BytesIn).not_null().default(0))
                    .col(big_integer(ApiRequest::BytesOut).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(ApiRequest::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_api_requests_alias")
                    .table(ApiRequest::Table)
                    .col(ApiRequest::Alias)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ApiRequest::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(UserAlias::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum User {
    #[sea_orm(iden = "users")]
    Table,
    Id,
    UserToken,
}

#[derive(DeriveIden)]
enum UserAlias {
    #[sea_orm(iden = "user_aliases")]
    Table,
    Id,
    UserId,
    Alias,
    Port,
}

#[derive(DeriveIden)]
enum ApiRequest {
    #[sea_orm(iden = "api_requests")]
    Table,
    Id,
    Alias,
    Port,
    Method,
    Path,
    StatusCode,
    BytesIn,
    BytesOut,
    CreatedAt,
}
