//! PostgreSQL implementation of the store ports.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::claims::Principal;
use crate::error::{AuthError, Result, StoreError};
use crate::store::{PrincipalStore, RefreshRecord, RefreshStore, ServiceRecord, hash_token};
use crate::vault::SealedSecret;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "sigil";
pub const DEFAULT_POOL_SIZE: u32 = 10;

type RefreshRow = (String, String, Option<String>, String, DateTime<Utc>);

/// Custom db structure holding the connection pool.
#[derive(Clone, Debug)]
pub struct Database {
    pub postgres: PgPool,
}

impl Database {
    /// Init database connections.
    pub async fn new(
        hostname: &str,
        username: &str,
        password: &str,
        db: &str,
        pool: u32,
    ) -> std::result::Result<Self, sqlx::Error> {
        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new().max_connections(pool);
        let postgres = pool.connect(&addr).await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self { postgres })
    }

    /// Execute migration scripts.
    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!().run(&self.postgres).await
    }
}

fn timestamp(secs: i64) -> std::result::Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0).ok_or(StoreError::Timestamp(secs))
}

fn record((id, owner, service_id, token_hash, expires_at): RefreshRow) -> RefreshRecord {
    RefreshRecord {
        id,
        owner: match service_id {
            Some(service_id) => Principal::service(service_id, owner),
            None => Principal::account(owner),
        },
        token_hash,
        expires_at: expires_at.timestamp(),
    }
}

fn duplicate(err: sqlx::Error, what: &'static str) -> StoreError {
    if err
        .as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
    {
        StoreError::Duplicate(what)
    } else {
        StoreError::Sql(err)
    }
}

#[async_trait]
impl PrincipalStore for Database {
    async fn insert_service(&self, record: ServiceRecord) -> std::result::Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO services (id, owner_id, secret_key)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(record.id())
        .bind(&record.owner_id)
        .bind(&record.secret.ciphertext)
        .execute(&self.postgres)
        .await
        .map_err(|err| duplicate(err, "service"))?;

        Ok(())
    }

    async fn find_service(&self, service_id: &str) -> std::result::Result<Option<ServiceRecord>, StoreError> {
        let row = sqlx::query_as::<_, (String, String, String)>(
            r#"
            SELECT id, owner_id, secret_key
            FROM services
            WHERE id = $1
            "#,
        )
        .bind(service_id)
        .fetch_optional(&self.postgres)
        .await?;

        Ok(row.map(|(id, owner_id, ciphertext)| ServiceRecord {
            owner_id,
            secret: SealedSecret {
                service_id: id,
                ciphertext,
            },
        }))
    }

    async fn delete_service(&self, service_id: &str) -> std::result::Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM services WHERE id = $1")
            .bind(service_id)
            .execute(&self.postgres)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RefreshStore for Database {
    async fn issue(
        &self,
        owner: &Principal,
        token: &str,
        expires_at: i64,
    ) -> std::result::Result<RefreshRecord, StoreError> {
        let row = sqlx::query_as::<_, RefreshRow>(
            r#"
            INSERT INTO refresh_tokens (id, owner_principal_id, service_id, token_hash, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, owner_principal_id, service_id, token_hash, expires_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner.account_id())
        .bind(owner.service_id())
        .bind(hash_token(token))
        .bind(timestamp(expires_at)?)
        .fetch_one(&self.postgres)
        .await
        .map_err(|err| duplicate(err, "refresh token"))?;

        Ok(record(row))
    }

    async fn rotate(&self, old_token: &str, new_token: &str, expires_at: i64) -> Result<RefreshRecord> {
        // The row lock on `token_hash` serializes concurrent rotations; the
        // loser re-evaluates the predicate and matches nothing.
        let row = sqlx::query_as::<_, RefreshRow>(
            r#"
            UPDATE refresh_tokens
            SET token_hash = $2, expires_at = $3
            WHERE token_hash = $1
            RETURNING id, owner_principal_id, service_id, token_hash, expires_at
            "#,
        )
        .bind(hash_token(old_token))
        .bind(hash_token(new_token))
        .bind(timestamp(expires_at)?)
        .fetch_optional(&self.postgres)
        .await
        .map_err(|err| AuthError::Store(duplicate(err, "refresh token")))?;

        row.map(record).ok_or(AuthError::InvalidRefresh)
    }

    async fn revoke(&self, owner: &Principal) -> std::result::Result<u64, StoreError> {
        let result = match owner {
            Principal::Account { id } => {
                sqlx::query(
                    r#"
                    DELETE FROM refresh_tokens
                    WHERE owner_principal_id = $1 AND service_id IS NULL
                    "#,
                )
                .bind(id)
                .execute(&self.postgres)
                .await?
            },
            Principal::Service {
                id,
                owner_account_id,
            } => {
                sqlx::query(
                    r#"
                    DELETE FROM refresh_tokens
                    WHERE owner_principal_id = $1 AND service_id = $2
                    "#,
                )
                .bind(owner_account_id)
                .bind(id)
                .execute(&self.postgres)
                .await?
            },
        };

        Ok(result.rows_affected())
    }

    async fn lookup(&self, token: &str) -> std::result::Result<Option<RefreshRecord>, StoreError> {
        let row = sqlx::query_as::<_, RefreshRow>(
            r#"
            SELECT id, owner_principal_id, service_id, token_hash, expires_at
            FROM refresh_tokens
            WHERE token_hash = $1
            "#,
        )
        .bind(hash_token(token))
        .fetch_optional(&self.postgres)
        .await?;

        Ok(row.map(record))
    }

    async fn purge_account(&self, account_id: &str) -> std::result::Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE owner_principal_id = $1")
            .bind(account_id)
            .execute(&self.postgres)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_service(&self, service_id: &str) -> std::result::Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE service_id = $1")
            .bind(service_id)
            .execute(&self.postgres)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: i64) -> std::result::Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(timestamp(now)?)
            .execute(&self.postgres)
            .await?;

        Ok(result.rows_affected())
    }
}
