//! Lease Repository
//!
//! Rows in `leases` back the distributed lock manager. A row survives
//! release so that its fencing token keeps increasing across holders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{LeaseRepository, RepoResult};

pub struct PgLeaseRepository {
    pool: PgPool,
}

impl PgLeaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseRepository for PgLeaseRepository {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<Option<u64>> {
        let token: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO leases (key, holder, expires_at, token)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (key) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at,
                token = leases.token + 1
            WHERE leases.holder IS NULL OR leases.expires_at <= $4
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(token.map(|t| t as u64))
    }

    async fn renew(
        &self,
        key: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET expires_at = $3
            WHERE key = $1 AND holder = $2 AND expires_at > $4
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, holder: &str) -> RepoResult<bool> {
        let result = sqlx::query("UPDATE leases SET holder = NULL WHERE key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
