//! Event Log Repository
//!
//! Durable backing for the event bus. Offsets come from a per-stream counter
//! row that is bumped in the same transaction as the insert; the row lock
//! serializes publishers of one stream, so offsets become visible in order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::event::Event;
use sqlx::PgPool;

use super::{EventLog, RepoResult};

pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(
        &self,
        stream: &str,
        partition_key: &str,
        payload: &[u8],
        produced_at: DateTime<Utc>,
    ) -> RepoResult<Event> {
        let mut tx = self.pool.begin().await?;

        let offset: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_streams (stream, last_offset)
            VALUES ($1, 1)
            ON CONFLICT (stream) DO UPDATE SET last_offset = event_streams.last_offset + 1
            RETURNING last_offset
            "#,
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO events (stream, event_offset, partition_key, payload, produced_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(stream)
        .bind(offset)
        .bind(partition_key)
        .bind(payload)
        .bind(produced_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Event {
            stream: stream.to_string(),
            offset,
            partition_key: partition_key.to_string(),
            payload: payload.to_vec(),
            produced_at,
        })
    }

    async fn read(&self, stream: &str, after: i64, limit: u32) -> RepoResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT stream, event_offset, partition_key, payload, produced_at
            FROM events
            WHERE stream = $1 AND event_offset > $2
            ORDER BY event_offset ASC
            LIMIT $3
            "#,
        )
        .bind(stream)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn load_checkpoint(&self, stream: &str, group: &str) -> RepoResult<Option<i64>> {
        let offset = sqlx::query_scalar(
            r#"
            SELECT event_offset FROM event_checkpoints
            WHERE stream = $1 AND consumer_group = $2
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;

        Ok(offset)
    }

    async fn store_checkpoint(&self, stream: &str, group: &str, offset: i64) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO event_checkpoints (stream, consumer_group, event_offset)
            VALUES ($1, $2, $3)
            ON CONFLICT (stream, consumer_group) DO UPDATE SET event_offset = EXCLUDED.event_offset
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(offset)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    stream: String,
    event_offset: i64,
    partition_key: String,
    payload: Vec<u8>,
    produced_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            stream: row.stream,
            offset: row.event_offset,
            partition_key: row.partition_key,
            payload: row.payload,
            produced_at: row.produced_at,
        }
    }
}
