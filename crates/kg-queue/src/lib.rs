//! Durable message queue (C1): push/poll/delete backed by Postgres.
//!
//! Wraps a single table behind a small set of async methods; `poll` uses
//! `FOR UPDATE SKIP LOCKED` instead of NOTIFY/LISTEN since delivery here
//! needs a visibility lease, not a broadcast.

pub mod dead_letter;
pub mod proxy;
pub mod sweep;

pub use proxy::QueueProxy;

use chrono::{DateTime, Duration, Utc};
use kg_common::TaskPriority;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PushMessage {
    pub contents: Vec<u8>,
    pub visibility_timeout_secs: i64,
    pub priority: TaskPriority,
}

#[derive(Debug, Clone)]
pub struct PolledMessage {
    pub id: Uuid,
    pub poll_tag: Uuid,
    pub contents: Vec<u8>,
    pub delivery_count: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stale poll_tag for message {0}")]
    StalePollTag(Uuid),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A single named queue backed by the `queue_messages` table, scoped by
/// `queue_name` so multiple logical queues can share one table.
#[derive(Clone)]
pub struct Queue {
    pool: PgPool,
    name: String,
}

impl Queue {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self { pool, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Escape hatch for callers that need the backing pool directly (e.g.
    /// writing to the dead-letter table, which lives alongside this queue's
    /// table but isn't part of `Queue`'s own method surface).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Durable before returning: the INSERT commits before the producer's
    /// call resolves, satisfying the "push is durable before acknowledging"
    /// contract.
    pub async fn push(&self, messages: Vec<PushMessage>) -> Result<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(messages.len());
        for msg in messages {
            let id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO queue_messages
                    (id, queue_name, contents, priority, visible_at, delivery_count, created_at)
                VALUES ($1, $2, $3, $4, now(), 0, now())
                "#,
            )
            .bind(id)
            .bind(&self.name)
            .bind(&msg.contents)
            .bind(msg.priority.as_u8() as i16)
            .execute(&self.pool)
            .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Weighted-fair pick across priority classes: higher classes are
    /// preferred (`ORDER BY priority DESC`) but a class is never starved
    /// because ties within a class fall back to FIFO (`created_at ASC`) and
    /// the caller loops polling small batches rather than draining one
    /// class to exhaustion.
    pub async fn poll(&self, count: i64, visibility_timeout_secs: i64) -> Result<Vec<PolledMessage>> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            WITH candidates AS (
                SELECT id
                FROM queue_messages
                WHERE queue_name = $1 AND visible_at <= now() AND dead_lettered = false
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages m
            SET visible_at = now() + make_interval(secs => $3),
                poll_tag = gen_random_uuid(),
                delivery_count = m.delivery_count + 1
            FROM candidates
            WHERE m.id = candidates.id
            RETURNING m.id, m.poll_tag, m.contents, m.delivery_count
            "#,
        )
        .bind(&self.name)
        .bind(count)
        .bind(visibility_timeout_secs)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| PolledMessage {
                id: r.id,
                poll_tag: r.poll_tag.unwrap_or_else(Uuid::nil),
                contents: r.contents,
                delivery_count: r.delivery_count,
            })
            .collect())
    }

    /// Fails (without erroring the caller out of the loop) if `poll_tag`
    /// doesn't match the current lease — that delivery already expired and
    /// a newer one may be in flight.
    pub async fn delete(&self, id: Uuid, poll_tag: Uuid) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE id = $1 AND queue_name = $2 AND poll_tag = $3",
        )
        .bind(id)
        .bind(&self.name)
        .bind(poll_tag)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::StalePollTag(id));
        }
        Ok(())
    }

    pub async fn depth(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM queue_messages WHERE queue_name = $1 AND dead_lettered = false",
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

/// Lists distinct queue names currently holding messages.
pub async fn list_queues(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT queue_name FROM queue_messages")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    poll_tag: Option<Uuid>,
    contents: Vec<u8>,
    delivery_count: i32,
}

/// Whether a lease has expired as of `now`, used by the sweep loop and
/// testable without a database.
pub fn lease_expired(visible_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    visible_at <= now
}

/// Time a message becomes visible again after being polled.
pub fn next_visible_at(now: DateTime<Utc>, visibility_timeout_secs: i64) -> DateTime<Utc> {
    now + Duration::seconds(visibility_timeout_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expired_is_inclusive_of_now() {
        let now = Utc::now();
        assert!(lease_expired(now, now));
        assert!(!lease_expired(now + Duration::seconds(5), now));
    }

    #[test]
    fn next_visible_at_adds_the_timeout() {
        let now = Utc::now();
        let v = next_visible_at(now, 30);
        assert_eq!((v - now).num_seconds(), 30);
    }
}
