use kg_common::DeadLetterRecord;
use sqlx::PgPool;

use crate::Result;

/// Writes a dead-lettered task to the auxiliary table, preserving the
/// original payload verbatim (invariant 5).
pub async fn record(pool: &PgPool, record: &DeadLetterRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dead_letters (task_id, original_payload, failure_reason, failed_at, retry_count)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&record.task_id)
    .bind(&record.original_payload)
    .bind(&record.failure_reason)
    .bind(record.failed_at)
    .bind(record.retry_count as i32)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list(pool: &PgPool, limit: i64) -> Result<Vec<DeadLetterRecord>> {
    let rows = sqlx::query_as::<_, DeadLetterRow>(
        "SELECT task_id, original_payload, failure_reason, failed_at, retry_count \
         FROM dead_letters ORDER BY failed_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| DeadLetterRecord {
            task_id: r.task_id,
            original_payload: r.original_payload,
            failure_reason: r.failure_reason,
            failed_at: r.failed_at,
            retry_count: r.retry_count as u32,
        })
        .collect())
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    task_id: String,
    original_payload: serde_json::Value,
    failure_reason: String,
    failed_at: chrono::DateTime<chrono::Utc>,
    retry_count: i32,
}
