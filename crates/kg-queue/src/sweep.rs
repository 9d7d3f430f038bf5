use std::time::Duration as StdDuration;

use kg_common::DeadLetterRecord;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::{dead_letter, Result};

/// Background sweep loop, mirroring the polling loop pattern used for
/// queue-processor background work elsewhere in this corpus: runs until
/// cancelled, releasing nothing itself (expired leases are simply
/// re-pollable via `visible_at <= now()`) but promoting exhausted
/// deliveries to the dead-letter table.
pub async fn run(pool: PgPool, queue_name: String, max_retries: i32, interval: StdDuration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = promote_exhausted(&pool, &queue_name, max_retries).await {
            warn!(error = %e, "dead-letter sweep failed");
        }
    }
}

async fn promote_exhausted(pool: &PgPool, queue_name: &str, max_retries: i32) -> Result<()> {
    let rows = sqlx::query_as::<_, ExhaustedRow>(
        r#"
        DELETE FROM queue_messages
        WHERE queue_name = $1 AND delivery_count >= $2 AND dead_lettered = false
        RETURNING id, contents, delivery_count
        "#,
    )
    .bind(queue_name)
    .bind(max_retries)
    .fetch_all(pool)
    .await?;

    for row in &rows {
        let record = DeadLetterRecord {
            task_id: row.id.to_string(),
            original_payload: serde_json::from_slice(&row.contents).unwrap_or(serde_json::Value::Null),
            failure_reason: format!("retries exhausted after {} deliveries", row.delivery_count),
            failed_at: chrono::Utc::now(),
            retry_count: row.delivery_count as u32,
        };
        dead_letter::record(pool, &record).await?;
    }

    if !rows.is_empty() {
        info!(queue_name, count = rows.len(), "promoted exhausted tasks to dead-letter table");
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
struct ExhaustedRow {
    id: uuid::Uuid,
    contents: Vec<u8>,
    delivery_count: i32,
}
