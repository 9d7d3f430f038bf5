//! Producer-side wrapper (C8): builds `IngestionTask` envelopes from domain
//! objects and pushes them onto a named queue. Grounded on
//! `graph_service/queue_proxy.py`'s `QueueProxy` — `is_healthy`/`send_to_queue`
//! collapse here into `is_healthy`/`enqueue`, with the msgpack/httpx
//! transport replaced by the in-process `Queue` this workspace already has.

use chrono::Utc;
use kg_common::{IngestionTask, TaskPriority, TaskType};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{PushMessage, Queue, Result};

/// Wraps a `Queue`, handing producers a narrower surface than the full
/// poll/delete API the worker uses.
pub struct QueueProxy {
    queue: Queue,
    visibility_timeout_secs: i64,
}

impl QueueProxy {
    pub fn new(queue: Queue, visibility_timeout_secs: i64) -> Self {
        Self { queue, visibility_timeout_secs }
    }

    /// Verifies the backing queue is reachable by checking it holds (or has
    /// ever held) messages under its name; an empty-but-reachable queue
    /// still counts healthy since `depth()` succeeding is the real signal.
    pub async fn is_healthy(&self) -> bool {
        self.queue.depth().await.is_ok()
    }

    /// Builds and pushes an `episode` task for an ingested message, with
    /// default priority `NORMAL` and `max_retries = 3` (§4.8).
    pub async fn enqueue_message(&self, group_id: String, payload: serde_json::Value) -> Result<Uuid> {
        self.enqueue(TaskType::Episode, group_id, payload).await
    }

    async fn enqueue(&self, task_type: TaskType, group_id: String, payload: serde_json::Value) -> Result<Uuid> {
        let task = IngestionTask {
            id: Uuid::new_v4().to_string(),
            task_type,
            payload,
            group_id,
            priority: TaskPriority::Normal,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        };

        let message = PushMessage {
            contents: serde_json::to_vec(&task).unwrap_or_default(),
            visibility_timeout_secs: self.visibility_timeout_secs,
            priority: task.priority,
        };

        let ids = self.queue.push(vec![message]).await?;
        Ok(ids.into_iter().next().unwrap_or_else(Uuid::nil))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priority_and_retry_match_documented_values() {
        let task = IngestionTask {
            id: "t1".to_string(),
            task_type: TaskType::Episode,
            payload: serde_json::json!({}),
            group_id: "g1".to_string(),
            priority: TaskPriority::default(),
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        };
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.max_retries, 3);
    }
}
