//! Ingestion Worker (C7): `received -> extracting -> resolving -> persisting
//! -> acked`, a literal poll/ack cycle against C1.
//!
//! A bounded-concurrency drain loop, one outcome enum per task, and a
//! single place (`process_one`) where success/retry/dead-letter is decided.

use chrono::{DateTime, Utc};
use kg_common::{DeadLetterRecord, EventSink, IngestError, NodeMutationEvent, TaskType};
use kg_embed::TextEmbedder;
use kg_extract::ExtractionEngine;
use kg_graph::GraphStore;
use kg_queue::{dead_letter, PolledMessage, Queue};
use kg_resolve::ResolveEngine;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The wire payload for an `episode` task (§4.7 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodePayload {
    pub uuid: Uuid,
    pub group_id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_role_type")]
    pub role_type: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_description: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_role_type() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskEnvelope {
    id: String,
    #[serde(rename = "type")]
    task_type: TaskType,
    payload: serde_json::Value,
    group_id: String,
    #[serde(default)]
    max_retries: u32,
}

pub struct WorkerConfig {
    pub batch_size: i64,
    pub visibility_timeout_secs: i64,
    pub parallelism: usize,
    pub max_retries: u32,
    pub poll_interval: Duration,
    /// This worker's slot in a hash-partitioned pool; `None` means "own
    /// every group" (single-worker deployments).
    pub partition: Option<(u32, u32)>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            visibility_timeout_secs: 300,
            parallelism: 8,
            max_retries: 3,
            poll_interval: Duration::from_millis(500),
            partition: None,
        }
    }
}

/// Hash-partition check (§4.7 Ordering): a worker only accepts tasks for
/// `group_id`s that hash into its slot, so per-group ordering is preserved
/// without a distributed lock.
pub fn owns_group(group_id: &str, partition: Option<(u32, u32)>) -> bool {
    let Some((index, count)) = partition else { return true };
    if count == 0 {
        return true;
    }
    let mut hasher = DefaultHasher::new();
    group_id.hash(&mut hasher);
    (hasher.finish() % count as u64) as u32 == index
}

pub struct Worker<E: TextEmbedder> {
    queue: Queue,
    store: Arc<GraphStore>,
    extractor: Arc<ExtractionEngine<E>>,
    resolver: Arc<ResolveEngine>,
    sink: Arc<dyn EventSink>,
    config: WorkerConfig,
}

impl<E: TextEmbedder + 'static> Worker<E> {
    pub fn new(
        queue: Queue,
        store: Arc<GraphStore>,
        extractor: Arc<ExtractionEngine<E>>,
        resolver: Arc<ResolveEngine>,
        sink: Arc<dyn EventSink>,
        config: WorkerConfig,
    ) -> Self {
        Self { queue, store, extractor, resolver, sink, config }
    }

    /// Runs forever: poll, spawn up to `parallelism` concurrent tasks, sleep,
    /// repeat. Intended to run inside its own `tokio::task`.
    pub async fn run(self: Arc<Self>) -> ! {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        loop {
            match self.queue.poll(self.config.batch_size, self.config.visibility_timeout_secs).await {
                Ok(messages) => {
                    for msg in messages {
                        let worker = Arc::clone(&self);
                        let permit = Arc::clone(&semaphore);
                        tokio::spawn(async move {
                            let _permit = permit.acquire_owned().await;
                            worker.process_one(msg).await;
                        });
                    }
                }
                Err(e) => warn!(error = %e, "queue poll failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn process_one(&self, msg: PolledMessage) {
        let envelope: TaskEnvelope = match serde_json::from_slice(&msg.contents) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "malformed task envelope, dead-lettering");
                self.dead_letter(&msg, "malformed envelope", e.to_string()).await;
                return;
            }
        };

        if !owns_group(&envelope.group_id, self.config.partition) {
            // Not ours; leave it for the owning worker to pick up after the
            // visibility timeout expires.
            return;
        }

        let max_retries = if envelope.max_retries == 0 { self.config.max_retries } else { envelope.max_retries };

        match self.dispatch(&envelope).await {
            Ok(mutation) => {
                if let Err(e) = self.queue.delete(msg.id, msg.poll_tag).await {
                    warn!(error = %e, "ack delete failed (likely already redelivered)");
                    return;
                }
                self.sink.emit_node_mutation(mutation).await;
            }
            Err(err) if err.is_retryable() && msg.delivery_count < max_retries as i32 => {
                info!(task_id = envelope.id, delivery_count = msg.delivery_count, error = %err, "retryable failure, leaving unacked");
            }
            Err(err) => {
                error!(task_id = envelope.id, error = %err, "unrecoverable failure, dead-lettering");
                self.dead_letter(&msg, &envelope.id, err.dead_letter_reason()).await;
                let _ = self.queue.delete(msg.id, msg.poll_tag).await;
            }
        }
    }

    async fn dead_letter(&self, msg: &PolledMessage, task_id: &str, reason: String) {
        let payload: serde_json::Value =
            serde_json::from_slice(&msg.contents).unwrap_or(serde_json::Value::Null);
        let record = DeadLetterRecord {
            task_id: task_id.to_string(),
            original_payload: payload,
            failure_reason: reason,
            failed_at: Utc::now(),
            retry_count: msg.delivery_count as u32,
        };
        if let Err(e) = dead_letter::record(self.store_pool(), &record).await {
            error!(error = %e, "failed to write dead-letter record");
        }
    }

    /// The dead-letter table lives in the same Postgres database as the
    /// queue; `GraphStore` doesn't carry a `PgPool`, so the caller supplies
    /// one via `Queue`'s pool indirectly through this accessor kept private
    /// to avoid exposing sqlx types on `GraphStore`'s public surface.
    fn store_pool(&self) -> &sqlx::PgPool {
        self.queue.pool()
    }

    async fn dispatch(&self, envelope: &TaskEnvelope) -> Result<NodeMutationEvent, IngestError> {
        match envelope.task_type {
            TaskType::Episode => self.process_episode(envelope).await,
            TaskType::Entity | TaskType::Relationship | TaskType::Deduplication => {
                // Scoped variants of the same pipeline; episode-only flow is
                // implemented first and these dispatch into the same path
                // since all three are subsets of it.
                self.process_episode(envelope).await
            }
        }
    }

    async fn process_episode(&self, envelope: &TaskEnvelope) -> Result<NodeMutationEvent, IngestError> {
        let payload: EpisodePayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| IngestError::Validation(e.to_string()))?;

        if self.store.episode_exists(payload.uuid).await? {
            info!(episode = %payload.uuid, "episode already persisted, skipping extraction");
            return Ok(NodeMutationEvent {
                event_type: "node_mutation".to_string(),
                group_id: payload.group_id,
                created_node_uuids: Vec::new(),
                updated_node_uuids: Vec::new(),
                created_edge_uuids: Vec::new(),
                timestamp: Utc::now(),
            });
        }

        let episode = kg_common::Episode {
            uuid: payload.uuid,
            group_id: payload.group_id.clone(),
            name: payload.name,
            content: payload.content,
            role: payload.role,
            role_type: payload.role_type,
            source: payload.source,
            source_description: payload.source_description,
            timestamp: payload.timestamp,
            created_at: Utc::now(),
        };
        self.store.create_episode(&episode).await?;

        let context = self
            .store
            .recent_episodes(&episode.group_id, self.extractor.context_window())
            .await?;

        let extraction = self
            .extractor
            .extract(&episode, &context)
            .await
            .map_err(|e| IngestError::TransientAdapter(e.to_string()))?;

        if extraction.is_empty {
            self.store.mark_extraction_empty(episode.uuid).await?;
            return Ok(NodeMutationEvent {
                event_type: "node_mutation".to_string(),
                group_id: episode.group_id,
                created_node_uuids: Vec::new(),
                updated_node_uuids: Vec::new(),
                created_edge_uuids: Vec::new(),
                timestamp: Utc::now(),
            });
        }

        let resolved = self.resolver.resolve_entities(&episode.group_id, &extraction.entities).await?;

        for uuid in resolved.values() {
            self.store.link_mention(episode.uuid, *uuid).await?;
        }

        let mut created_edges = Vec::new();
        for edge in &extraction.edges {
            let (Some(&src), Some(&tgt)) = (resolved.get(&edge.source_name), resolved.get(&edge.target_name)) else {
                continue;
            };
            let edge_uuid = self.resolver.resolve_edge(&episode.group_id, edge, src, tgt, episode.uuid).await?;
            created_edges.push(edge_uuid);
        }

        Ok(NodeMutationEvent {
            event_type: "node_mutation".to_string(),
            group_id: episode.group_id,
            created_node_uuids: resolved.values().copied().collect(),
            updated_node_uuids: Vec::new(),
            created_edge_uuids: created_edges,
            timestamp: Utc::now(),
        })
    }
}

impl From<kg_resolve::ResolveError> for IngestError {
    fn from(e: kg_resolve::ResolveError) -> Self {
        IngestError::TransientAdapter(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owns_group_with_no_partition_owns_everything() {
        assert!(owns_group("any-group", None));
    }

    #[test]
    fn owns_group_is_deterministic() {
        let a = owns_group("group-1", Some((0, 4)));
        let b = owns_group("group-1", Some((0, 4)));
        assert_eq!(a, b);
    }

    #[test]
    fn owns_group_partitions_across_exactly_one_slot() {
        let owners: Vec<bool> = (0..4).map(|i| owns_group("group-7", Some((i, 4)))).collect();
        assert_eq!(owners.iter().filter(|&&owned| owned).count(), 1);
    }
}
