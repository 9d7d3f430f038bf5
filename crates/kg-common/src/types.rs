use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Centrality scores attached to an [`EntityNode`]. All fields lie in `[0,1]`
/// when present (invariant 4).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
pub struct Centrality {
    #[serde(default)]
    pub pagerank: Option<f64>,
    #[serde(default)]
    pub degree: Option<f64>,
    #[serde(default)]
    pub betweenness: Option<f64>,
    #[serde(default)]
    pub importance: Option<f64>,
}

/// A single input message with provenance; the atomic unit of ingestion.
/// Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub uuid: Uuid,
    pub group_id: String,
    pub name: String,
    pub content: String,
    pub role: Option<String>,
    pub role_type: String,
    pub source: Option<String>,
    pub source_description: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A named referent extracted from episodes. Mutable: summary and
/// attributes may be updated after creation; identity is `uuid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    pub uuid: Uuid,
    pub group_id: String,
    pub name: String,
    pub summary: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub name_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub pending_embedding: bool,
    #[serde(default)]
    pub centrality: Centrality,
    pub created_at: DateTime<Utc>,
}

impl EntityNode {
    pub fn new(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            group_id: group_id.into(),
            name: name.into(),
            summary: String::new(),
            labels: Vec::new(),
            attributes: HashMap::new(),
            name_embedding: None,
            pending_embedding: true,
            centrality: Centrality::default(),
            created_at: Utc::now(),
        }
    }
}

/// A timestamped directed relationship ("fact") between two [`EntityNode`]s.
/// `invalid_at`/`expired_at` permit temporal invalidation without deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEdge {
    pub uuid: Uuid,
    pub group_id: String,
    pub name: String,
    pub fact: String,
    pub source_node_uuid: Uuid,
    pub target_node_uuid: Uuid,
    #[serde(default)]
    pub fact_embedding: Option<Vec<f32>>,
    pub valid_at: DateTime<Utc>,
    #[serde(default)]
    pub invalid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
    /// Episodes that have contributed corroborating mentions of this fact.
    #[serde(default)]
    pub provenance: Vec<Uuid>,
}

/// Special directed edge between two EntityNodes in different `group_id`s
/// indicating they refer to the same real-world referent; the target is
/// canonical (invariant 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalityEdge {
    pub source_uuid: Uuid,
    pub target_uuid: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Queue task type, dispatched on by the Ingestion Worker (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Episode,
    Entity,
    Relationship,
    Deduplication,
}

/// Queue priority. Numeric repr is the wire value; the string form is what
/// producer-facing code names. Mapping is `{LOW:0, NORMAL:1, HIGH:2, CRITICAL:3}`,
/// taken from the original queue proxy's `priority_map` (§9 open question,
/// resolved in SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[repr(u8)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::Critical,
            _ => Self::Normal,
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "NORMAL" => Ok(Self::Normal),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown TaskPriority: {other}")),
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// Queue payload envelope (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub group_id: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl IngestionTask {
    /// A stable content fingerprint used for idempotence checks alongside
    /// `id` (invariant 8).
    pub fn content_fingerprint(&self) -> String {
        let raw = format!("{}:{}:{}", self.task_type_str(), self.group_id, self.payload);
        format!("{:x}", simple_fnv1a(raw.as_bytes()))
    }

    fn task_type_str(&self) -> &'static str {
        match self.task_type {
            TaskType::Episode => "episode",
            TaskType::Entity => "entity",
            TaskType::Relationship => "relationship",
            TaskType::Deduplication => "deduplication",
        }
    }
}

fn simple_fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// A dead-lettered task: retries exhausted or an unrecoverable error was hit.
/// The original payload is preserved verbatim (§8 invariant 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task_id: String,
    pub original_payload: serde_json::Value,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Emitted on every read path that touches named uuids (search result, edge
/// lookup, memory retrieval) and fanned out by the dispatcher (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAccessEvent {
    #[serde(default = "node_access_event_type")]
    pub event_type: String,
    pub node_ids: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub access_type: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn node_access_event_type() -> String {
    "node_access".to_string()
}

/// Emitted by the Ingestion Worker on commit with the set of created/updated
/// uuids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMutationEvent {
    #[serde(default = "node_mutation_event_type")]
    pub event_type: String,
    pub group_id: String,
    pub created_node_uuids: Vec<Uuid>,
    pub updated_node_uuids: Vec<Uuid>,
    pub created_edge_uuids: Vec<Uuid>,
    pub timestamp: DateTime<Utc>,
}

fn node_mutation_event_type() -> String {
    "node_mutation".to_string()
}

/// Relevance-feedback input accepted by C11: `{query_id, query_text,
/// memory_scores, response_text}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceFeedback {
    pub query_id: Uuid,
    pub query_text: String,
    pub memory_scores: HashMap<Uuid, f64>,
    pub response_text: String,
}

/// Validates `group_id` against invariant 2: `[A-Za-z0-9_\-]+`, never empty.
pub fn is_valid_group_id(group_id: &str) -> bool {
    !group_id.is_empty()
        && group_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_validation() {
        assert!(is_valid_group_id("g1"));
        assert!(is_valid_group_id("team_alpha-2024"));
        assert!(!is_valid_group_id(""));
        assert!(!is_valid_group_id("has space"));
        assert!(!is_valid_group_id("has/slash"));
    }

    #[test]
    fn task_priority_roundtrips_through_wire_mapping() {
        assert_eq!(TaskPriority::Low.as_u8(), 0);
        assert_eq!(TaskPriority::Normal.as_u8(), 1);
        assert_eq!(TaskPriority::High.as_u8(), 2);
        assert_eq!(TaskPriority::Critical.as_u8(), 3);
        assert_eq!(TaskPriority::from_u8(2), TaskPriority::High);
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
    }

    #[test]
    fn content_fingerprint_is_stable_for_identical_tasks() {
        let task = IngestionTask {
            id: "t1".to_string(),
            task_type: TaskType::Episode,
            payload: serde_json::json!({"content": "hi"}),
            group_id: "g1".to_string(),
            priority: TaskPriority::Normal,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        };
        let mut other = task.clone();
        other.id = "t2".to_string();
        assert_eq!(task.content_fingerprint(), other.content_fingerprint());
    }
}
