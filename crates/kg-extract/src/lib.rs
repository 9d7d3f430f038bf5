//! Extraction Engine (C5): turns an Episode into candidate entities and
//! edges via two `large`-tier LLM calls plus a batch embedding call.
//!
//! Name normalization and the stop-word/length guards below are kept
//! private to this module rather than exposed as shared utilities; they're
//! behavior belonging to the extraction step, not process-wide state.

use chrono::{DateTime, Utc};
use kg_common::Episode;
use kg_embed::{EmbedError, TextEmbedder};
use kg_llm::{LlmAdapter, LlmFailure, ModelTier};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};

const MAX_NAME_LEN: usize = 200;
/// §4.3: entity/edge extraction calls run at temperature 0.1, not the
/// provider client's deduplication-oriented 0.0 default.
const EXTRACTION_TEMPERATURE: f32 = 0.1;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("entity extraction failed: {0}")]
    EntitySchema(#[from] LlmFailure),
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct EntityLlm {
    name: String,
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(default)]
    attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct EntityExtractionResponse {
    #[serde(default)]
    entities: Vec<EntityLlm>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct EdgeLlm {
    source: String,
    relation: String,
    target: String,
    fact: String,
    #[serde(default)]
    valid_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct EdgeExtractionResponse {
    #[serde(default)]
    edges: Vec<EdgeLlm>,
}

/// A candidate entity, not yet resolved against the graph.
#[derive(Debug, Clone)]
pub struct CandidateEntity {
    pub name: String,
    pub entity_type: String,
    pub attributes: HashMap<String, serde_json::Value>,
    pub name_embedding: Vec<f32>,
}

/// A candidate edge, referencing entities by name (resolved to uuids later).
#[derive(Debug, Clone)]
pub struct CandidateEdge {
    pub source_name: String,
    pub relation: String,
    pub target_name: String,
    pub fact: String,
    pub fact_embedding: Vec<f32>,
    pub valid_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub entities: Vec<CandidateEntity>,
    pub edges: Vec<CandidateEdge>,
    /// Set when extraction produced zero entities; the caller persists the
    /// episode anyway and marks it via `GraphStore::mark_extraction_empty`.
    pub is_empty: bool,
}

pub struct ExtractionEngine<E: TextEmbedder> {
    llm: LlmAdapter,
    embedder: E,
    context_window: u32,
}

impl<E: TextEmbedder> ExtractionEngine<E> {
    pub fn new(llm: LlmAdapter, embedder: E) -> Self {
        Self { llm, embedder, context_window: 10 }
    }

    pub fn with_context_window(mut self, n: u32) -> Self {
        self.context_window = n;
        self
    }

    pub fn context_window(&self) -> u32 {
        self.context_window
    }

    /// Run the full pipeline: entity extraction, edge extraction, name
    /// normalization, validity filtering, and batch embedding.
    pub async fn extract(
        &self,
        episode: &Episode,
        context: &[Episode],
    ) -> Result<ExtractionResult, ExtractError> {
        let prompt_context = build_context_block(context);

        let entity_system = entity_system_prompt();
        let entity_user = format!(
            "{prompt_context}## Episode to extract from\nRole: {}\n\n{}",
            episode.role.as_deref().unwrap_or("unknown"),
            episode.content
        );
        let entity_response: EntityExtractionResponse = self
            .llm
            .complete_json(&entity_system, &entity_user, ModelTier::Large, Some(EXTRACTION_TEMPERATURE))
            .await?;

        let mut entity_names: Vec<String> = Vec::new();
        let mut entities: Vec<CandidateEntity> = Vec::new();
        for raw in entity_response.entities {
            let name = normalize_name(&raw.name);
            if !is_valid_entity_name(&name) {
                continue;
            }
            entity_names.push(name.clone());
            entities.push(CandidateEntity {
                name,
                entity_type: raw.entity_type,
                attributes: raw.attributes,
                name_embedding: Vec::new(),
            });
        }

        if entities.is_empty() {
            info!(episode_uuid = %episode.uuid, "extraction produced zero entities");
            return Ok(ExtractionResult { entities, edges: Vec::new(), is_empty: true });
        }

        let edge_system = edge_system_prompt();
        let edge_user = format!(
            "{prompt_context}## Episode to extract from\n{}\n\n## Known entities\n{}",
            episode.content,
            entity_names.join(", ")
        );
        let edge_response: EdgeExtractionResponse = self
            .llm
            .complete_json(&edge_system, &edge_user, ModelTier::Large, Some(EXTRACTION_TEMPERATURE))
            .await?;

        let valid_names: std::collections::HashSet<&str> =
            entity_names.iter().map(|s| s.as_str()).collect();

        let mut edges: Vec<CandidateEdge> = Vec::new();
        for raw in edge_response.edges {
            let source = normalize_name(&raw.source);
            let target = normalize_name(&raw.target);
            if !valid_names.contains(source.as_str()) || !valid_names.contains(target.as_str()) {
                warn!(source, target, "discarding edge referencing unknown entity");
                continue;
            }
            let valid_at = raw
                .valid_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(episode.timestamp);
            edges.push(CandidateEdge {
                source_name: source,
                relation: normalize_name(&raw.relation),
                target_name: target,
                fact: raw.fact,
                fact_embedding: Vec::new(),
                valid_at,
            });
        }

        let name_texts: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
        let name_vectors = self.embedder.embed_batch(name_texts).await?;
        for (entity, vector) in entities.iter_mut().zip(name_vectors) {
            entity.name_embedding = vector;
        }

        if !edges.is_empty() {
            let fact_texts: Vec<String> = edges.iter().map(|e| e.fact.clone()).collect();
            let fact_vectors = self.embedder.embed_batch(fact_texts).await?;
            for (edge, vector) in edges.iter_mut().zip(fact_vectors) {
                edge.fact_embedding = vector;
            }
        }

        info!(
            episode_uuid = %episode.uuid,
            entities = entities.len(),
            edges = edges.len(),
            "extraction complete"
        );

        Ok(ExtractionResult { entities, edges, is_empty: false })
    }
}

fn build_context_block(context: &[Episode]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let mut block = String::from("## Recent context\n");
    for ep in context {
        block.push_str(&format!("- ({}) {}\n", ep.role_type, truncate(&ep.content, 280)));
    }
    block.push('\n');
    block
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect::<String>() + "…"
}

/// Strip surrounding quotes/backticks, collapse internal whitespace,
/// preserve case (§4.5 step 4).
fn normalize_name(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_valid_entity_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.chars().all(|c| c.is_ascii_digit())
}

fn entity_system_prompt() -> String {
    "You are an entity extractor for a knowledge graph. Read the episode content and \
     return every distinct named entity mentioned (people, organizations, places, concepts, \
     products). For each entity return its canonical name, a type label, and a small \
     attributes map of any facts stated directly about it. Do not invent entities not \
     present in the text. Return an empty entities array if none are found."
        .to_string()
}

fn edge_system_prompt() -> String {
    "You are a relationship extractor for a knowledge graph. Given episode content and a \
     list of known entity names, return every directed relationship between two entities \
     from that list. Each edge needs a source name, a relation label, a target name, a \
     one-sentence fact describing the relationship, and an optional ISO 8601 valid_at \
     timestamp if the text states when the relationship became true. Only reference \
     entities from the provided list; omit anything else."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_name_strips_quotes_and_collapses_whitespace() {
        assert_eq!(normalize_name("  `Jane   Doe`  "), "Jane Doe");
        assert_eq!(normalize_name("\"Acme Corp\""), "Acme Corp");
    }

    #[test]
    fn invalid_entity_names_are_rejected() {
        assert!(!is_valid_entity_name(""));
        assert!(!is_valid_entity_name("12345"));
        assert!(!is_valid_entity_name(&"x".repeat(MAX_NAME_LEN + 1)));
        assert!(is_valid_entity_name("Jane Doe"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "hello world";
        assert_eq!(truncate(s, 5), "hello…");
        assert_eq!(truncate(s, 100), "hello world");
    }

    #[test]
    fn context_block_empty_for_no_episodes() {
        assert_eq!(build_context_block(&[]), "");
    }
}
