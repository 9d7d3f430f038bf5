//! Resolution & Deduplication Engine (C6): maps candidate entities/edges
//! produced by `kg-extract` onto canonical graph nodes/edges, via a layered
//! match-then-decide shape: a pure decision function split between "what
//! matched" and "what to do about it".

use chrono::Utc;
use futures::future::join_all;
use kg_common::{normalize, CanonicalityEdge, EntityEdge, EntityNode};
use kg_extract::{CandidateEdge, CandidateEntity};
use kg_graph::{GraphStore, ScoredMatch};
use kg_llm::{LlmAdapter, ModelTier};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("graph store error: {0}")]
    Graph(#[from] neo4rs::Error),
}

#[derive(Debug, Clone)]
pub struct ResolveConfig {
    pub sim_high: f64,
    pub name_exact: f64,
    pub edge_sim: f64,
    pub enable_cross_graph_deduplication: bool,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self { sim_high: 0.92, name_exact: 0.95, edge_sim: 0.95, enable_cross_graph_deduplication: false }
    }
}

/// Pure decision for a single candidate's node-resolution outcome (§4.6.1),
/// separated from the I/O that gathers `exact`/`vector` so it can be unit
/// tested without a store.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeVerdict {
    ExactMatch(Uuid),
    VectorMatch(Uuid),
    NoMatch,
}

/// §4.6.3: two names must not be merged by vector similarity alone when one
/// is a proper whitespace-token prefix/suffix of the other.
pub fn is_compound_split(a: &str, b: &str) -> bool {
    let ta: Vec<&str> = a.split_whitespace().collect();
    let tb: Vec<&str> = b.split_whitespace().collect();
    if ta == tb || ta.is_empty() || tb.is_empty() {
        return false;
    }
    let (shorter, longer) = if ta.len() < tb.len() { (&ta, &tb) } else { (&tb, &ta) };
    !shorter.is_empty() && longer.starts_with(shorter.as_slice())
}

/// §4.6.1 steps 1-2 as a pure function: given the candidate's own normalized
/// name, the exact-match rows, and the (entity, score) vector-match rows
/// already filtered to `>= sim_high`, decide the verdict.
pub fn decide_node_verdict(
    candidate_name: &str,
    exact_matches: &[EntityNode],
    vector_matches: &[(EntityNode, f64)],
) -> NodeVerdict {
    if exact_matches.len() == 1 {
        return NodeVerdict::ExactMatch(exact_matches[0].uuid);
    }
    let eligible: Vec<&(EntityNode, f64)> = vector_matches
        .iter()
        .filter(|(e, _)| !is_compound_split(candidate_name, &e.name))
        .collect();
    if eligible.len() == 1 {
        return NodeVerdict::VectorMatch(eligible[0].0.uuid);
    }
    NodeVerdict::NoMatch
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ContradictionCheck {
    contradicts: bool,
}

pub struct ResolveEngine {
    store: GraphStore,
    llm: LlmAdapter,
    config: ResolveConfig,
}

impl ResolveEngine {
    pub fn new(store: GraphStore, llm: LlmAdapter, config: ResolveConfig) -> Self {
        Self { store, llm, config }
    }

    /// §4.6.1, run concurrently across all candidates in one phase per step
    /// (exact lookups, then vector lookups, then inserts) rather than a
    /// single SQL/Cypher batch call, since `GraphStore`'s adapter surface is
    /// per-entity; this keeps the "one round-trip per phase" spirit of
    /// §4.6.5 without requiring a dedicated batch Cypher statement.
    pub async fn resolve_entities(
        &self,
        group_id: &str,
        candidates: &[CandidateEntity],
    ) -> Result<HashMap<String, Uuid>, ResolveError> {
        let normalized: Vec<String> = candidates.iter().map(|c| normalize(&c.name)).collect();

        let exact_futures = normalized.iter().map(|norm| {
            self.store.find_by_normalized_name(norm, group_id, false)
        });
        let exact_results: Vec<Vec<EntityNode>> = join_all(exact_futures)
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;

        let vector_futures = candidates.iter().map(|c| {
            self.store.vector_search_entities(&c.name_embedding, group_id, false, 5, self.config.sim_high)
        });
        let vector_results: Vec<Vec<ScoredMatch>> = join_all(vector_futures)
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;

        let mut resolved = HashMap::new();

        for (i, candidate) in candidates.iter().enumerate() {
            let exact = &exact_results[i];
            let mut vector_entities = Vec::new();
            for m in &vector_results[i] {
                if let Some(entity) = self.store.get_entity(m.uuid).await? {
                    vector_entities.push((entity, m.score));
                }
            }

            let verdict = decide_node_verdict(&candidate.name, exact, &vector_entities);

            let uuid = match verdict {
                NodeVerdict::ExactMatch(uuid) | NodeVerdict::VectorMatch(uuid) => uuid,
                NodeVerdict::NoMatch => {
                    if self.config.enable_cross_graph_deduplication {
                        self.try_cross_group_match(group_id, candidate, &normalized[i]).await?
                    } else {
                        self.create_entity(group_id, candidate, &normalized[i]).await?
                    }
                }
            };

            resolved.insert(candidate.name.clone(), uuid);
        }

        Ok(resolved)
    }

    async fn try_cross_group_match(
        &self,
        group_id: &str,
        candidate: &CandidateEntity,
        normalized_name: &str,
    ) -> Result<Uuid, ResolveError> {
        let exact = self.store.find_by_normalized_name(normalized_name, group_id, true).await?;
        let cross_exact: Vec<EntityNode> = exact.into_iter().filter(|e| e.group_id != group_id).collect();

        let vector = self
            .store
            .vector_search_entities(&candidate.name_embedding, group_id, true, 5, self.config.sim_high)
            .await?;
        let mut vector_entities = Vec::new();
        for m in &vector {
            if let Some(entity) = self.store.get_entity(m.uuid).await? {
                if entity.group_id != group_id {
                    vector_entities.push((entity, m.score));
                }
            }
        }

        let verdict = decide_node_verdict(&candidate.name, &cross_exact, &vector_entities);
        match verdict {
            NodeVerdict::ExactMatch(m) | NodeVerdict::VectorMatch(m) => {
                let canonical = self.store.resolve_canonical(m).await?;
                let new_entity = self.new_entity_node(group_id, candidate, normalized_name);
                self.store.upsert_entity(&new_entity).await?;
                self.store.set_normalized_name(new_entity.uuid, normalized_name).await?;
                self.store
                    .create_canonicality_edge(&CanonicalityEdge {
                        source_uuid: new_entity.uuid,
                        target_uuid: canonical,
                        created_at: Utc::now(),
                    })
                    .await?;
                info!(new = %new_entity.uuid, canonical = %canonical, "cross-group canonicalization");
                Ok(canonical)
            }
            NodeVerdict::NoMatch => self.create_entity(group_id, candidate, normalized_name).await,
        }
    }

    async fn create_entity(
        &self,
        group_id: &str,
        candidate: &CandidateEntity,
        normalized_name: &str,
    ) -> Result<Uuid, ResolveError> {
        let entity = self.new_entity_node(group_id, candidate, normalized_name);
        self.store.upsert_entity(&entity).await?;
        self.store.set_normalized_name(entity.uuid, normalized_name).await?;
        Ok(entity.uuid)
    }

    fn new_entity_node(&self, group_id: &str, candidate: &CandidateEntity, _normalized_name: &str) -> EntityNode {
        let mut entity = EntityNode::new(group_id, candidate.name.clone());
        entity.labels = vec![candidate.entity_type.clone()];
        entity.attributes = candidate.attributes.clone();
        entity.name_embedding = Some(candidate.name_embedding.clone());
        entity.pending_embedding = candidate.name_embedding.is_empty();
        entity
    }

    /// §4.6.2: resolve and persist one candidate edge given the already
    /// resolved `source`/`target` node uuids.
    pub async fn resolve_edge(
        &self,
        group_id: &str,
        edge: &CandidateEdge,
        source: Uuid,
        target: Uuid,
        episode_uuid: Uuid,
    ) -> Result<Uuid, ResolveError> {
        let existing = self.store.edges_between(source, target).await?;

        let normalized_relation = normalize(&edge.relation);
        for existing_edge in &existing {
            if normalize(&existing_edge.name) != normalized_relation {
                continue;
            }
            let Some(existing_embedding) = &existing_edge.fact_embedding else { continue };
            let score = kg_graph::cosine_similarity(existing_embedding, &edge.fact_embedding);
            if score >= self.config.edge_sim {
                self.store.append_provenance(existing_edge.uuid, episode_uuid).await?;
                info!(edge = %existing_edge.uuid, score, "merged into existing edge");
                return Ok(existing_edge.uuid);
            }
        }

        for existing_edge in &existing {
            if normalize(&existing_edge.name) != normalized_relation || existing_edge.invalid_at.is_some() {
                continue;
            }
            if self.facts_contradict(&existing_edge.fact, &edge.fact).await {
                self.store.invalidate_edge(existing_edge.uuid, edge.valid_at).await?;
                warn!(edge = %existing_edge.uuid, "invalidated contradicted edge");
            }
        }

        let new_edge = EntityEdge {
            uuid: Uuid::new_v4(),
            group_id: group_id.to_string(),
            name: normalized_relation,
            fact: edge.fact.clone(),
            source_node_uuid: source,
            target_node_uuid: target,
            fact_embedding: Some(edge.fact_embedding.clone()),
            valid_at: edge.valid_at,
            invalid_at: None,
            created_at: Utc::now(),
            expired_at: None,
            provenance: vec![episode_uuid],
        };
        self.store.upsert_edge(&new_edge).await?;
        Ok(new_edge.uuid)
    }

    /// §4.6.2 step 3: a single `small`-tier LLM call per candidate edge that
    /// reaches this far (merges already exited above).
    async fn facts_contradict(&self, existing_fact: &str, new_fact: &str) -> bool {
        let system = "You check whether two stated facts about the same relationship directly \
                       contradict each other (one asserts the opposite of the other), as opposed \
                       to simply being different details about the same ongoing relationship.";
        let user = format!("Existing fact: {existing_fact}\nNew fact: {new_fact}\n\nDo they contradict?");
        match self.llm.complete_json::<ContradictionCheck>(system, &user, ModelTier::Small, Some(0.0)).await {
            Ok(result) => result.contradicts,
            Err(e) => {
                warn!(error = %e, "contradiction check failed, assuming no contradiction");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as Map;

    fn entity(name: &str, group_id: &str) -> EntityNode {
        EntityNode::new(group_id, name)
    }

    #[test]
    fn compound_split_detects_prefix_relationship() {
        assert!(is_compound_split("Claude", "Claude Code"));
        assert!(is_compound_split("GitHub Actions", "GitHub"));
        assert!(!is_compound_split("Claude", "Claude"));
        assert!(!is_compound_split("Claude", "Anthropic"));
    }

    #[test]
    fn exact_match_wins_when_unique() {
        let e = entity("Jane Doe", "g1");
        let verdict = decide_node_verdict("Jane Doe", &[e.clone()], &[]);
        assert_eq!(verdict, NodeVerdict::ExactMatch(e.uuid));
    }

    #[test]
    fn vector_match_used_when_no_exact_and_unique() {
        let e = entity("Jane Doe", "g1");
        let verdict = decide_node_verdict("Jane Doe", &[], &[(e.clone(), 0.95)]);
        assert_eq!(verdict, NodeVerdict::VectorMatch(e.uuid));
    }

    #[test]
    fn vector_match_rejected_for_compound_split() {
        let e = entity("Claude Code", "g1");
        let verdict = decide_node_verdict("Claude", &[], &[(e, 0.97)]);
        assert_eq!(verdict, NodeVerdict::NoMatch);
    }

    #[test]
    fn no_match_when_multiple_vector_candidates_tie() {
        let a = entity("Jane Doe", "g1");
        let b = entity("Jane D.", "g1");
        let verdict = decide_node_verdict("Jane Doe", &[], &[(a, 0.93), (b, 0.93)]);
        assert_eq!(verdict, NodeVerdict::NoMatch);
    }

    #[test]
    fn resolved_map_is_keyed_by_original_candidate_name() {
        let mut resolved: Map<String, Uuid> = Map::new();
        resolved.insert("Jane Doe".to_string(), Uuid::new_v4());
        assert!(resolved.contains_key("Jane Doe"));
        let _ = Utc::now();
    }
}
