use chrono::{DateTime, Utc};
use kg_common::{CanonicalityEdge, EntityEdge, EntityNode, Episode};
use neo4rs::{query, BoltFloat, BoltMap, BoltString, BoltType};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::similarity::cosine_similarity;
use crate::GraphClient;

/// Graph store adapter (§4.2): translates domain operations to Cypher,
/// normalizes rows back into domain types, and exposes the vector-search
/// seam the Resolution Engine and centrality module sit on top of.
///
/// One adapter rather than a write/read-replica split, since this crate has
/// a single backend (neo4rs).
pub struct GraphStore {
    client: GraphClient,
}

/// A best-effort match returned by vector search: the matched uuid and its
/// cosine score against the query vector.
#[derive(Debug, Clone)]
pub struct ScoredMatch {
    pub uuid: Uuid,
    pub score: f64,
}

impl GraphStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    pub async fn health_check(&self) -> Result<(), neo4rs::Error> {
        self.client.health_check().await
    }

    // --- Episodes ---

    /// Persist an Episode. Immutable once created (invariant: never mutated).
    pub async fn create_episode(&self, ep: &Episode) -> Result<(), neo4rs::Error> {
        let q = query(
            "CREATE (e:Episode {
                uuid: $uuid, group_id: $group_id, name: $name, content: $content,
                role: $role, role_type: $role_type, source: $source,
                source_description: $source_description,
                timestamp: datetime($timestamp), created_at: datetime($created_at)
            })",
        )
        .param("uuid", ep.uuid.to_string())
        .param("group_id", ep.group_id.as_str())
        .param("name", ep.name.as_str())
        .param("content", ep.content.as_str())
        .param("role", ep.role.clone().unwrap_or_default())
        .param("role_type", ep.role_type.as_str())
        .param("source", ep.source.clone().unwrap_or_default())
        .param("source_description", ep.source_description.clone().unwrap_or_default())
        .param("timestamp", ep.timestamp.to_rfc3339())
        .param("created_at", ep.created_at.to_rfc3339());

        self.client.graph.run(q).await
    }

    /// Used for Worker idempotence (§4.7): skip re-extraction if the episode
    /// was already committed.
    pub async fn episode_exists(&self, uuid: Uuid) -> Result<bool, neo4rs::Error> {
        let q = query("MATCH (e:Episode {uuid: $uuid}) RETURN e LIMIT 1").param("uuid", uuid.to_string());
        let mut stream = self.client.graph.execute(q).await?;
        Ok(stream.next().await?.is_some())
    }

    /// Mark the episode's extraction result empty (no mentions produced).
    pub async fn mark_extraction_empty(&self, episode_uuid: Uuid) -> Result<(), neo4rs::Error> {
        let q = query("MATCH (e:Episode {uuid: $uuid}) SET e.extraction_empty = true")
            .param("uuid", episode_uuid.to_string());
        self.client.graph.run(q).await
    }

    pub async fn link_mention(&self, episode_uuid: Uuid, entity_uuid: Uuid) -> Result<(), neo4rs::Error> {
        let q = query(
            "MATCH (e:Episode {uuid: $ep}) MATCH (n:Entity {uuid: $ent}) MERGE (e)-[:MENTIONS]->(n)",
        )
        .param("ep", episode_uuid.to_string())
        .param("ent", entity_uuid.to_string());
        self.client.graph.run(q).await
    }

    pub async fn recent_episodes(&self, group_id: &str, last_n: u32) -> Result<Vec<Episode>, neo4rs::Error> {
        let q = query(
            "MATCH (e:Episode {group_id: $group_id}) RETURN e ORDER BY e.timestamp DESC LIMIT $n",
        )
        .param("group_id", group_id)
        .param("n", last_n as i64);

        let mut out = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            if let Ok(n) = row.get::<neo4rs::Node>("e") {
                if let Some(ep) = episode_from_node(&n) {
                    out.push(ep);
                }
            }
        }
        Ok(out)
    }

    // --- Entities ---

    /// Idempotent upsert keyed on `uuid`. New nodes get every field; existing
    /// nodes have summary/attributes/embedding refreshed (the node's identity
    /// never changes after creation).
    pub async fn upsert_entity(&self, entity: &EntityNode) -> Result<(), neo4rs::Error> {
        let q = query(
            "MERGE (n:Entity {uuid: $uuid})
             ON CREATE SET
                n.group_id = $group_id, n.name = $name, n.summary = $summary,
                n.labels = $labels, n.attributes = $attributes,
                n.name_embedding = $name_embedding, n.pending_embedding = $pending_embedding,
                n.created_at = datetime($created_at)
             ON MATCH SET
                n.name = $name, n.summary = $summary, n.labels = $labels,
                n.attributes = $attributes, n.name_embedding = $name_embedding,
                n.pending_embedding = $pending_embedding",
        )
        .param("uuid", entity.uuid.to_string())
        .param("group_id", entity.group_id.as_str())
        .param("name", entity.name.as_str())
        .param("summary", entity.summary.as_str())
        .param("labels", entity.labels.clone())
        .param("attributes", serde_json::to_string(&entity.attributes).unwrap_or_default())
        .param(
            "name_embedding",
            entity.name_embedding.clone().unwrap_or_default().iter().map(|f| *f as f64).collect::<Vec<f64>>(),
        )
        .param("pending_embedding", entity.pending_embedding)
        .param("created_at", entity.created_at.to_rfc3339());

        self.client.graph.run(q).await
    }

    pub async fn get_entity(&self, uuid: Uuid) -> Result<Option<EntityNode>, neo4rs::Error> {
        let q = query("MATCH (n:Entity {uuid: $uuid}) RETURN n").param("uuid", uuid.to_string());
        let mut stream = self.client.graph.execute(q).await?;
        if let Some(row) = stream.next().await? {
            if let Ok(n) = row.get::<neo4rs::Node>("n") {
                return Ok(entity_from_node(&n));
            }
        }
        Ok(None)
    }

    /// Step 1 of node resolution (§4.6.1): exact match on a pre-normalized name,
    /// scoped to `group_id` unless `cross_group` is set.
    pub async fn find_by_normalized_name(
        &self,
        normalized_name: &str,
        group_id: &str,
        cross_group: bool,
    ) -> Result<Vec<EntityNode>, neo4rs::Error> {
        let cypher = if cross_group {
            "MATCH (n:Entity) WHERE n.normalized_name = $norm RETURN n"
        } else {
            "MATCH (n:Entity {group_id: $group_id}) WHERE n.normalized_name = $norm RETURN n"
        };
        let mut q = query(cypher).param("norm", normalized_name);
        if !cross_group {
            q = q.param("group_id", group_id);
        }

        let mut out = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            if let Ok(n) = row.get::<neo4rs::Node>("n") {
                if let Some(e) = entity_from_node(&n) {
                    out.push(e);
                }
            }
        }
        Ok(out)
    }

    /// Denormalized helper kept in sync by `upsert_entity` callers; stored so
    /// exact-match lookups don't need to recompute normalization in Cypher.
    pub async fn set_normalized_name(&self, uuid: Uuid, normalized: &str) -> Result<(), neo4rs::Error> {
        let q = query("MATCH (n:Entity {uuid: $uuid}) SET n.normalized_name = $norm")
            .param("uuid", uuid.to_string())
            .param("norm", normalized);
        self.client.graph.run(q).await
    }

    /// Step 2 of node resolution: vector search over name embeddings within
    /// `group_id` (or all groups when `cross_group`). Uses the backend's ANN
    /// index when available, falling back to an in-process scan.
    pub async fn vector_search_entities(
        &self,
        query_vector: &[f32],
        group_id: &str,
        cross_group: bool,
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredMatch>, neo4rs::Error> {
        let embedding_f64: Vec<f64> = query_vector.iter().map(|v| *v as f64).collect();
        let ann = query(
            "CALL db.index.vector.queryNodes('entity_name_embedding', $k, $embedding)
             YIELD node, score
             WHERE ($cross_group OR node.group_id = $group_id) AND score >= $min_score
             RETURN node.uuid AS uuid, score",
        )
        .param("embedding", embedding_f64)
        .param("k", top_k as i64)
        .param("group_id", group_id)
        .param("cross_group", cross_group)
        .param("min_score", min_score);

        match self.client.graph.execute(ann).await {
            Ok(mut stream) => {
                let mut out = Vec::new();
                while let Some(row) = stream.next().await? {
                    let uuid_str: String = row.get("uuid").unwrap_or_default();
                    let score: f64 = row.get("score").unwrap_or(0.0);
                    if let Ok(uuid) = Uuid::parse_str(&uuid_str) {
                        out.push(ScoredMatch { uuid, score });
                    }
                }
                Ok(out)
            }
            Err(e) => {
                warn!(error = %e, "vector index query failed, falling back to in-process scan");
                self.vector_search_entities_fallback(query_vector, group_id, cross_group, top_k, min_score)
                    .await
            }
        }
    }

    async fn vector_search_entities_fallback(
        &self,
        query_vector: &[f32],
        group_id: &str,
        cross_group: bool,
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredMatch>, neo4rs::Error> {
        let cypher = if cross_group {
            "MATCH (n:Entity) WHERE n.name_embedding IS NOT NULL RETURN n.uuid AS uuid, n.name_embedding AS emb"
        } else {
            "MATCH (n:Entity {group_id: $group_id}) WHERE n.name_embedding IS NOT NULL RETURN n.uuid AS uuid, n.name_embedding AS emb"
        };
        let mut q = query(cypher);
        if !cross_group {
            q = q.param("group_id", group_id);
        }

        let mut scored = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            let uuid_str: String = row.get("uuid").unwrap_or_default();
            let emb_f64: Vec<f64> = row.get("emb").unwrap_or_default();
            let emb: Vec<f32> = emb_f64.iter().map(|v| *v as f32).collect();
            if let Ok(uuid) = Uuid::parse_str(&uuid_str) {
                let score = cosine_similarity(query_vector, &emb);
                if score >= min_score {
                    scored.push(ScoredMatch { uuid, score });
                }
            }
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    // --- Canonicalization (§4.6.1 step 3) ---

    pub async fn create_canonicality_edge(&self, edge: &CanonicalityEdge) -> Result<(), neo4rs::Error> {
        let q = query(
            "MATCH (a:Entity {uuid: $src}) MATCH (b:Entity {uuid: $tgt})
             MERGE (a)-[r:IS_DUPLICATE_OF]->(b)
             ON CREATE SET r.created_at = datetime($created_at)",
        )
        .param("src", edge.source_uuid.to_string())
        .param("tgt", edge.target_uuid.to_string())
        .param("created_at", edge.created_at.to_rfc3339());
        self.client.graph.run(q).await
    }

    /// Follow `IS_DUPLICATE_OF` to the canonical root, collapsing chains
    /// longer than one hop (invariant 6) by repointing directly at the root
    /// and logging a warning rather than leaving a multi-hop chain live.
    pub async fn resolve_canonical(&self, uuid: Uuid) -> Result<Uuid, neo4rs::Error> {
        let q = query(
            "MATCH (start:Entity {uuid: $uuid})
             OPTIONAL MATCH path = (start)-[:IS_DUPLICATE_OF*1..8]->(root:Entity)
             WHERE NOT (root)-[:IS_DUPLICATE_OF]->()
             RETURN root.uuid AS root_uuid, length(path) AS hops
             ORDER BY hops DESC LIMIT 1",
        )
        .param("uuid", uuid.to_string());

        let mut stream = self.client.graph.execute(q).await?;
        if let Some(row) = stream.next().await? {
            let root_str: String = row.get("root_uuid").unwrap_or_default();
            let hops: i64 = row.get("hops").unwrap_or(0);
            if let Ok(root) = Uuid::parse_str(&root_str) {
                if hops > 1 {
                    warn!(%uuid, %root, hops, "collapsing multi-hop IS_DUPLICATE_OF chain");
                    self.collapse_chain(uuid, root).await?;
                }
                return Ok(root);
            }
        }
        Ok(uuid)
    }

    async fn collapse_chain(&self, from: Uuid, root: Uuid) -> Result<(), neo4rs::Error> {
        let q = query(
            "MATCH (a:Entity {uuid: $from})-[r:IS_DUPLICATE_OF*1..8]->(:Entity {uuid: $root})
             FOREACH (rel IN r | DELETE rel)
             WITH a
             MATCH (root:Entity {uuid: $root})
             MERGE (a)-[:IS_DUPLICATE_OF]->(root)",
        )
        .param("from", from.to_string())
        .param("root", root.to_string());
        self.client.graph.run(q).await
    }

    // --- Edges (facts) ---

    pub async fn upsert_edge(&self, edge: &EntityEdge) -> Result<(), neo4rs::Error> {
        let q = query(
            "MATCH (s:Entity {uuid: $src}) MATCH (t:Entity {uuid: $tgt})
             MERGE (s)-[r:RELATES_TO {uuid: $uuid}]->(t)
             ON CREATE SET
                r.group_id = $group_id, r.name = $name, r.fact = $fact,
                r.fact_embedding = $fact_embedding, r.valid_at = datetime($valid_at),
                r.invalid_at = $invalid_at, r.created_at = datetime($created_at),
                r.expired_at = $expired_at, r.provenance = $provenance,
                r.src_uuid = $src, r.tgt_uuid = $tgt
             ON MATCH SET
                r.fact = $fact, r.valid_at = datetime($valid_at),
                r.invalid_at = $invalid_at, r.expired_at = $expired_at,
                r.provenance = $provenance, r.src_uuid = $src, r.tgt_uuid = $tgt",
        )
        .param("src", edge.source_node_uuid.to_string())
        .param("tgt", edge.target_node_uuid.to_string())
        .param("uuid", edge.uuid.to_string())
        .param("group_id", edge.group_id.as_str())
        .param("name", edge.name.as_str())
        .param("fact", edge.fact.as_str())
        .param(
            "fact_embedding",
            edge.fact_embedding.clone().unwrap_or_default().iter().map(|f| *f as f64).collect::<Vec<f64>>(),
        )
        .param("valid_at", edge.valid_at.to_rfc3339())
        .param("invalid_at", edge.invalid_at.map(|d| d.to_rfc3339()).unwrap_or_default())
        .param("created_at", edge.created_at.to_rfc3339())
        .param("expired_at", edge.expired_at.map(|d| d.to_rfc3339()).unwrap_or_default())
        .param("provenance", edge.provenance.iter().map(|u| u.to_string()).collect::<Vec<_>>());

        self.client.graph.run(q).await
    }

    /// Step 1/2 of edge resolution (§4.6.2): existing edges between the same
    /// endpoint pair, for fact-embedding comparison in the caller.
    pub async fn edges_between(&self, source: Uuid, target: Uuid) -> Result<Vec<EntityEdge>, neo4rs::Error> {
        let q = query(
            "MATCH (:Entity {uuid: $src})-[r:RELATES_TO]->(:Entity {uuid: $tgt}) RETURN r",
        )
        .param("src", source.to_string())
        .param("tgt", target.to_string());

        let mut out = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            if let Ok(r) = row.get::<neo4rs::Relation>("r") {
                if let Some(e) = edge_from_relation(&r, source, target) {
                    out.push(e);
                }
            }
        }
        Ok(out)
    }

    pub async fn invalidate_edge(&self, uuid: Uuid, invalid_at: DateTime<Utc>) -> Result<(), neo4rs::Error> {
        let q = query("MATCH ()-[r:RELATES_TO {uuid: $uuid}]->() SET r.invalid_at = datetime($invalid_at)")
            .param("uuid", uuid.to_string())
            .param("invalid_at", invalid_at.to_rfc3339());
        self.client.graph.run(q).await
    }

    pub async fn append_provenance(&self, uuid: Uuid, episode_uuid: Uuid) -> Result<(), neo4rs::Error> {
        let q = query(
            "MATCH ()-[r:RELATES_TO {uuid: $uuid}]->()
             SET r.provenance = r.provenance + $episode_uuid",
        )
        .param("uuid", uuid.to_string())
        .param("episode_uuid", episode_uuid.to_string());
        self.client.graph.run(q).await
    }

    pub async fn edges_by_node(&self, node_uuid: Uuid) -> Result<Vec<EntityEdge>, neo4rs::Error> {
        let q = query(
            "MATCH (n:Entity {uuid: $uuid})
             OPTIONAL MATCH (n)-[out:RELATES_TO]->(t)
             OPTIONAL MATCH (s)-[inn:RELATES_TO]->(n)
             RETURN collect(DISTINCT out) AS outs, collect(DISTINCT inn) AS ins",
        )
        .param("uuid", node_uuid.to_string());

        let mut out = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        if let Some(row) = stream.next().await? {
            if let Ok(rels) = row.get::<Vec<neo4rs::Relation>>("outs") {
                for r in rels {
                    if let Some(e) = edge_from_relation_unknown_endpoints(&r) {
                        out.push(e);
                    }
                }
            }
            if let Ok(rels) = row.get::<Vec<neo4rs::Relation>>("ins") {
                for r in rels {
                    if let Some(e) = edge_from_relation_unknown_endpoints(&r) {
                        out.push(e);
                    }
                }
            }
        }
        Ok(out)
    }

    // --- Generic fetch helpers (§4.2's fetch_nodes/fetch_edges) ---

    pub async fn fetch_nodes(
        &self,
        label: &str,
        filters: &HashMap<String, String>,
        limit: u32,
    ) -> Result<Vec<neo4rs::Node>, neo4rs::Error> {
        let mut cypher = format!("MATCH (n:{label})");
        for (i, key) in filters.keys().enumerate() {
            let clause = if i == 0 { " WHERE" } else { " AND" };
            cypher.push_str(&format!("{clause} n.{key} = $p{i}"));
        }
        cypher.push_str(" RETURN n LIMIT $limit");

        let mut q = query(&cypher).param("limit", limit as i64);
        for (i, value) in filters.values().enumerate() {
            q = q.param(&format!("p{i}"), value.as_str());
        }

        let mut out = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            if let Ok(n) = row.get::<neo4rs::Node>("n") {
                out.push(n);
            }
        }
        Ok(out)
    }

    /// Escape hatch for callers needing raw Cypher (sync orchestrator page reads,
    /// centrality module, admin tooling).
    pub async fn execute_query(
        &self,
        cypher: &str,
        params: Vec<(&str, BoltType)>,
    ) -> Result<Vec<neo4rs::Row>, neo4rs::Error> {
        let mut q = query(cypher);
        for (k, v) in params {
            q = q.param(k, v);
        }
        let mut rows = Vec::new();
        let mut stream = self.client.graph.execute(q).await?;
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Group-delete: removes all Episodes, Entities and their edges for a
    /// `group_id` (the only sanctioned Episode-deletion path per §3 lifecycle).
    pub async fn delete_group(&self, group_id: &str) -> Result<u64, neo4rs::Error> {
        let q = query(
            "MATCH (n) WHERE (n:Episode OR n:Entity) AND n.group_id = $group_id
             DETACH DELETE n
             RETURN count(n) AS deleted",
        )
        .param("group_id", group_id);

        let mut stream = self.client.graph.execute(q).await?;
        let deleted = if let Some(row) = stream.next().await? {
            row.get::<i64>("deleted").unwrap_or(0) as u64
        } else {
            0
        };
        info!(group_id, deleted, "deleted ingestion group");
        Ok(deleted)
    }

    /// §4.11: EWMA-updated importance score, batched under one write per
    /// commit window by the caller.
    pub async fn apply_importance_update(&self, uuid: Uuid, new_importance: f64) -> Result<(), neo4rs::Error> {
        let q = query("MATCH (n:Entity {uuid: $uuid}) SET n.importance = $importance")
            .param("uuid", uuid.to_string())
            .param("importance", new_importance);
        self.client.graph.run(q).await
    }

    pub async fn get_importance(&self, uuid: Uuid) -> Result<Option<f64>, neo4rs::Error> {
        let q = query("MATCH (n:Entity {uuid: $uuid}) RETURN n.importance AS importance")
            .param("uuid", uuid.to_string());
        let mut stream = self.client.graph.execute(q).await?;
        if let Some(row) = stream.next().await? {
            return Ok(row.get::<f64>("importance").ok());
        }
        Ok(None)
    }

    /// Persists one node's pagerank score from `centrality::pagerank`, kept
    /// distinct from `n.importance` (§4.11's EWMA relevance signal).
    pub async fn set_centrality_pagerank(&self, uuid: Uuid, value: f64) -> Result<(), neo4rs::Error> {
        let q = query("MATCH (n:Entity {uuid: $uuid}) SET n.centrality_pagerank = $value")
            .param("uuid", uuid.to_string())
            .param("value", value);
        self.client.graph.run(q).await
    }

    pub async fn set_centrality_degree(&self, uuid: Uuid, value: f64) -> Result<(), neo4rs::Error> {
        let q = query("MATCH (n:Entity {uuid: $uuid}) SET n.centrality_degree = $value")
            .param("uuid", uuid.to_string())
            .param("value", value);
        self.client.graph.run(q).await
    }

    pub async fn set_centrality_betweenness(&self, uuid: Uuid, value: f64) -> Result<(), neo4rs::Error> {
        let q = query("MATCH (n:Entity {uuid: $uuid}) SET n.centrality_betweenness = $value")
            .param("uuid", uuid.to_string())
            .param("value", value);
        self.client.graph.run(q).await
    }
}

fn bolt_map(pairs: Vec<(&str, BoltType)>) -> BoltType {
    BoltType::Map(BoltMap::from_iter(
        pairs.into_iter().map(|(k, v)| (BoltString::from(k), v)),
    ))
}

#[allow(dead_code)]
fn bolt_float(v: f64) -> BoltType {
    BoltType::Float(BoltFloat::new(v))
}

fn episode_from_node(n: &neo4rs::Node) -> Option<Episode> {
    Some(Episode {
        uuid: Uuid::parse_str(&n.get::<String>("uuid").ok()?).ok()?,
        group_id: n.get("group_id").unwrap_or_default(),
        name: n.get("name").unwrap_or_default(),
        content: n.get("content").unwrap_or_default(),
        role: n.get::<String>("role").ok().filter(|s| !s.is_empty()),
        role_type: n.get("role_type").unwrap_or_default(),
        source: n.get::<String>("source").ok().filter(|s| !s.is_empty()),
        source_description: n.get::<String>("source_description").ok().filter(|s| !s.is_empty()),
        timestamp: parse_dt(&n.get::<String>("timestamp").unwrap_or_default()),
        created_at: parse_dt(&n.get::<String>("created_at").unwrap_or_default()),
    })
}

fn entity_from_node(n: &neo4rs::Node) -> Option<EntityNode> {
    let uuid = Uuid::parse_str(&n.get::<String>("uuid").ok()?).ok()?;
    let attributes: HashMap<String, serde_json::Value> = n
        .get::<String>("attributes")
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let embedding_f64: Vec<f64> = n.get("name_embedding").unwrap_or_default();
    let name_embedding = if embedding_f64.is_empty() {
        None
    } else {
        Some(embedding_f64.iter().map(|v| *v as f32).collect())
    };

    Some(EntityNode {
        uuid,
        group_id: n.get("group_id").unwrap_or_default(),
        name: n.get("name").unwrap_or_default(),
        summary: n.get("summary").unwrap_or_default(),
        labels: n.get("labels").unwrap_or_default(),
        attributes,
        name_embedding,
        pending_embedding: n.get("pending_embedding").unwrap_or(false),
        centrality: kg_common::Centrality::default(),
        created_at: parse_dt(&n.get::<String>("created_at").unwrap_or_default()),
    })
}

fn edge_from_relation(r: &neo4rs::Relation, source: Uuid, target: Uuid) -> Option<EntityEdge> {
    edge_from_relation_with_endpoints(r, source, target)
}

fn edge_from_relation_unknown_endpoints(r: &neo4rs::Relation) -> Option<EntityEdge> {
    let src = Uuid::parse_str(&r.get::<String>("src_uuid").unwrap_or_default()).unwrap_or(Uuid::nil());
    let tgt = Uuid::parse_str(&r.get::<String>("tgt_uuid").unwrap_or_default()).unwrap_or(Uuid::nil());
    edge_from_relation_with_endpoints(r, src, tgt)
}

fn edge_from_relation_with_endpoints(r: &neo4rs::Relation, source: Uuid, target: Uuid) -> Option<EntityEdge> {
    let uuid = Uuid::parse_str(&r.get::<String>("uuid").ok()?).ok()?;
    let embedding_f64: Vec<f64> = r.get("fact_embedding").unwrap_or_default();
    let fact_embedding = if embedding_f64.is_empty() {
        None
    } else {
        Some(embedding_f64.iter().map(|v| *v as f32).collect())
    };
    let provenance: Vec<String> = r.get("provenance").unwrap_or_default();

    Some(EntityEdge {
        uuid,
        group_id: r.get("group_id").unwrap_or_default(),
        name: r.get("name").unwrap_or_default(),
        fact: r.get("fact").unwrap_or_default(),
        source_node_uuid: source,
        target_node_uuid: target,
        fact_embedding,
        valid_at: parse_dt(&r.get::<String>("valid_at").unwrap_or_default()),
        invalid_at: r.get::<String>("invalid_at").ok().filter(|s| !s.is_empty()).map(|s| parse_dt(&s)),
        created_at: parse_dt(&r.get::<String>("created_at").unwrap_or_default()),
        expired_at: r.get::<String>("expired_at").ok().filter(|s| !s.is_empty()).map(|s| parse_dt(&s)),
        provenance: provenance.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect(),
    })
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bolt_map_builds_without_panicking() {
        let _ = bolt_map(vec![("a", BoltType::Float(BoltFloat::new(1.0)))]);
    }
}
