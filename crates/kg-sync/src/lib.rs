//! Cross-Store Sync Orchestrator (C12): mirrors nodes, edges, and
//! embeddings from a primary graph store to a secondary.
//!
//! Schema bootstrap issues idempotent DDL (`CREATE CONSTRAINT ... IF NOT
//! EXISTS`, one statement at a time, errors propagate immediately). The
//! page-at-a-time streaming loop issues one query per page and folds the
//! results, rather than holding a server-side cursor open across pages.

use chrono::{DateTime, Utc};
use kg_common::{EntityEdge, EntityNode};
use kg_graph::GraphStore;
use neo4rs::query;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("graph error: {0}")]
    Graph(#[from] neo4rs::Error),
    #[error("aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_size: u32,
    pub max_retries: u32,
    pub truncate_secondary: bool,
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            max_retries: 3,
            truncate_secondary: false,
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub current_phase: String,
    pub migrated: u64,
    pub total: u64,
    pub failed: u64,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

pub struct SyncOrchestrator {
    primary: Arc<GraphStore>,
    secondary: Arc<GraphStore>,
    config: SyncConfig,
    progress_cb: Option<ProgressCallback>,
}

impl SyncOrchestrator {
    pub fn new(primary: Arc<GraphStore>, secondary: Arc<GraphStore>, config: SyncConfig) -> Self {
        Self { primary, secondary, config, progress_cb: None }
    }

    pub fn with_progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.progress_cb = Some(cb);
        self
    }

    fn report(&self, progress: Progress) {
        if let Some(cb) = &self.progress_cb {
            cb(progress);
        }
    }

    /// Idempotent secondary-side schema bootstrap. Safe to run before every
    /// full sync: each statement is `IF NOT EXISTS`, so re-running is a
    /// no-op once the constraints exist.
    pub async fn bootstrap_secondary_schema(&self) -> Result<()> {
        let statements = [
            "CREATE CONSTRAINT entity_uuid IF NOT EXISTS FOR (n:Entity) REQUIRE n.uuid IS UNIQUE",
            "CREATE CONSTRAINT episode_uuid IF NOT EXISTS FOR (n:Episode) REQUIRE n.uuid IS UNIQUE",
            "CREATE INDEX entity_group_id IF NOT EXISTS FOR (n:Entity) ON (n.group_id)",
            "CREATE INDEX entity_created_at IF NOT EXISTS FOR (n:Entity) ON (n.created_at)",
        ];
        for stmt in &statements {
            self.secondary.client().inner().run(query(stmt)).await?;
        }
        info!("secondary schema bootstrap complete");
        Ok(())
    }

    /// One-shot full mirror: truncate (if configured), stream nodes, then
    /// edges whose endpoints both imported successfully.
    pub async fn run_full(&self) -> Result<SyncReport> {
        if self.config.truncate_secondary {
            self.secondary
                .client()
                .inner()
                .run(query("MATCH (n) DETACH DELETE n"))
                .await?;
            info!("secondary truncated before full sync");
        }
        self.bootstrap_secondary_schema().await?;

        let imported_nodes = self.sync_nodes().await?;
        let edge_stats = self.sync_edges(&imported_nodes.imported).await?;

        Ok(SyncReport { nodes: imported_nodes.report, edges: edge_stats })
    }

    async fn sync_nodes(&self) -> Result<NodeSyncOutcome> {
        let total = self.count_primary("Entity").await?;
        let mut migrated = 0u64;
        let mut failed = 0u64;
        let mut imported = HashSet::new();
        let mut skip: u64 = 0;

        loop {
            let rows = self
                .primary
                .client()
                .inner()
                .execute(
                    query("MATCH (n:Entity) RETURN n ORDER BY n.created_at SKIP $skip LIMIT $limit")
                        .param("skip", skip as i64)
                        .param("limit", self.config.page_size as i64),
                )
                .await?;
            let page = collect_rows(rows).await?;
            if page.is_empty() {
                break;
            }

            for row in &page {
                let Some(node) = row.get::<neo4rs::Node>("n").ok().and_then(|n| entity_from_node(&n))
                else {
                    failed += 1;
                    continue;
                };
                match self.upsert_with_retry(&node).await {
                    Ok(()) => {
                        imported.insert(node.uuid);
                        migrated += 1;
                    }
                    Err(e) => {
                        warn!(node = %node.uuid, error = %e, "failed to mirror node after retries");
                        failed += 1;
                    }
                }
            }

            skip += page.len() as u64;
            self.report(Progress {
                current_phase: "nodes".to_string(),
                migrated,
                total,
                failed,
            });
        }

        Ok(NodeSyncOutcome {
            imported,
            report: PhaseReport { migrated, total, failed },
        })
    }

    async fn sync_edges(&self, imported_nodes: &HashSet<Uuid>) -> Result<PhaseReport> {
        let total = self.count_primary_edges().await?;
        let mut migrated = 0u64;
        let mut failed = 0u64;
        let mut skip: u64 = 0;

        loop {
            let rows = self
                .primary
                .client()
                .inner()
                .execute(
                    query(
                        "MATCH (s:Entity)-[r:RELATES_TO]->(t:Entity)
                         RETURN r, s.uuid AS src, t.uuid AS tgt
                         ORDER BY r.created_at SKIP $skip LIMIT $limit",
                    )
                    .param("skip", skip as i64)
                    .param("limit", self.config.page_size as i64),
                )
                .await?;
            let page = collect_rows(rows).await?;
            if page.is_empty() {
                break;
            }

            for row in &page {
                let src: Option<Uuid> = row.get::<String>("src").ok().and_then(|s| Uuid::parse_str(&s).ok());
                let tgt: Option<Uuid> = row.get::<String>("tgt").ok().and_then(|s| Uuid::parse_str(&s).ok());
                let (Some(src), Some(tgt)) = (src, tgt) else {
                    failed += 1;
                    continue;
                };
                if !imported_nodes.contains(&src) || !imported_nodes.contains(&tgt) {
                    // Endpoint didn't import; skip without counting as a
                    // failure of this sync run.
                    continue;
                }
                let Some(edge) = row
                    .get::<neo4rs::Relation>("r")
                    .ok()
                    .and_then(|r| edge_from_relation(&r, src, tgt))
                else {
                    failed += 1;
                    continue;
                };

                match self.upsert_edge_with_retry(&edge).await {
                    Ok(()) => migrated += 1,
                    Err(e) => {
                        warn!(edge = %edge.uuid, error = %e, "failed to mirror edge after retries");
                        failed += 1;
                    }
                }
            }

            skip += page.len() as u64;
            self.report(Progress {
                current_phase: "edges".to_string(),
                migrated,
                total,
                failed,
            });
        }

        Ok(PhaseReport { migrated, total, failed })
    }

    /// Polls primary records created since `watermark`, applies them to
    /// secondary, and returns the new watermark on success. The watermark
    /// only advances if the whole batch applied without a phase-level
    /// error; per-record failures are counted but don't block the advance.
    pub async fn run_continuous_once(&self, watermark: DateTime<Utc>) -> Result<(DateTime<Utc>, PhaseReport)> {
        let rows = self
            .primary
            .client()
            .inner()
            .execute(
                query("MATCH (n:Entity) WHERE n.created_at > datetime($watermark) RETURN n ORDER BY n.created_at")
                    .param("watermark", watermark.to_rfc3339()),
            )
            .await?;
        let page = collect_rows(rows).await?;

        let mut migrated = 0u64;
        let mut failed = 0u64;
        let mut newest = watermark;

        for row in &page {
            let Some(node) = row.get::<neo4rs::Node>("n").ok().and_then(|n| entity_from_node(&n)) else {
                failed += 1;
                continue;
            };
            if node.created_at > newest {
                newest = node.created_at;
            }
            match self.upsert_with_retry(&node).await {
                Ok(()) => migrated += 1,
                Err(e) => {
                    warn!(node = %node.uuid, error = %e, "continuous sync failed to mirror node");
                    failed += 1;
                }
            }
        }

        let total = page.len() as u64;
        Ok((newest, PhaseReport { migrated, total, failed }))
    }

    async fn upsert_with_retry(&self, node: &EntityNode) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.secondary.upsert_entity(node).await {
                Ok(()) => return Ok(()),
                Err(_) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => return Err(SyncError::Graph(e)),
            }
        }
    }

    async fn upsert_edge_with_retry(&self, edge: &EntityEdge) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.secondary.upsert_edge(edge).await {
                Ok(()) => return Ok(()),
                Err(_) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => return Err(SyncError::Graph(e)),
            }
        }
    }

    async fn count_primary(&self, label: &str) -> Result<u64> {
        let mut stream = self
            .primary
            .client()
            .inner()
            .execute(query(&format!("MATCH (n:{label}) RETURN count(n) AS cnt")))
            .await?;
        let count = if let Some(row) = stream.next().await? {
            row.get::<i64>("cnt").unwrap_or(0)
        } else {
            0
        };
        Ok(count as u64)
    }

    async fn count_primary_edges(&self) -> Result<u64> {
        let mut stream = self
            .primary
            .client()
            .inner()
            .execute(query("MATCH ()-[r:RELATES_TO]->() RETURN count(r) AS cnt"))
            .await?;
        let count = if let Some(row) = stream.next().await? {
            row.get::<i64>("cnt").unwrap_or(0)
        } else {
            0
        };
        Ok(count as u64)
    }
}

struct NodeSyncOutcome {
    imported: HashSet<Uuid>,
    report: PhaseReport,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub migrated: u64,
    pub total: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub nodes: PhaseReport,
    pub edges: PhaseReport,
}

async fn collect_rows(mut stream: neo4rs::RowStream) -> Result<Vec<neo4rs::Row>> {
    let mut rows = Vec::new();
    while let Some(row) = stream.next().await? {
        rows.push(row);
    }
    Ok(rows)
}

fn entity_from_node(n: &neo4rs::Node) -> Option<EntityNode> {
    let uuid = Uuid::parse_str(&n.get::<String>("uuid").ok()?).ok()?;
    let attributes = n
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
    let created_at = n
        .get::<String>("created_at")
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(EntityNode {
        uuid,
        group_id: n.get("group_id").unwrap_or_default(),
        name: n.get("name").unwrap_or_default(),
        summary: n.get("summary").unwrap_or_default(),
        labels: n.get("labels").unwrap_or_default(),
        attributes,
        name_embedding,
        pending_embedding: n.get("pending_embedding").unwrap_or(false),
        centrality: Default::default(),
        created_at,
    })
}

fn edge_from_relation(r: &neo4rs::Relation, source: Uuid, target: Uuid) -> Option<EntityEdge> {
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
        invalid_at: r
            .get::<String>("invalid_at")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| parse_dt(&s)),
        created_at: parse_dt(&r.get::<String>("created_at").unwrap_or_default()),
        expired_at: r
            .get::<String>("expired_at")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| parse_dt(&s)),
        provenance: provenance.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect(),
    })
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_page_size() {
        let config = SyncConfig::default();
        assert_eq!(config.page_size, 500);
        assert_eq!(config.max_retries, 3);
        assert!(!config.truncate_secondary);
    }

    #[test]
    fn phase_report_defaults_to_zero() {
        let report = PhaseReport::default();
        assert_eq!(report.migrated, 0);
        assert_eq!(report.total, 0);
        assert_eq!(report.failed, 0);
    }
}
