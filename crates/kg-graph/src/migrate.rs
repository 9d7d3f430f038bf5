use neo4rs::query;
use tracing::info;

use crate::GraphClient;

/// Run idempotent schema migrations: uniqueness constraints and vector indexes.
/// Safe to call on every startup (`CREATE ... IF NOT EXISTS`).
pub async fn migrate(client: &GraphClient, embed_dimension: usize) -> Result<(), neo4rs::Error> {
    let g = &client.graph;

    info!("running graph schema migrations");

    let constraints = [
        "CREATE CONSTRAINT episode_uuid IF NOT EXISTS FOR (n:Episode) REQUIRE n.uuid IS UNIQUE",
        "CREATE CONSTRAINT entity_uuid IF NOT EXISTS FOR (n:Entity) REQUIRE n.uuid IS UNIQUE",
    ];
    for c in &constraints {
        g.run(query(c)).await?;
    }
    info!("uuid uniqueness constraints created");

    let group_indexes = [
        "CREATE INDEX entity_group_id IF NOT EXISTS FOR (n:Entity) ON (n.group_id)",
        "CREATE INDEX episode_group_id IF NOT EXISTS FOR (n:Episode) ON (n.group_id)",
    ];
    for idx in &group_indexes {
        g.run(query(idx)).await?;
    }
    info!("group_id indexes created");

    let vector = format!(
        "CREATE VECTOR INDEX entity_name_embedding IF NOT EXISTS FOR (n:Entity) ON (n.name_embedding) \
         OPTIONS {{indexConfig: {{`vector.dimensions`: {dim}, `vector.similarity_function`: 'cosine'}}}}",
        dim = embed_dimension,
    );
    g.run(query(&vector)).await?;

    let edge_vector = format!(
        "CREATE VECTOR INDEX edge_fact_embedding IF NOT EXISTS FOR ()-[r:RELATES_TO]-() ON (r.fact_embedding) \
         OPTIONS {{indexConfig: {{`vector.dimensions`: {dim}, `vector.similarity_function`: 'cosine'}}}}",
        dim = embed_dimension,
    );
    // Relationship vector indexes are not supported on all backends; ignore
    // UnsupportedVersion rather than fail startup over an optional ANN path.
    if let Err(e) = g.run(query(&edge_vector)).await {
        tracing::warn!(error = %e, "edge vector index unavailable, falling back to in-process cosine search");
    }

    info!("vector indexes created");
    info!("graph schema migration complete");
    Ok(())
}
