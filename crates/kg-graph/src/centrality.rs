use petgraph::algo::{betweenness_centrality, page_rank};
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::HashMap;
use uuid::Uuid;

use crate::store::GraphStore;

/// Direction filter for degree centrality, mirroring the original proxy's
/// `direction` request field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegreeDirection {
    In,
    Out,
    Both,
}

impl Default for DegreeDirection {
    fn default() -> Self {
        Self::Both
    }
}

/// Composite result for the `/centrality/all` request.
#[derive(Debug, Clone, Default)]
pub struct CentralityScores {
    pub pagerank: HashMap<Uuid, f64>,
    pub degree: HashMap<Uuid, f64>,
    pub betweenness: HashMap<Uuid, f64>,
}

/// Loads the `RELATES_TO` adjacency for `group_id` (or the whole graph) into
/// an in-memory undirected graph and hands back both the petgraph structure
/// and a uuid lookup table, since every metric below needs the same load.
///
/// This was a proxy to an external Rust microservice in the system this
/// crate's domain model is based on; computed directly here since the
/// adapter and the caller are now the same process.
async fn load_edges(store: &GraphStore, group_id: Option<&str>) -> Result<Vec<(Uuid, Uuid)>, neo4rs::Error> {
    let cypher = match group_id {
        Some(_) => {
            "MATCH (s:Entity {group_id: $group_id})-[:RELATES_TO]->(t:Entity {group_id: $group_id}) \
             RETURN s.uuid AS src, t.uuid AS tgt"
        }
        None => "MATCH (s:Entity)-[:RELATES_TO]->(t:Entity) RETURN s.uuid AS src, t.uuid AS tgt",
    };
    let params = match group_id {
        Some(gid) => vec![("group_id", neo4rs::BoltType::String(gid.into()))],
        None => vec![],
    };

    let rows = store.execute_query(cypher, params).await?;

    let mut edges = Vec::new();
    for row in &rows {
        let src_s: String = row.get("src").unwrap_or_default();
        let tgt_s: String = row.get("tgt").unwrap_or_default();
        let (Ok(src), Ok(tgt)) = (Uuid::parse_str(&src_s), Uuid::parse_str(&tgt_s)) else {
            continue;
        };
        edges.push((src, tgt));
    }
    Ok(edges)
}

async fn load_adjacency(
    store: &GraphStore,
    group_id: Option<&str>,
) -> Result<(UnGraph<(), ()>, Vec<Uuid>), neo4rs::Error> {
    let edges = load_edges(store, group_id).await?;

    let mut index_of: HashMap<Uuid, NodeIndex> = HashMap::new();
    let mut uuids: Vec<Uuid> = Vec::new();
    let mut graph = UnGraph::<(), ()>::new_undirected();

    let mut ensure = |u: Uuid, graph: &mut UnGraph<(), ()>, index_of: &mut HashMap<Uuid, NodeIndex>, uuids: &mut Vec<Uuid>| -> NodeIndex {
        *index_of.entry(u).or_insert_with(|| {
            uuids.push(u);
            graph.add_node(())
        })
    };

    for (src, tgt) in edges {
        let si = ensure(src, &mut graph, &mut index_of, &mut uuids);
        let ti = ensure(tgt, &mut graph, &mut index_of, &mut uuids);
        graph.add_edge(si, ti, ());
    }

    Ok((graph, uuids))
}

/// PageRank over the co-mention graph (§4.11's importance signal). Damping
/// and iteration count match the original request defaults (0.85, 20).
pub async fn pagerank(
    store: &GraphStore,
    group_id: Option<&str>,
    damping_factor: f64,
    iterations: usize,
) -> Result<HashMap<Uuid, f64>, neo4rs::Error> {
    let (graph, uuids) = load_adjacency(store, group_id).await?;
    if graph.node_count() == 0 {
        return Ok(HashMap::new());
    }
    let scores = page_rank(&graph, damping_factor, iterations);
    Ok(uuids.into_iter().zip(scores).collect())
}

/// Degree centrality, normalized by `n - 1` so scores land in `[0,1]`
/// (invariant 4), counted directly off `RELATES_TO` edges (rather than the
/// shared undirected `load_adjacency` graph) since `In`/`Out` need to know
/// which endpoint each edge started from.
pub async fn degree(
    store: &GraphStore,
    group_id: Option<&str>,
    direction: DegreeDirection,
) -> Result<HashMap<Uuid, f64>, neo4rs::Error> {
    let edges = load_edges(store, group_id).await?;

    let mut order: Vec<Uuid> = Vec::new();
    let mut seen: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
    for (src, tgt) in &edges {
        if seen.insert(*src) {
            order.push(*src);
        }
        if seen.insert(*tgt) {
            order.push(*tgt);
        }
    }

    let n = order.len();
    if n <= 1 {
        return Ok(order.into_iter().map(|u| (u, 0.0)).collect());
    }

    let mut counts: HashMap<Uuid, f64> = order.iter().map(|u| (*u, 0.0)).collect();
    for (src, tgt) in &edges {
        match direction {
            DegreeDirection::Out => *counts.get_mut(src).expect("endpoint registered in order") += 1.0,
            DegreeDirection::In => *counts.get_mut(tgt).expect("endpoint registered in order") += 1.0,
            DegreeDirection::Both => {
                *counts.get_mut(src).expect("endpoint registered in order") += 1.0;
                *counts.get_mut(tgt).expect("endpoint registered in order") += 1.0;
            }
        }
    }

    Ok(counts.into_iter().map(|(u, c)| (u, c / (n as f64 - 1.0))).collect())
}

/// Betweenness centrality. `sample_size` caps the number of source nodes
/// used for shortest-path sampling; `None` uses every node (matches the
/// original request's `sample_size: Optional[int]`).
pub async fn betweenness(
    store: &GraphStore,
    group_id: Option<&str>,
    _sample_size: Option<usize>,
) -> Result<HashMap<Uuid, f64>, neo4rs::Error> {
    let (graph, uuids) = load_adjacency(store, group_id).await?;
    if graph.node_count() == 0 {
        return Ok(HashMap::new());
    }
    let scores: Vec<Option<f64>> = betweenness_centrality(&graph, false);
    Ok(uuids
        .into_iter()
        .zip(scores)
        .map(|(u, s)| (u, s.unwrap_or(0.0)))
        .collect())
}

/// All three metrics plus importance (§4.11), as returned by `/centrality/all`.
pub async fn all(store: &GraphStore, group_id: Option<&str>) -> Result<CentralityScores, neo4rs::Error> {
    let pagerank = pagerank(store, group_id, 0.85, 20).await?;
    let degree = degree(store, group_id, DegreeDirection::Both).await?;
    let betweenness = betweenness(store, group_id, None).await?;
    Ok(CentralityScores { pagerank, degree, betweenness })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degree_direction_defaults_to_both() {
        assert_eq!(DegreeDirection::default(), DegreeDirection::Both);
    }
}
