pub mod centrality;
pub mod client;
pub mod migrate;
pub mod similarity;
pub mod store;

pub use client::GraphClient;
pub use similarity::{cosine_similarity, top_k_by_similarity};
pub use store::{GraphStore, ScoredMatch};

/// Re-export neo4rs::query for downstream crates that need raw Cypher access (e.g. test assertions).
pub use neo4rs::query;
