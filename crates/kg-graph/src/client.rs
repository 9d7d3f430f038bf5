use neo4rs::{ConfigBuilder, Graph};

/// Thin wrapper around neo4rs::Graph providing connection setup.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
}

impl GraphClient {
    /// Connect to the graph store with the given credentials.
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, neo4rs::Error> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .fetch_size(500)
            .max_connections(10)
            .build()
            .unwrap();
        let graph = Graph::connect(config).await?;
        Ok(Self { graph })
    }

    /// Get a reference to the underlying neo4rs Graph.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }

    /// Liveness probe: a trivial query round-trip.
    pub async fn health_check(&self) -> Result<(), neo4rs::Error> {
        let mut stream = self.graph.execute(neo4rs::query("RETURN 1")).await?;
        stream.next().await?;
        Ok(())
    }

    pub async fn close(&self) {
        // neo4rs::Graph has no explicit close; connections are pooled and
        // dropped with the handle. Kept as a named op to match the adapter
        // contract callers expect.
    }
}
