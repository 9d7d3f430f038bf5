//! Composition root (C13): wires C1-C12 behind the HTTP surface. One
//! `AppState` built at startup from `AppConfig::from_env()`, routes
//! registered against it, `tower_http` layers for tracing/CORS, then
//! `axum::serve`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use kg_common::{AppConfig, NodeAccessEvent, RelevanceFeedback};
use kg_dispatch::{DispatchEvent, Dispatcher, DispatcherConfig};
use kg_embed::Embedder;
use kg_extract::ExtractionEngine;
use kg_feedback::{FeedbackCollector, FeedbackConfig};
use kg_graph::{GraphClient, GraphStore};
use kg_llm::LlmAdapter;
use kg_queue::{Queue, QueueProxy};
use kg_resolve::{ResolveConfig, ResolveEngine};
use kg_sync::{SyncConfig, SyncOrchestrator};
use kg_worker::{Worker, WorkerConfig};
use kg_ws::Broadcaster;

struct AppState {
    config: AppConfig,
    store: Arc<GraphStore>,
    queue: Option<Arc<QueueProxy>>,
    resolver: Arc<ResolveEngine>,
    dispatcher: Arc<Dispatcher>,
    broadcaster: Arc<Broadcaster>,
    feedback: Arc<FeedbackCollector>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kg=info".parse()?))
        .init();

    let config = AppConfig::from_env();
    config.log_keys();

    let graph_client =
        GraphClient::connect(&config.graph_uri, &config.graph_user, &config.graph_password).await?;
    kg_graph::migrate::migrate(&graph_client, config.embed_dimension)
        .await
        .map_err(|e| anyhow::anyhow!("graph migration failed: {e}"))?;
    let store = Arc::new(GraphStore::new(graph_client));

    let llm = LlmAdapter::new(config.llm_api_key.clone(), config.llm_small_model.clone(), config.llm_model.clone())
        .with_base_url(config.llm_provider_url.clone());

    let embedder = Embedder::new(config.llm_api_key.clone(), config.embed_model.clone())
        .with_base_url(config.embed_provider_url.clone());
    let extractor = Arc::new(ExtractionEngine::new(llm.clone(), embedder.clone()));

    let resolve_config = ResolveConfig {
        sim_high: config.sim_high,
        name_exact: config.name_exact,
        edge_sim: config.edge_sim,
        enable_cross_graph_deduplication: config.enable_cross_graph_deduplication,
    };
    let resolver = Arc::new(ResolveEngine::new((*store).clone(), llm.clone(), resolve_config));

    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig {
        external_webhook_url: config.webhook_url.clone(),
        ..Default::default()
    }));

    let broadcaster = Arc::new(Broadcaster::default());
    dispatcher.register_handler(broadcaster.clone()).await;

    let feedback = Arc::new(FeedbackCollector::new(
        Arc::clone(&store),
        FeedbackConfig { alpha: config.feedback_alpha, commit_window: config.feedback_commit_window },
    ));
    tokio::spawn(Arc::clone(&feedback).run());

    let queue = if config.use_queue_for_ingestion {
        let pool = sqlx::PgPool::connect(&config.queue_url).await?;
        let queue = Queue::new(pool, "ingestion");

        let worker_config = WorkerConfig {
            batch_size: config.batch_size as i64,
            visibility_timeout_secs: config.visibility_timeout.as_secs() as i64,
            parallelism: config.worker_parallelism,
            ..Default::default()
        };
        let worker_max_retries = worker_config.max_retries;
        let worker = Arc::new(Worker::new(
            queue.clone(),
            Arc::clone(&store),
            Arc::clone(&extractor),
            Arc::clone(&resolver),
            Arc::clone(&dispatcher) as Arc<dyn kg_common::EventSink>,
            worker_config,
        ));
        tokio::spawn(worker.run());
        tokio::spawn(kg_queue::sweep::run(
            queue.pool().clone(),
            "ingestion".to_string(),
            worker_max_retries as i32,
            config.dead_letter_sweep_interval,
        ));
        Some(Arc::new(QueueProxy::new(queue, config.visibility_timeout.as_secs() as i64)))
    } else {
        None
    };

    if config.sync_full_on_startup || config.sync_enable_continuous {
        if let (Some(uri), Some(user), Some(password)) = (
            config.graph_secondary_uri.clone(),
            config.graph_secondary_user.clone(),
            config.graph_secondary_password.clone(),
        ) {
            let secondary_client = GraphClient::connect(&uri, &user, &password).await?;
            let secondary = Arc::new(GraphStore::new(secondary_client));
            let orchestrator = Arc::new(SyncOrchestrator::new(
                Arc::clone(&store),
                secondary,
                SyncConfig { interval: config.sync_interval, ..Default::default() },
            ));
            if config.sync_full_on_startup {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    match orchestrator.run_full().await {
                        Ok(report) => info!(
                            nodes_migrated = report.nodes.migrated,
                            nodes_failed = report.nodes.failed,
                            edges_migrated = report.edges.migrated,
                            edges_failed = report.edges.failed,
                            "startup full sync complete"
                        ),
                        Err(e) => warn!(error = %e, "startup full sync failed"),
                    }
                });
            }
            if config.sync_enable_continuous {
                tokio::spawn(continuous_sync_loop(orchestrator, config.sync_interval));
            }
        } else {
            warn!("sync enabled but GRAPH_SECONDARY_* is not fully configured, skipping");
        }
    }

    let state = Arc::new(AppState { config: config.clone(), store, queue, resolver, dispatcher, broadcaster, feedback });

    let app = Router::new()
        .route("/messages", post(post_messages))
        .route("/entity-node", post(post_entity_node))
        .route("/entity-edge/{uuid}", get(get_entity_edge))
        .route("/edges/by-node/{uuid}", get(get_edges_by_node))
        .route("/episodes/{group_id}", get(get_episodes))
        .route("/get-memory", post(post_get_memory))
        .route("/nodes/{uuid}/summary", patch(patch_node_summary))
        .route("/feedback/relevance", post(post_feedback_relevance))
        .route("/healthcheck", get(get_healthcheck))
        .route("/metrics/webhooks", get(get_webhook_metrics))
        .route("/ws", get(get_ws))
        .route("/centrality/pagerank", post(post_centrality_pagerank))
        .route("/centrality/degree", post(post_centrality_degree))
        .route("/centrality/betweenness", post(post_centrality_betweenness))
        .route("/centrality/all", post(post_centrality_all))
        .with_state(state)
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!("http_request", method = %request.method(), path = %request.uri().path())
            }),
        )
        .layer(tower_http::cors::CorsLayer::permissive());

    info!(addr = %config.bind_addr, "knowledge graph ingestion API starting");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn continuous_sync_loop(orchestrator: Arc<SyncOrchestrator>, interval: std::time::Duration) {
    let mut watermark = Utc::now();
    loop {
        tokio::time::sleep(interval).await;
        match orchestrator.run_continuous_once(watermark).await {
            Ok((new_watermark, report)) => {
                watermark = new_watermark;
                info!(migrated = report.migrated, failed = report.failed, "continuous sync tick");
            }
            Err(e) => warn!(error = %e, "continuous sync tick failed"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesRequest {
    uuid: Option<Uuid>,
    group_id: Option<String>,
    name: String,
    content: String,
    role: Option<String>,
    #[serde(default)]
    role_type: Option<String>,
    source: Option<String>,
    source_description: Option<String>,
}

async fn post_messages(State(state): State<Arc<AppState>>, Json(req): Json<MessagesRequest>) -> impl IntoResponse {
    let group_id = req.group_id.clone().unwrap_or_else(|| state.config.group_id_default.clone());
    let payload = json!({
        "uuid": req.uuid.unwrap_or_else(Uuid::new_v4),
        "name": req.name,
        "content": req.content,
        "role": req.role,
        "role_type": req.role_type.unwrap_or_else(|| "user".to_string()),
        "source": req.source,
        "source_description": req.source_description,
        "timestamp": Utc::now(),
    });

    let Some(queue) = &state.queue else {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "queue disabled"}))).into_response();
    };

    match queue.enqueue_message(group_id, payload).await {
        Ok(id) => (axum::http::StatusCode::ACCEPTED, Json(json!({"status": "queued", "task_id": id}))).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to enqueue message");
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "queue unavailable"}))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntityNodeRequest {
    group_id: Option<String>,
    name: String,
    summary: Option<String>,
}

async fn post_entity_node(State(state): State<Arc<AppState>>, Json(req): Json<EntityNodeRequest>) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "name must not be empty"}))).into_response();
    }
    let group_id = req.group_id.unwrap_or_else(|| state.config.group_id_default.clone());

    let embedder = Embedder::new(state.config.llm_api_key.clone(), state.config.embed_model.clone())
        .with_base_url(state.config.embed_provider_url.clone());
    let name_embedding = match kg_embed::TextEmbedder::embed(&embedder, &req.name).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to embed entity name");
            return (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "embedding unavailable"}))).into_response();
        }
    };

    let candidate = kg_extract::CandidateEntity {
        name: req.name.clone(),
        entity_type: "Entity".to_string(),
        attributes: HashMap::new(),
        name_embedding,
    };

    let resolved = match state.resolver.resolve_entities(&group_id, std::slice::from_ref(&candidate)).await {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, "failed to resolve entity node");
            return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response();
        }
    };
    let Some(&uuid) = resolved.get(&req.name) else {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "resolution produced no node"}))).into_response();
    };

    if let Some(summary) = req.summary {
        if let Ok(Some(mut node)) = state.store.get_entity(uuid).await {
            node.summary = summary;
            if let Err(e) = state.store.upsert_entity(&node).await {
                warn!(node = %uuid, error = %e, "failed to persist entity summary");
            }
        }
    }

    state
        .dispatcher
        .emit(DispatchEvent::NodeMutation(kg_common::NodeMutationEvent {
            event_type: "node_mutation".to_string(),
            group_id,
            created_node_uuids: vec![uuid],
            updated_node_uuids: Vec::new(),
            created_edge_uuids: Vec::new(),
            timestamp: Utc::now(),
        }))
        .await;

    (axum::http::StatusCode::CREATED, Json(json!({"uuid": uuid}))).into_response()
}

async fn get_entity_edge(State(state): State<Arc<AppState>>, Path(uuid): Path<Uuid>) -> impl IntoResponse {
    let rows = state.store.execute_query(
        "MATCH ()-[r:RELATES_TO {uuid: $uuid}]->() RETURN r.fact AS fact",
        vec![("uuid", neo4rs::BoltType::String(uuid.to_string().into()))],
    ).await;

    let fact = match rows {
        Ok(rows) => rows.first().and_then(|r| r.get::<String>("fact").ok()),
        Err(e) => {
            warn!(error = %e, "entity-edge lookup failed");
            None
        }
    };

    let Some(fact) = fact else {
        return (axum::http::StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response();
    };

    state
        .dispatcher
        .emit(DispatchEvent::NodeAccess(NodeAccessEvent {
            event_type: "node_access".to_string(),
            node_ids: vec![uuid],
            timestamp: Utc::now(),
            access_type: "direct".to_string(),
            query: None,
            metadata: None,
        }))
        .await;

    (axum::http::StatusCode::OK, Json(json!({"fact": fact}))).into_response()
}

async fn get_edges_by_node(State(state): State<Arc<AppState>>, Path(uuid): Path<Uuid>) -> impl IntoResponse {
    match state.store.edges_by_node(uuid).await {
        Ok(edges) => {
            let source_edges: Vec<_> = edges.iter().filter(|e| e.source_node_uuid == uuid).collect();
            let target_edges: Vec<_> = edges.iter().filter(|e| e.target_node_uuid == uuid).collect();
            Json(json!({
                "edges": edges,
                "source_edges": source_edges,
                "target_edges": target_edges,
            }))
            .into_response()
        }
        Err(e) => {
            warn!(error = %e, "edges-by-node lookup failed");
            (axum::http::StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct EpisodesQuery {
    last_n: Option<u32>,
}

async fn get_episodes(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Query(params): Query<EpisodesQuery>,
) -> impl IntoResponse {
    match state.store.recent_episodes(&group_id, params.last_n.unwrap_or(20)).await {
        Ok(episodes) => Json(json!({"episodes": episodes})).into_response(),
        Err(e) => {
            warn!(error = %e, "episode lookup failed");
            Json(json!({"episodes": []})).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetMemoryRequest {
    group_id: Option<String>,
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    10
}

async fn post_get_memory(State(state): State<Arc<AppState>>, Json(req): Json<GetMemoryRequest>) -> impl IntoResponse {
    let group_id = req.group_id.unwrap_or_else(|| state.config.group_id_default.clone());

    let embedder = Embedder::new(state.config.llm_api_key.clone(), state.config.embed_model.clone())
        .with_base_url(state.config.embed_provider_url.clone());
    let query_vector = match kg_embed::TextEmbedder::embed(&embedder, &req.query).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to embed memory query");
            return (axum::http::StatusCode::OK, Json(json!({"facts": []}))).into_response();
        }
    };

    let matches = state
        .store
        .vector_search_entities(&query_vector, &group_id, state.config.enable_cross_graph_deduplication, req.top_k, 0.0)
        .await
        .unwrap_or_default();

    let node_ids: Vec<Uuid> = matches.iter().map(|m| m.uuid).collect();
    let mut facts = Vec::new();
    for m in &matches {
        if let Ok(edges) = state.store.edges_by_node(m.uuid).await {
            facts.extend(edges.into_iter().map(|e| e.fact));
        }
    }

    if !node_ids.is_empty() {
        state
            .dispatcher
            .emit(DispatchEvent::NodeAccess(NodeAccessEvent {
                event_type: "node_access".to_string(),
                node_ids,
                timestamp: Utc::now(),
                access_type: "search".to_string(),
                query: Some(req.query),
                metadata: None,
            }))
            .await;
    }

    Json(json!({"facts": facts})).into_response()
}

#[derive(Debug, Deserialize)]
struct SummaryUpdate {
    summary: String,
}

async fn patch_node_summary(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
    Json(req): Json<SummaryUpdate>,
) -> impl IntoResponse {
    let Ok(Some(mut node)) = state.store.get_entity(uuid).await else {
        return (axum::http::StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response();
    };
    node.summary = req.summary;
    match state.store.upsert_entity(&node).await {
        Ok(()) => Json(json!(node)).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to update node summary");
            (axum::http::StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn post_feedback_relevance(State(state): State<Arc<AppState>>, Json(req): Json<RelevanceFeedback>) -> impl IntoResponse {
    if req.memory_scores.is_empty() {
        return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "memory_scores must not be empty"}))).into_response();
    }
    state.feedback.submit(req).await;
    (axum::http::StatusCode::OK, Json(json!({"status": "accepted"}))).into_response()
}

async fn get_healthcheck(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue_healthy = match &state.queue {
        Some(queue) => queue.is_healthy().await,
        None => true,
    };

    match state.store.health_check().await {
        Ok(()) if queue_healthy => Json(json!({"status": "healthy"})).into_response(),
        Ok(()) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "degraded", "queue": "unhealthy"}))).into_response(),
        Err(e) => {
            warn!(error = %e, "healthcheck failed");
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "unhealthy"}))).into_response()
        }
    }
}

async fn get_webhook_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = state.dispatcher.metrics();
    Json(json!({
        "events_emitted": metrics.events_emitted.load(std::sync::atomic::Ordering::Relaxed),
        "handler_failures": metrics.handler_failures.load(std::sync::atomic::Ordering::Relaxed),
        "external_webhook_failures": metrics.external_webhook_failures.load(std::sync::atomic::Ordering::Relaxed),
    }))
}

async fn get_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { state.broadcaster.handle_socket(socket).await })
}

#[derive(Debug, Deserialize)]
struct CentralityRequest {
    group_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CentralityResponse {
    scores: HashMap<Uuid, f64>,
    nodes_processed: usize,
}

async fn post_centrality_pagerank(State(state): State<Arc<AppState>>, Json(req): Json<CentralityRequest>) -> impl IntoResponse {
    if !state.config.centrality_enabled {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "centrality disabled"}))).into_response();
    }
    match kg_graph::centrality::pagerank(&state.store, req.group_id.as_deref(), 0.85, 20).await {
        Ok(scores) => {
            for (uuid, value) in &scores {
                if let Err(e) = state.store.set_centrality_pagerank(*uuid, *value).await {
                    warn!(node = %uuid, error = %e, "failed to persist pagerank centrality");
                }
            }
            let nodes_processed = scores.len();
            Json(CentralityResponse { scores, nodes_processed }).into_response()
        }
        Err(e) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn post_centrality_degree(State(state): State<Arc<AppState>>, Json(req): Json<CentralityRequest>) -> impl IntoResponse {
    if !state.config.centrality_enabled {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "centrality disabled"}))).into_response();
    }
    match kg_graph::centrality::degree(&state.store, req.group_id.as_deref(), kg_graph::centrality::DegreeDirection::Both).await {
        Ok(scores) => {
            for (uuid, value) in &scores {
                if let Err(e) = state.store.set_centrality_degree(*uuid, *value).await {
                    warn!(node = %uuid, error = %e, "failed to persist degree centrality");
                }
            }
            let nodes_processed = scores.len();
            Json(CentralityResponse { scores, nodes_processed }).into_response()
        }
        Err(e) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn post_centrality_betweenness(State(state): State<Arc<AppState>>, Json(req): Json<CentralityRequest>) -> impl IntoResponse {
    if !state.config.centrality_enabled {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "centrality disabled"}))).into_response();
    }
    match kg_graph::centrality::betweenness(&state.store, req.group_id.as_deref(), None).await {
        Ok(scores) => {
            for (uuid, value) in &scores {
                if let Err(e) = state.store.set_centrality_betweenness(*uuid, *value).await {
                    warn!(node = %uuid, error = %e, "failed to persist betweenness centrality");
                }
            }
            let nodes_processed = scores.len();
            Json(CentralityResponse { scores, nodes_processed }).into_response()
        }
        Err(e) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn post_centrality_all(State(state): State<Arc<AppState>>, Json(req): Json<CentralityRequest>) -> impl IntoResponse {
    if !state.config.centrality_enabled {
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "centrality disabled"}))).into_response();
    }
    match kg_graph::centrality::all(&state.store, req.group_id.as_deref()).await {
        Ok(scores) => {
            for (uuid, value) in &scores.pagerank {
                if let Err(e) = state.store.set_centrality_pagerank(*uuid, *value).await {
                    warn!(node = %uuid, error = %e, "failed to persist pagerank centrality");
                }
            }
            for (uuid, value) in &scores.degree {
                if let Err(e) = state.store.set_centrality_degree(*uuid, *value).await {
                    warn!(node = %uuid, error = %e, "failed to persist degree centrality");
                }
            }
            for (uuid, value) in &scores.betweenness {
                if let Err(e) = state.store.set_centrality_betweenness(*uuid, *value).await {
                    warn!(node = %uuid, error = %e, "failed to persist betweenness centrality");
                }
            }
            let nodes_processed = scores.pagerank.len();
            Json(json!({"scores": scores_to_json(&scores), "nodes_processed": nodes_processed})).into_response()
        }
        Err(e) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

fn scores_to_json(scores: &kg_graph::centrality::CentralityScores) -> serde_json::Value {
    json!({
        "pagerank": scores.pagerank,
        "degree": scores.degree,
        "betweenness": scores.betweenness,
    })
}
