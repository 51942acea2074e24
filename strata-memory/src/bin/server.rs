//! Strata Memory Server
//!
//! HTTP API for the memory system, plus the periodic reorganizer schedule.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use strata_memory::{
    config::Config,
    embedding::TokenCounter,
    graph::RestoreSummary,
    memory::{AddOutcome, MemoryStats, TieredMemory},
    node::{MemoryNode, NodeType, Tier},
    oracle::HttpOracle,
    reorganizer::{ReorganizeReport, Reorganizer},
    retrieval::RetrievalContext,
    Error,
};

/// Application state shared across handlers
struct AppState {
    memory: TieredMemory,
    reorganizer: Reorganizer,
    token_counter: TokenCounter,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::default();
    tracing::info!("Starting Strata Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    // Initialize components
    let memory = TieredMemory::open(config.clone()).await?;
    let oracle = Arc::new(HttpOracle::new(&config)?);
    let reorganizer = Reorganizer::for_memory(&memory, oracle);
    let token_counter = TokenCounter::for_gpt()?;

    let state = Arc::new(AppState {
        memory,
        reorganizer,
        token_counter,
    });

    if let Some(interval) = config.reorganize_interval {
        tokio::spawn(schedule_reorganizer(state.clone(), interval));
    }

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Write path and retrieval
        .route("/memories", post(add_memories))
        .route("/search", post(search))
        // Nodes
        .route("/nodes/:id", get(get_node).delete(delete_node))
        // Per-owner graphs
        .route("/owners/:owner_id/render", get(render_owner))
        .route("/owners/:owner_id/save", post(save_owner))
        .route("/owners/:owner_id/load", post(load_owner))
        // Maintenance
        .route("/reorganize/:tier", post(reorganize))
        .route("/stats", get(stats))
        // Token counting
        .route("/tokens/count", post(count_tokens))
        // Add CORS
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Run the reorganizer over the graph tiers every `interval`
async fn schedule_reorganizer(state: SharedState, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        for tier in [Tier::LongTerm, Tier::User] {
            match state.reorganizer.run(tier).await {
                Ok(report) => tracing::info!(%tier, outcome = ?report.outcome, "Scheduled reorganize done"),
                Err(e) => tracing::warn!(%tier, error = %e, "Scheduled reorganize failed"),
            }
        }
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: Error) -> StatusCode {
    tracing::warn!(error = %error, "Request failed");
    status_for(&error)
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

// --- Memory handlers ---

#[derive(Debug, Deserialize)]
struct NewMemory {
    content: String,
    tier: String,
    node_type: Option<String>,
    key: Option<String>,
    tags: Option<Vec<String>>,
    background: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddMemoriesRequest {
    owner_id: String,
    memories: Vec<NewMemory>,
}

async fn add_memories(
    State(state): State<SharedState>,
    Json(req): Json<AddMemoriesRequest>,
) -> Result<Json<Vec<AddOutcome>>, StatusCode> {
    let mut nodes = Vec::with_capacity(req.memories.len());
    for m in req.memories {
        let tier: Tier = m.tier.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
        let node_type: NodeType = match m.node_type {
            Some(t) => t.parse().map_err(|_| StatusCode::BAD_REQUEST)?,
            None => NodeType::Fact,
        };

        let mut node = MemoryNode::new(req.owner_id.clone(), tier, node_type, m.content);
        if let Some(key) = m.key {
            node = node.with_key(key);
        }
        if let Some(tags) = m.tags {
            node = node.with_tags(tags);
        }
        if let Some(background) = m.background {
            node = node.with_background(background);
        }
        if let Some(session_id) = m.session_id {
            node = node.with_session(session_id);
        }
        nodes.push(node);
    }

    let outcomes = state.memory.add(nodes).await.map_err(reject)?;
    Ok(Json(outcomes))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    owner_id: String,
    query: String,
    top_k: Option<usize>,
}

async fn search(
    State(state): State<SharedState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<RetrievalContext>, StatusCode> {
    let top_k = req
        .top_k
        .unwrap_or(state.memory.config().max_retrieval_results);
    let context = state
        .memory
        .search(&req.query, top_k, &req.owner_id)
        .await
        .map_err(reject)?;
    Ok(Json(context))
}

async fn get_node(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<NodeResponse>, StatusCode> {
    let uuid = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let node = state.memory.get(uuid).ok_or(StatusCode::NOT_FOUND)?;

    let graph = state.memory.graph();
    Ok(Json(NodeResponse {
        parent_id: graph.parent_of(uuid),
        children_ids: graph.children_ids(uuid),
        node,
    }))
}

async fn delete_node(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let uuid = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    state.memory.delete(uuid).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Owner graph handlers ---

#[derive(Debug, Deserialize)]
struct RenderQuery {
    detail: Option<bool>,
    top_k: Option<usize>,
}

async fn render_owner(
    State(state): State<SharedState>,
    Path(owner_id): Path<String>,
    Query(query): Query<RenderQuery>,
) -> String {
    state.memory.graph().render(
        None,
        Some(&owner_id),
        query.detail.unwrap_or(false),
        query.top_k,
    )
}

async fn save_owner(
    State(state): State<SharedState>,
    Path(owner_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state.memory.save(&owner_id).map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct LoadResponse {
    nodes: usize,
    edges: usize,
    skipped_edges: usize,
}

impl From<RestoreSummary> for LoadResponse {
    fn from(s: RestoreSummary) -> Self {
        Self {
            nodes: s.nodes,
            edges: s.edges,
            skipped_edges: s.skipped_edges,
        }
    }
}

async fn load_owner(
    State(state): State<SharedState>,
    Path(owner_id): Path<String>,
) -> Result<Json<LoadResponse>, StatusCode> {
    let summary = state
        .memory
        .load(&owner_id)
        .await
        .map_err(reject)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(LoadResponse::from(summary)))
}

// --- Maintenance handlers ---

async fn reorganize(
    State(state): State<SharedState>,
    Path(tier): Path<String>,
) -> Result<Json<ReorganizeReport>, StatusCode> {
    let tier: Tier = tier.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let report = state.reorganizer.run(tier).await.map_err(reject)?;
    Ok(Json(report))
}

async fn stats(State(state): State<SharedState>) -> Json<MemoryStats> {
    Json(state.memory.stats())
}

// --- Token handlers ---

#[derive(Debug, Deserialize)]
struct CountTokensRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct CountTokensResponse {
    tokens: u32,
}

async fn count_tokens(
    State(state): State<SharedState>,
    Json(req): Json<CountTokensRequest>,
) -> Json<CountTokensResponse> {
    let tokens = state.token_counter.count(&req.text);
    Json(CountTokensResponse { tokens })
}

// === Response types ===

#[derive(Debug, Serialize)]
struct NodeResponse {
    #[serde(flatten)]
    node: MemoryNode,
    parent_id: Option<Uuid>,
    children_ids: Vec<Uuid>,
}
