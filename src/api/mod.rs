//! HTTP API: submit a question, get an answer.
//!
//! - `POST /api/query` with `{"query": "..."}` runs one agent turn.
//! - `GET /api/health` reports readiness.

pub mod types;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent::Agent;
use crate::config::Config;
use types::{ErrorResponse, HealthResponse, QueryRequest, QueryResponse, QueryStatus};

/// Longest question accepted, in characters.
const MAX_QUERY_CHARS: usize = 4000;

/// Shared state for all handlers.
pub struct AppState {
    pub agent: Arc<Agent>,
}

/// Build the router over an existing agent.
pub fn router(agent: Arc<Agent>) -> Router {
    let state = Arc::new(AppState { agent });
    Router::new()
        .route("/api/health", get(health))
        .route("/api/query", post(query))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build the agent from `config` and serve until the process exits.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let agent = Agent::from_config(&config).await?;
    if !agent.embedding_ready() {
        tracing::warn!("Schema retrieval is disabled: embedding model did not initialize");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, router(Arc::new(agent))).await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.agent.model().to_string(),
        embedding_ready: state.agent.embedding_ready(),
    })
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn query(State(state): State<Arc<AppState>>, Json(req): Json<QueryRequest>) -> Response {
    let question = req.query.trim();
    if question.is_empty() {
        return bad_request("query must not be empty");
    }
    if question.chars().count() > MAX_QUERY_CHARS {
        return bad_request("query is too long");
    }

    let id = Uuid::new_v4();
    tracing::info!("Query {} received", id);
    let outcome = state.agent.run_turn(question).await;

    let (status, answer) = match outcome.result {
        Ok(answer) => (QueryStatus::Answered, answer),
        Err(e) => (QueryStatus::Failed, e.user_message()),
    };
    let response = QueryResponse {
        id,
        status,
        answer,
        steps: outcome.transcript.len(),
        transcript: req
            .include_transcript
            .then(|| outcome.transcript.steps().to_vec()),
        completed_at: Utc::now(),
    };
    Json(response).into_response()
}
