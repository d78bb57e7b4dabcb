//! REST API Server for the capital call workflow
//!
//! Hosts threads over HTTP: start a thread, post user messages, resume a
//! suspended thread with an approve/reject decision, read state and history.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::agent::Orchestrator;
use crate::error::WorkflowError;
use crate::models::{ResumeDecision, UserContext};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StartThreadRequest {
    pub thread_id: Option<String>,
    pub user_id: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn respond<T: Serialize>(result: crate::Result<T>) -> ApiResult {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                warn!(error = %e, "Request failed");
            }
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}

pub fn error_status(error: &WorkflowError) -> StatusCode {
    match error {
        WorkflowError::ThreadNotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::ThreadExists(_)
        | WorkflowError::ThreadClosed { .. }
        | WorkflowError::NotSuspended(_)
        | WorkflowError::StaleResume { .. } => StatusCode::CONFLICT,
        WorkflowError::ValidationError(_) => StatusCode::BAD_REQUEST,
        WorkflowError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Handlers
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn start_thread(
    State(state): State<ApiState>,
    Json(req): Json<StartThreadRequest>,
) -> ApiResult {
    if req.user_id.trim().is_empty() {
        return respond::<()>(Err(WorkflowError::ValidationError(
            "user_id is required".into(),
        )));
    }

    let display_name = req.display_name.unwrap_or_else(|| req.user_id.clone());
    let user = req
        .permissions
        .into_iter()
        .fold(UserContext::new(req.user_id, display_name), |user, p| {
            user.with_permission(p)
        });

    info!(user_id = %user.user_id, "Start thread request");
    respond(state.orchestrator.start_thread(req.thread_id, user).await)
}

async fn get_thread(State(state): State<ApiState>, Path(thread_id): Path<String>) -> ApiResult {
    respond(state.orchestrator.snapshot(&thread_id).await)
}

async fn post_message(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> ApiResult {
    info!(thread_id = %thread_id, "Message received");
    respond(state.orchestrator.send_message(&thread_id, &req.content).await)
}

async fn resume_thread(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
    Json(decision): Json<ResumeDecision>,
) -> ApiResult {
    info!(thread_id = %thread_id, approved = decision.approved, "Resume received");
    respond(state.orchestrator.resume(&thread_id, decision).await)
}

async fn thread_history(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> ApiResult {
    respond(state.orchestrator.history(&thread_id).await)
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/threads", post(start_thread))
        .route("/api/threads/:id", get(get_thread))
        .route("/api/threads/:id/messages", post(post_message))
        .route("/api/threads/:id/resume", post(resume_thread))
        .route("/api/threads/:id/history", get(thread_history))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
