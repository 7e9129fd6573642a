//! HTTP server for the remediation pipeline.
//!
//! Provides REST API endpoints for:
//! - Health checks
//! - Accepting `BuildFailed` / `TaskCompleted` events onto the message queue
//! - Querying fix attempt totals

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::consumer::{MessageBus, PipelineMessage};
use super::types::BuildFailure;
use crate::store::{AttemptCounts, Store};

/// Request bodies larger than this are rejected (logs are embedded).
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Server state shared across handlers.
pub struct ServerState {
    /// Queue feeding the message consumer
    pub bus: MessageBus,
    /// Store, for status totals
    pub store: Arc<dyn Store>,
    /// Classification labels in effect
    pub patterns: Vec<String>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/events/build-failed", post(build_failed_handler))
        .route("/api/events/task-completed", post(task_completed_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn run_server(
    state: Arc<ServerState>,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Remediation server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Build failure reported by an external CI integration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFailedRequest {
    pub repository: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_sha: String,
    pub error_message: String,
    #[serde(default)]
    pub error_log: Option<String>,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl BuildFailedRequest {
    fn into_failure(self) -> BuildFailure {
        let mut failure = BuildFailure::new(self.repository, self.error_message)
            .with_branch(self.branch)
            .with_commit(self.commit_sha)
            .with_workflow(self.workflow_name);
        failure.job_name = self.job_name;
        failure.error_log = self.error_log;
        if let Some(failed_at) = self.failed_at {
            failure.failed_at = failed_at;
        }
        failure
    }
}

/// Task-service completion callback.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedRequest {
    pub task_id: String,
    pub success: bool,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    reason: String,
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    status: &'static str,
    queue_open: bool,
    attempts: AttemptCounts,
    patterns: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.store.attempt_counts().await {
        Ok(attempts) => (
            StatusCode::OK,
            Json(ServerStatus {
                status: "running",
                queue_open: !state.bus.is_closed(),
                attempts,
                patterns: state.patterns.clone(),
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read attempt totals");
            rejected(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
        }
    }
}

async fn build_failed_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BuildFailedRequest>,
) -> axum::response::Response {
    if request.repository.trim().is_empty() || request.error_message.trim().is_empty() {
        warn!("Rejected build failure without repository or error message");
        return rejected(StatusCode::BAD_REQUEST, "repository and errorMessage are required");
    }

    let failure = request.into_failure();
    let id = failure.id.to_string();
    info!(failure_id = %id, repository = %failure.repository, "Received build failure");
    enqueue(&state, PipelineMessage::BuildFailed(failure), Some(id)).await
}

async fn task_completed_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<TaskCompletedRequest>,
) -> axum::response::Response {
    if request.task_id.trim().is_empty() {
        return rejected(StatusCode::BAD_REQUEST, "taskId is required");
    }

    info!(task_id = %request.task_id, success = request.success, "Received task completion");
    let message = PipelineMessage::TaskCompleted {
        task_id: request.task_id,
        success: request.success,
    };
    enqueue(&state, message, None).await
}

// ============================================================================
// Helper functions
// ============================================================================

async fn enqueue(
    state: &ServerState,
    message: PipelineMessage,
    id: Option<String>,
) -> axum::response::Response {
    match state.bus.publish(message).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                status: "accepted",
                id,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to enqueue message");
            rejected(StatusCode::SERVICE_UNAVAILABLE, "Queue closed")
        }
    }
}

fn rejected(status: StatusCode, reason: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            status: "rejected",
            reason: reason.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::consumer::Delivery;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> (Arc<ServerState>, tokio::sync::mpsc::Receiver<Delivery>) {
        let (bus, receiver) = MessageBus::channel(8);
        let state = Arc::new(ServerState {
            bus,
            store: Arc::new(MemoryStore::new()),
            patterns: vec!["compilation_error".into()],
        });
        (state, receiver)
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _rx) = state();
        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_build_failed_is_enqueued() {
        let (state, mut rx) = state();
        let response = build_router(state)
            .oneshot(post_json(
                "/api/events/build-failed",
                &serde_json::json!({
                    "repository": "acme/widgets",
                    "branch": "main",
                    "commitSha": "abc",
                    "errorMessage": "error CS1002: ; expected",
                    "jobName": "build"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.attempt, 1);
        let PipelineMessage::BuildFailed(failure) = delivery.message else {
            panic!("expected build failure");
        };
        assert_eq!(failure.repository, "acme/widgets");
        assert_eq!(failure.job_name.as_deref(), Some("build"));
        assert!(failure.error_pattern.is_none());
    }

    #[tokio::test]
    async fn test_build_failed_requires_message() {
        let (state, mut rx) = state();
        let response = build_router(state)
            .oneshot(post_json(
                "/api/events/build-failed",
                &serde_json::json!({"repository": "acme/widgets", "errorMessage": "  "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_task_completed_is_enqueued() {
        let (state, mut rx) = state();
        let response = build_router(state)
            .oneshot(post_json(
                "/api/events/task-completed",
                &serde_json::json!({"taskId": "T1", "success": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            rx.try_recv().unwrap().message,
            PipelineMessage::TaskCompleted {
                task_id: "T1".into(),
                success: false
            }
        );
    }

    #[tokio::test]
    async fn test_closed_queue_returns_unavailable() {
        let (state, rx) = state();
        drop(rx);
        let response = build_router(state)
            .oneshot(post_json(
                "/api/events/task-completed",
                &serde_json::json!({"taskId": "T1", "success": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let (state, _rx) = state();
        let response = build_router(state)
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["attempts"]["in_progress"], 0);
        assert_eq!(body["queue_open"], true);
        assert_eq!(body["patterns"][0], "compilation_error");
    }
}
