//! Task-execution service client.
//!
//! The orchestrator hands each classified failure to an external task
//! service that performs the actual code change. Completion comes back
//! asynchronously as a `TaskCompleted` message.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Request for a new fix task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRequest {
    pub title: String,
    pub description: String,
}

/// Kind of work the task service decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    BugFix,
    Feature,
    Refactor,
    Documentation,
    Test,
    Deployment,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Complexity estimate reported by the task service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Simple,
    Medium,
    Complex,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Task as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub status: String,
    pub kind: TaskKind,
    pub complexity: TaskComplexity,
    pub created_at: Option<DateTime<Utc>>,
}

/// Task-service failures.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Task service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Task service returned {status}")]
    Rejected { status: u16 },

    #[error("Task service response missing task id")]
    MissingTaskId,
}

impl ExecutorError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "TaskServiceUnavailable",
            Self::Rejected { .. } => "TaskServiceRejected",
            Self::MissingTaskId => "TaskServiceInvalidResponse",
        }
    }
}

/// Creates fix tasks.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_task(&self, request: &TaskRequest) -> Result<TaskInfo, ExecutorError>;
}

/// Wire shape of a created task. Ids may be numeric or strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResponse {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<serde_json::Value>,
    #[serde(default)]
    complexity: Option<serde_json::Value>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl TaskResponse {
    fn into_info(self) -> Result<TaskInfo, ExecutorError> {
        let id = match self.id {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(ExecutorError::MissingTaskId),
        };

        // Unknown or malformed classifications are informational only.
        let kind = self
            .kind
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let complexity = self
            .complexity
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Ok(TaskInfo {
            id,
            status: self.status.unwrap_or_else(|| "pending".to_string()),
            kind,
            complexity,
            created_at: self.created_at,
        })
    }
}

/// HTTP client for the task service (`POST {base}/api/tasks`).
pub struct HttpTaskExecutor {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTaskExecutor")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl HttpTaskExecutor {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("remediator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_task(&self, request: &TaskRequest) -> Result<TaskInfo, ExecutorError> {
        let url = format!("{}/api/tasks", self.base_url);
        debug!(url = %url, title = %request.title, "Creating fix task");

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Rejected {
                status: status.as_u16(),
            });
        }

        let body: TaskResponse = response.json().await?;
        body.into_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> TaskRequest {
        TaskRequest {
            title: "Fix compilation_error in acme/widgets".into(),
            description: "details".into(),
        }
    }

    fn executor(server: &MockServer, key: Option<&str>) -> HttpTaskExecutor {
        HttpTaskExecutor::new(&server.uri(), key.map(String::from), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_create_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tasks"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"title": "Fix compilation_error in acme/widgets"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "task-123",
                "status": "pending",
                "type": "bug_fix",
                "complexity": "simple",
                "createdAt": "2026-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let task = executor(&server, Some("secret")).create_task(&request()).await.unwrap();
        assert_eq!(task.id, "task-123");
        assert_eq!(task.kind, TaskKind::BugFix);
        assert_eq!(task.complexity, TaskComplexity::Simple);
        assert!(task.created_at.is_some());
    }

    #[tokio::test]
    async fn test_numeric_id_and_unknown_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 991,
                "type": "chore",
                "complexity": 3
            })))
            .mount(&server)
            .await;

        let task = executor(&server, None).create_task(&request()).await.unwrap();
        assert_eq!(task.id, "991");
        assert_eq!(task.kind, TaskKind::Unknown);
        assert_eq!(task.complexity, TaskComplexity::Unknown);
        assert_eq!(task.status, "pending");
    }

    #[tokio::test]
    async fn test_missing_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "pending"})))
            .mount(&server)
            .await;

        let err = executor(&server, None).create_task(&request()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::MissingTaskId));
        assert_eq!(err.kind(), "TaskServiceInvalidResponse");
    }

    #[tokio::test]
    async fn test_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = executor(&server, None).create_task(&request()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Rejected { status: 503 }));
    }

    #[test]
    fn test_debug_redacts_key() {
        let exec =
            HttpTaskExecutor::new("http://localhost", Some("secret".into()), Duration::from_secs(1)).unwrap();
        let rendered = format!("{exec:?}");
        assert!(!rendered.contains("secret"));
    }
}
