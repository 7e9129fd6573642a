//! End-to-end pipeline tests.
//!
//! Drives the real service wiring (SQLite store, GitHub client, task service
//! client) against wiremock stand-ins for GitHub and the task service.
//!
//! Run with:
//! ```sh
//! cargo test -p remediation --test pipeline_tests
//! ```

#![allow(clippy::too_many_lines)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use notify::{FixEvent, MemoryChannel, Notifier};
use remediation::ci::{
    build_router, CompletionOutcome, FixStatus, MessageBus, MessageConsumer, ServerState,
};
use remediation::retry::RetryPolicy;
use remediation::store::Store;
use remediation::{RemediationConfig, Service};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JOB_LOG: &str = "2026-03-02T09:15:01.0000000Z ##[group]Run dotnet build\n\
    2026-03-02T09:15:04.0000000Z Program.cs(12,31): error CS1002: ; expected\n\
    2026-03-02T09:15:04.0000000Z ```injected fence```\n\
    2026-03-02T09:15:05.0000000Z ##[error]Process completed with exit code 1.\n";

fn config(server: &MockServer) -> RemediationConfig {
    let mut config = RemediationConfig::default();
    config.github.api_url = server.uri();
    config.github.token = Some("test-token".into());
    config.task_service.url = server.uri();
    config.store.database_url = Some("sqlite::memory:".into());
    config.poller.repositories = vec!["acme/widgets".into()];
    config.poller.retry = RetryPolicy::new(1, 1, 1);
    config.consumer.redelivery_delay_ms = 5;
    config
}

async fn service(server: &MockServer) -> (Service, broadcast::Receiver<FixEvent>) {
    let channel = Arc::new(MemoryChannel::default());
    let events = channel.subscribe();
    let service = Service::build(config(server), Notifier::with_channels(vec![channel]))
        .await
        .unwrap();
    (service, events)
}

async fn mount_ci(server: &MockServer) {
    let now = Utc::now().to_rfc3339();
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/actions/runs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total_count": 2,
            "workflow_runs": [
                {
                    "id": 101,
                    "name": "CI",
                    "head_branch": "develop",
                    "head_sha": "c0ffee",
                    "status": "completed",
                    "conclusion": "failure",
                    "html_url": "https://github.com/acme/widgets/actions/runs/101",
                    "created_at": now,
                    "run_started_at": now,
                    "updated_at": now
                },
                {
                    "id": 102,
                    "name": "CI",
                    "head_branch": "develop",
                    "head_sha": "beef",
                    "status": "completed",
                    "conclusion": "success",
                    "html_url": "https://github.com/acme/widgets/actions/runs/102",
                    "created_at": now,
                    "run_started_at": now,
                    "updated_at": now
                }
            ]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/actions/runs/101/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total_count": 1,
            "jobs": [{
                "id": 9001,
                "run_id": 101,
                "name": "build",
                "conclusion": "failure",
                "completed_at": now
            }]
        })))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/actions/jobs/9001/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(JOB_LOG))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_task_service(server: &MockServer, task_id: u64) {
    Mock::given(method("POST"))
        .and(path("/api/tasks"))
        .and(body_partial_json(serde_json::json!({
            "title": "Fix compilation_error in acme/widgets"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": task_id,
            "status": "pending",
            "type": "bug_fix",
            "complexity": "simple"
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_poll_to_pull_request() {
    let server = MockServer::start().await;
    mount_ci(&server).await;
    mount_task_service(&server, 42).await;

    let (service, mut events) = service(&server).await;
    let mut poller = service.poller();

    let summary = poller.poll_once().await.unwrap();
    assert_eq!(summary.runs_seen, 2);
    assert_eq!(summary.attempts_created, 1);
    assert_eq!(summary.builds_recorded, 2);

    let store = service.store();
    let attempt = store.find_attempt_by_task("42").await.unwrap().unwrap();
    assert_eq!(attempt.status, FixStatus::InProgress);
    assert_eq!(attempt.error_pattern.as_deref(), Some("compilation_error"));

    let build = store.get_build_by_run(101).await.unwrap().unwrap();
    assert_eq!(build.branch, "develop");
    assert!(build.error_messages[0].contains("CS1002"));

    let Ok(FixEvent::FixAttempted { task_id, .. }) = events.try_recv() else {
        panic!("expected FixAttempted");
    };
    assert_eq!(task_id, "42");

    Mock::given(method("POST"))
        .and(path("/repos/acme/widgets/pulls"))
        .and(body_partial_json(serde_json::json!({
            "base": "develop",
            "head": format!("automated-fix/{}", attempt.id)
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": 5551,
            "number": 17,
            "html_url": "https://github.com/acme/widgets/pull/17",
            "title": "Automated fix: compilation_error in widgets"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = service
        .orchestrator()
        .process_task_completion("42", true)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Succeeded {
            number: 17,
            url: "https://github.com/acme/widgets/pull/17".into()
        }
    );

    // Redelivered completion is a no-op.
    let again = service
        .orchestrator()
        .process_task_completion("42", true)
        .await
        .unwrap();
    assert_eq!(again, CompletionOutcome::AlreadyFinalized(FixStatus::Succeeded));

    let stored = store.get_attempt(attempt.id).await.unwrap().unwrap();
    assert_eq!(stored.status, FixStatus::Succeeded);
    assert_eq!(stored.pull_request_number, Some(17));

    let Ok(FixEvent::FixSucceeded { pull_request_number, .. }) = events.try_recv() else {
        panic!("expected FixSucceeded");
    };
    assert_eq!(pull_request_number, 17);

    // Untrusted log text never opens a fence in what leaves the service.
    for request in server.received_requests().await.unwrap() {
        if request.method.as_str() == "POST" {
            let body = String::from_utf8_lossy(&request.body);
            assert!(!body.contains("```"), "fence leaked into {}", request.url);
        }
    }

    // Second poll finds both runs terminal.
    let summary = poller.poll_once().await.unwrap();
    assert_eq!(summary.failures_dispatched, 0);

    let counts = store.attempt_counts().await.unwrap();
    assert_eq!(counts.succeeded, 1);
    assert_eq!(counts.in_progress, 0);
}

#[tokio::test]
async fn test_http_intake_through_consumer() {
    let server = MockServer::start().await;
    mount_task_service(&server, 77).await;

    let (service, mut events) = service(&server).await;
    let (bus, receiver) = MessageBus::channel(8);
    let consumer = Arc::new(MessageConsumer::new(
        service.orchestrator().clone(),
        bus.clone(),
        service.config().consumer.clone(),
    ));
    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(consumer.run(receiver, shutdown.clone()));

    let router = build_router(Arc::new(ServerState {
        bus,
        store: service.store().clone(),
        patterns: vec![],
    }));

    let response = router
        .clone()
        .oneshot(
            Request::post("/api/events/build-failed")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "repository": "acme/widgets",
                        "branch": "main",
                        "commitSha": "abc123",
                        "errorMessage": "error CS1002: ; expected",
                        "workflowName": "CI"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut attempt = None;
    for _ in 0..200 {
        attempt = service.store().find_attempt_by_task("77").await.unwrap();
        if attempt.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let attempt = attempt.expect("attempt recorded");
    assert_eq!(attempt.repository, "acme/widgets");

    // Task failed: no pull request, attempt marked failed.
    let response = router
        .oneshot(
            Request::post("/api/events/task-completed")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"taskId": "77", "success": false}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut status = FixStatus::InProgress;
    for _ in 0..200 {
        status = service
            .store()
            .get_attempt(attempt.id)
            .await
            .unwrap()
            .unwrap()
            .status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, FixStatus::Failed);

    shutdown.cancel();
    worker.await.unwrap();

    assert!(matches!(events.try_recv(), Ok(FixEvent::FixAttempted { .. })));
    let Ok(FixEvent::FixFailed { reason, .. }) = events.try_recv() else {
        panic!("expected FixFailed");
    };
    assert_eq!(reason, "Task execution failed");
}
