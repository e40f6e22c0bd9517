use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lakeflow::auth::StaticTokenProvider;
use lakeflow::config::parse_config;
use lakeflow::poll::Sleeper;
use lakeflow::session::{ComputeSessionManager, SessionError};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

fn manager(server: &MockServer, compute_toml: &str) -> ComputeSessionManager {
    let config = parse_config(&format!("[compute]\n{}", compute_toml)).unwrap();
    ComputeSessionManager::new(
        &config.compute,
        &server.uri(),
        Arc::new(StaticTokenProvider::new("spark-token")),
    )
    .unwrap()
    .with_sleeper(Arc::new(NoSleep))
}

async fn mount_create(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/sparkSessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7, "state": "starting"})))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_idle(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7, "state": "idle"})))
        .mount(server)
        .await;
}

async fn mount_submit(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/sparkSessions/7/statements"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 0, "state": "waiting"})))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_delete(server: &MockServer, status: u16) {
    Mock::given(method("DELETE"))
        .and(path("/sparkSessions/7"))
        .respond_with(ResponseTemplate::new(status))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn statement_runs_and_session_is_stopped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sparkSessions"))
        .and(header("authorization", "Bearer spark-token"))
        .and(body_partial_json(json!({
            "name": "lakeflow-table-load",
            "kind": "pyspark",
            "driverMemory": "28g",
            "numExecutors": 1
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7, "state": "starting"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "starting"})))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_idle(&server).await;
    Mock::given(method("POST"))
        .and(path("/sparkSessions/7/statements"))
        .and(body_partial_json(json!({"code": "print(1)", "kind": "pyspark"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 0, "state": "waiting"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7/statements/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 0, "state": "running"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7/statements/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 0,
            "state": "available",
            "output": {"status": "ok", "data": {"text/plain": "1"}}
        })))
        .mount(&server)
        .await;
    mount_delete(&server, 200).await;

    let output = manager(&server, "").run_statement("print(1)").await.unwrap();
    assert_eq!(output.text.as_deref(), Some("1"));
}

#[tokio::test]
async fn statement_error_still_stops_session_once() {
    let server = MockServer::start().await;
    mount_create(&server).await;
    mount_idle(&server).await;
    mount_submit(&server).await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7/statements/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 0,
            "state": "available",
            "output": {
                "status": "error",
                "ename": "AnalysisException",
                "evalue": "[TABLE_OR_VIEW_NOT_FOUND] document_headers"
            }
        })))
        .mount(&server)
        .await;
    mount_delete(&server, 200).await;

    let err = manager(&server, "").run_statement("boom()").await.unwrap_err();
    match err {
        SessionError::Failed(message) => {
            assert!(message.contains("AnalysisException: [TABLE_OR_VIEW_NOT_FOUND]"), "{}", message)
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn dead_session_fails_and_is_stopped() {
    let server = MockServer::start().await;
    mount_create(&server).await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "dead"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sparkSessions/7/statements"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    mount_delete(&server, 200).await;

    let err = manager(&server, "").run_statement("print(1)").await.unwrap_err();
    match err {
        SessionError::Failed(message) => assert!(message.contains("dead"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn readiness_timeout_is_distinct_and_tears_down() {
    let server = MockServer::start().await;
    mount_create(&server).await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "starting"})))
        .expect(3)
        .mount(&server)
        .await;
    mount_delete(&server, 200).await;

    let mgr = manager(&server, "poll_interval_secs = 5\nsession_timeout_secs = 15\n");
    assert_eq!(mgr.readiness_policy().max_attempts, 3);
    let err = mgr.run_statement("print(1)").await.unwrap_err();
    match err {
        SessionError::TimedOut(message) => {
            assert!(message.contains("timed out after 3 attempts"), "{}", message);
            assert!(message.contains("starting"), "{}", message);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn statement_timeout_uses_completion_ceiling() {
    let server = MockServer::start().await;
    mount_create(&server).await;
    mount_idle(&server).await;
    mount_submit(&server).await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7/statements/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "running"})))
        .expect(4)
        .mount(&server)
        .await;
    mount_delete(&server, 200).await;

    let mgr = manager(&server, "poll_interval_secs = 5\nstatement_timeout_secs = 17\n");
    let err = mgr.run_statement("spin()").await.unwrap_err();
    assert!(matches!(err, SessionError::TimedOut(_)), "{:?}", err);
}

#[tokio::test]
async fn missing_capability_is_unavailable_without_teardown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sparkSessions"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = manager(&server, "").run_statement("print(1)").await.unwrap_err();
    assert!(matches!(err, SessionError::Unavailable(_)), "{:?}", err);
}

#[tokio::test]
async fn not_provisioned_body_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sparkSessions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string(r#"{"errorCode":"CapacityNotProvisioned","message":"Spark is not provisioned"}"#),
        )
        .mount(&server)
        .await;

    let err = manager(&server, "").create_session().await.unwrap_err();
    assert!(matches!(err, SessionError::Unavailable(_)), "{:?}", err);
}

#[tokio::test]
async fn other_creation_failures_are_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sparkSessions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&server)
        .await;

    let err = manager(&server, "").create_session().await.unwrap_err();
    assert!(matches!(err, SessionError::Other(_)), "{:?}", err);
    assert!(err.to_string().contains("HTTP 500"));
}

#[tokio::test]
async fn teardown_failure_does_not_mask_result() {
    let server = MockServer::start().await;
    mount_create(&server).await;
    mount_idle(&server).await;
    mount_submit(&server).await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7/statements/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": "available",
            "output": {"status": "ok", "data": {"text/plain": "done"}}
        })))
        .mount(&server)
        .await;
    mount_delete(&server, 500).await;

    let output = manager(&server, "").run_statement("print('done')").await.unwrap();
    assert_eq!(output.text.as_deref(), Some("done"));
}

#[tokio::test]
async fn teardown_failure_keeps_primary_error() {
    let server = MockServer::start().await;
    mount_create(&server).await;
    Mock::given(method("GET"))
        .and(path("/sparkSessions/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "error"})))
        .mount(&server)
        .await;
    mount_delete(&server, 503).await;

    let err = manager(&server, "").run_statement("print(1)").await.unwrap_err();
    assert!(matches!(err, SessionError::Failed(_)), "{:?}", err);
}
