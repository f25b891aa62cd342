use crate::service::FunctionService;
use crate::{create_app, AppState};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use faas_common::{Function, TransportKind};
use faas_executor::testing::{stdout_logs, FakeBehavior, FakeRuntime};
use faas_executor::{
    BuildPipeline, InvocationEngine, InvocationTransport, StdioTransport, TelemetryHandle,
    TelemetryPipeline,
};
use faas_store::{FunctionRegistry, InMemoryMetricStore, InMemoryRegistry, MetricStore, StoreError};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    runtime: FakeRuntime,
    metrics: InMemoryMetricStore,
    telemetry: TelemetryHandle,
}

fn create_test_app() -> TestApp {
    create_test_app_with(Arc::new(InMemoryRegistry::new()))
}

fn create_test_app_with(registry: Arc<dyn FunctionRegistry>) -> TestApp {
    let runtime = FakeRuntime::new();
    let metrics = InMemoryMetricStore::new();
    let (sender, telemetry) = TelemetryPipeline::spawn(Arc::new(metrics.clone()), 16);
    let engine = InvocationEngine::new(
        Arc::new(runtime.clone()),
        InvocationTransport::Stdio(StdioTransport::new()),
        sender,
    );
    let builder = BuildPipeline::new(Arc::new(runtime.clone()), TransportKind::Stdio);
    let state = AppState::new(FunctionService::new(registry, builder, engine));
    TestApp {
        app: create_app(state),
        runtime,
        metrics,
        telemetry,
    }
}

fn function_body(name: &str) -> Value {
    json!({
        "name": name,
        "memory": 128,
        "code": "exports.hello = (req, res) => res.send({ hello: req.query.name })",
        "package": "{\"name\":\"hello\",\"version\":\"1.0.0\"}"
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Body) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn register(app: &Router, name: &str) -> Response {
    send(app, "POST", "/function/", Body::from(function_body(name).to_string())).await
}

async fn json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn text_body(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let test = create_test_app();
    let response = send(&test.app, "GET", "/health", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["transport"], "stdio");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_register_then_get() {
    let test = create_test_app();

    let response = register(&test.app, "f1").await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["location"], "/function/f1");
    let json = json_body(response).await;
    assert_eq!(json["message"], "Function created at /function/f1");
    assert_eq!(json["function"]["name"], "f1");

    let response = send(&test.app, "GET", "/function/f1", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["name"], "f1");
    assert_eq!(json["memory"], 128);
    assert_eq!(json["image_tag"], "f1");
    assert!(test.runtime.images().await.contains("f1"));
}

#[tokio::test]
async fn test_duplicate_registration_conflicts_without_rebuild() {
    let test = create_test_app();

    assert_eq!(register(&test.app, "f1").await.status(), StatusCode::CREATED);
    let response = register(&test.app, "f1").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = json_body(response).await;
    assert_eq!(json["code"], "duplicate_function");
    assert_eq!(test.runtime.build_count(), 1);
}

#[tokio::test]
async fn test_concurrent_registrations_build_once() {
    let test = create_test_app();

    let (a, b) = tokio::join!(register(&test.app, "race"), register(&test.app, "race"));
    let mut statuses = vec![a.status().as_u16(), b.status().as_u16()];
    statuses.sort();
    assert_eq!(statuses, vec![201, 409]);
    assert_eq!(test.runtime.build_count(), 1);
}

#[tokio::test]
async fn test_malformed_registration_is_bad_request() {
    let test = create_test_app();

    for body in [
        "not json".to_string(),
        json!({ "name": "f1" }).to_string(),
        function_body("Bad Name").to_string(),
    ] {
        let response = send(&test.app, "POST", "/function/", Body::from(body.clone())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        let json = json_body(response).await;
        assert_eq!(json["code"], "invalid_request");
    }
    assert_eq!(test.runtime.build_count(), 0);
}

#[tokio::test]
async fn test_build_failure_records_nothing() {
    let test = create_test_app();
    test.runtime
        .update_behavior(|b| b.fail_build = Some("npm ERR! code E404".to_string()))
        .await;

    let response = register(&test.app, "broken").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = json_body(response).await;
    assert_eq!(json["code"], "build_failed");
    assert!(json["error"].as_str().unwrap().contains("E404"));

    let response = send(&test.app, "GET", "/function/broken", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_functions() {
    let test = create_test_app();
    for name in ["zeta", "alpha"] {
        assert_eq!(register(&test.app, name).await.status(), StatusCode::CREATED);
    }

    let response = send(&test.app, "GET", "/function/", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[tokio::test]
async fn test_delete_semantics() {
    let test = create_test_app();

    let response = send(&test.app, "DELETE", "/function/ghost", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert_eq!(register(&test.app, "f1").await.status(), StatusCode::CREATED);
    let response = send(&test.app, "DELETE", "/function/f1", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(test.runtime.images().await.is_empty());

    let response = send(&test.app, "GET", "/function/f1", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The name is free again.
    assert_eq!(register(&test.app, "f1").await.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_delete_keeps_record_when_image_removal_fails() {
    let test = create_test_app();
    assert_eq!(register(&test.app, "f1").await.status(), StatusCode::CREATED);
    test.runtime
        .update_behavior(|b| b.fail_remove_image = true)
        .await;

    let response = send(&test.app, "DELETE", "/function/f1", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = send(&test.app, "GET", "/function/f1", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(test.runtime.images().await.contains("f1"));
}

/// Registry whose deletes always fail.
struct UndeletableRegistry(InMemoryRegistry);

#[async_trait]
impl FunctionRegistry for UndeletableRegistry {
    async fn exists(&self, name: &str) -> faas_store::Result<bool> {
        self.0.exists(name).await
    }
    async fn insert(&self, function: &Function) -> faas_store::Result<bool> {
        self.0.insert(function).await
    }
    async fn delete(&self, _name: &str) -> faas_store::Result<bool> {
        Err(StoreError::Storage("registry is read-only".to_string()))
    }
    async fn get_by_name(&self, name: &str) -> faas_store::Result<Option<Function>> {
        self.0.get_by_name(name).await
    }
    async fn get_all(&self) -> faas_store::Result<Vec<Function>> {
        self.0.get_all().await
    }
}

#[tokio::test]
async fn test_failed_record_delete_keeps_function_callable() {
    let test = create_test_app_with(Arc::new(UndeletableRegistry(InMemoryRegistry::new())));
    assert_eq!(register(&test.app, "f1").await.status(), StatusCode::CREATED);

    let response = send(&test.app, "DELETE", "/function/f1", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = json_body(response).await;
    assert_eq!(json["code"], "registry");

    // The image was left alone, so the record still has something to run.
    assert!(test.runtime.images().await.contains("f1"));
    let response = send(&test.app, "GET", "/function/f1", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = send(&test.app, "GET", "/call/f1/hello", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_call_unknown_function() {
    let test = create_test_app();
    let response = send(&test.app, "GET", "/call/ghost/hello", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["code"], "function_not_found");
    assert!(test.runtime.created_specs().await.is_empty());
}

#[tokio::test]
async fn test_call_relays_function_result() {
    let test = create_test_app();
    assert_eq!(register(&test.app, "f1").await.status(), StatusCode::CREATED);
    test.runtime
        .set_behavior(FakeBehavior {
            logs: stdout_logs(&["warming up", r#"{"code":202,"body":{"hello":"world"}}"#]),
            ..Default::default()
        })
        .await;

    let response = send(
        &test.app,
        "POST",
        "/call/f1/hello/nested?name=world",
        Body::from(r#"{"x":1}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(json_body(response).await, json!({ "hello": "world" }));

    let spec = &test.runtime.created_specs().await[0];
    let cmd = spec.cmd.as_ref().unwrap();
    assert_eq!(cmd[2], "hello/nested");
    assert_eq!(cmd[3], r#"{"name":"world"}"#);
    assert_eq!(cmd[4], "POST");
    assert!(test.runtime.live_containers().await.is_empty());

    test.telemetry.flush().await.unwrap();
    let metrics = test.metrics.all().await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].function, "f1");
    assert_eq!(metrics[0].result_code, 202);
}

#[tokio::test]
async fn test_call_with_malformed_result_is_server_error() {
    let test = create_test_app();
    assert_eq!(register(&test.app, "f1").await.status(), StatusCode::CREATED);
    test.runtime
        .update_behavior(|b| b.logs = stdout_logs(&["ReferenceError: foo is not defined"]))
        .await;

    let response = send(&test.app, "GET", "/call/f1/hello", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = json_body(response).await;
    assert_eq!(json["code"], "malformed_result");
    assert!(test.runtime.live_containers().await.is_empty());
}

#[tokio::test]
async fn test_metrics_echo() {
    let test = create_test_app();

    let response = send(&test.app, "GET", "/metrics?window=5m", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text_body(response).await, "[GET] /metrics?window=5m");

    let response = send(&test.app, "POST", "/metrics", Body::empty()).await;
    assert_eq!(text_body(response).await, "[POST] /metrics");
}

/// Registry whose writes always fail.
struct ReadOnlyRegistry(InMemoryRegistry);

#[async_trait]
impl FunctionRegistry for ReadOnlyRegistry {
    async fn exists(&self, name: &str) -> faas_store::Result<bool> {
        self.0.exists(name).await
    }
    async fn insert(&self, _function: &Function) -> faas_store::Result<bool> {
        Err(StoreError::Storage("disk full".to_string()))
    }
    async fn delete(&self, _name: &str) -> faas_store::Result<bool> {
        Err(StoreError::Storage("disk full".to_string()))
    }
    async fn get_by_name(&self, name: &str) -> faas_store::Result<Option<Function>> {
        self.0.get_by_name(name).await
    }
    async fn get_all(&self) -> faas_store::Result<Vec<Function>> {
        self.0.get_all().await
    }
}

#[tokio::test]
async fn test_registry_failure_removes_built_image() {
    let test = create_test_app_with(Arc::new(ReadOnlyRegistry(InMemoryRegistry::new())));

    let response = register(&test.app, "f1").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = json_body(response).await;
    assert_eq!(json["code"], "registry");
    assert_eq!(test.runtime.build_count(), 1);
    assert!(test.runtime.images().await.is_empty());
}
