pub mod config;
pub mod service;
pub mod types;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use faas_common::{CallRequest, FaasError, FunctionResponse, FunctionSpec, TransportKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

pub use config::{ControlPlaneConfig, DEFAULT_LOG_FILTER};
pub use service::FunctionService;
use types::{ApiError, HealthResponse, RegisterResponse};

#[derive(Clone)]
pub struct AppState {
    pub functions: Arc<FunctionService>,
    pub transport: TransportKind,
}

impl AppState {
    pub fn new(functions: FunctionService) -> Self {
        let transport = functions.engine().transport().kind();
        Self {
            functions: Arc::new(functions),
            transport,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Function management
        .route("/function/", post(register_function).get(list_functions))
        .route("/function", post(register_function).get(list_functions))
        .route("/function/:name", get(get_function).delete(delete_function))
        // Invocation, any method
        .route("/call/:function", any(call_function))
        .route("/call/:function/*endpoint", any(call_function))
        // Diagnostics
        .route("/metrics", get(metrics_echo).post(metrics_echo))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn register_function(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // Parsed by hand so every malformed body is a 400.
    let spec: FunctionSpec = serde_json::from_slice(&body)
        .map_err(|e| FaasError::InvalidRequest(format!("invalid function body: {e}")))?;
    let function = state.functions.register(spec).await?;

    let location = format!("/function/{}", function.name);
    let response = RegisterResponse {
        message: format!("Function created at {location}"),
        function,
    };
    Ok((StatusCode::CREATED, [(LOCATION, location)], Json(response)))
}

async fn list_functions(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.functions.list().await?))
}

async fn get_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.functions.get(&name).await?))
}

async fn delete_function(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.functions.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn call_function(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    query: Option<Query<BTreeMap<String, String>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let function = params.get("function").cloned().unwrap_or_default();
    let endpoint = params
        .get("endpoint")
        .map(|e| e.trim_start_matches('/').to_string())
        .unwrap_or_default();
    debug!(%function, %endpoint, %method, "Call received");

    let request = CallRequest {
        function,
        endpoint,
        method: method.to_string(),
        headers: collect_headers(&headers),
        query: query.map(|Query(q)| q).unwrap_or_default(),
        raw_query: uri.query().map(str::to_string),
        body: body.to_vec(),
    };
    let response = state.functions.invoke(request).await?;
    Ok(into_http_response(response))
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            collected
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    collected
}

fn into_http_response(response: FunctionResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = Response::new(Body::from(response.body));
    *http.status_mut() = status;
    for (name, value) in response.headers {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().insert(name, value);
            }
            _ => debug!("Dropping invalid function response header"),
        }
    }
    http
}

/// Echoes `[METHOD] URI`.
async fn metrics_echo(method: Method, uri: Uri) -> String {
    format!("[{method}] {uri}")
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        transport: state.transport,
    })
}

#[cfg(test)]
mod tests;
