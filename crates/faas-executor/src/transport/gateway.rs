use crate::invocation::{Invocation, InvocationState, Phase};
use crate::readiness::{AttemptError, FixedRetry, RetryError};
use crate::runtime::RuntimeClient;
use faas_common::{CallRequest, FaasError, FunctionResponse, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

/// Port the gateway runner listens on inside the container.
pub const DEFAULT_GATEWAY_PORT: u16 = 8080;

const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Forwards the original request to an HTTP listener inside the container.
#[derive(Debug, Clone)]
pub struct GatewayProxyTransport {
    client: reqwest::Client,
    port: u16,
    retry: FixedRetry,
    connect_timeout: Duration,
}

impl GatewayProxyTransport {
    pub fn new(port: u16, retry: FixedRetry) -> Result<Self> {
        // Per connect; the retry deadline bounds the loop as a whole.
        let connect_timeout = retry.interval.max(MIN_CONNECT_TIMEOUT);
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FaasError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            port,
            retry,
            connect_timeout,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn retry(&self) -> FixedRetry {
        self.retry
    }

    /// `http://<address>:<port>/<endpoint>?<query>`
    pub fn target_url(&self, address: &str, request: &CallRequest) -> String {
        let endpoint = request.endpoint.trim_start_matches('/');
        let mut url = format!("http://{address}:{}/{endpoint}", self.port);
        if let Some(query) = request.raw_query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    pub(crate) async fn execute(
        &self,
        runtime: &dyn RuntimeClient,
        invocation: &mut Invocation,
        container_id: &str,
        request: &CallRequest,
    ) -> Result<FunctionResponse> {
        invocation.transition(InvocationState::Running);

        let address = runtime
            .container_address(container_id)
            .await
            .map_err(|e| FaasError::lifecycle("inspect", e))?;
        let url = self.target_url(&address, request);
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FaasError::InvalidRequest(format!("bad method {}", request.method)))?;

        let connecting = Instant::now();
        let outcome = self
            .retry
            .run(|attempt| connect_listener(&address, self.port, self.connect_timeout, attempt))
            .await;
        invocation.record(Phase::Connect, connecting.elapsed());
        let attempts = match outcome {
            Ok(((), attempts)) => attempts,
            Err(RetryError::Exhausted {
                attempts, elapsed, ..
            }) => return Err(FaasError::ConnectTimeout { attempts, elapsed }),
            Err(RetryError::Aborted { error, .. }) => {
                return Err(FaasError::lifecycle("connect", error))
            }
        };
        info!(attempts, connect = ?connecting.elapsed(), "Function listener accepting connections");

        // One request once the listener is up; no retry after this point.
        let running = Instant::now();
        debug!(%url, %method, "Forwarding call to function listener");
        let response = self
            .client
            .request(method, &url)
            .headers(forward_headers(request))
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| FaasError::lifecycle("proxy", e))?;

        let status = response.status().as_u16();
        let response_headers = relay_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| FaasError::lifecycle("relay", e))?;
        invocation.record(Phase::Run, running.elapsed());

        Ok(FunctionResponse {
            status,
            headers: response_headers,
            body: body.to_vec(),
        })
    }
}

/// One TCP connect against the function listener.
async fn connect_listener(
    address: &str,
    port: u16,
    connect_timeout: Duration,
    attempt: u32,
) -> std::result::Result<(), AttemptError<io::Error>> {
    match timeout(connect_timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidInput => Err(AttemptError::Permanent(e)),
        Ok(Err(e)) => {
            debug!(attempt, error = %e, "Function listener not ready");
            Err(AttemptError::Transient(e))
        }
        Err(_) => Err(AttemptError::Transient(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect timed out after {connect_timeout:?}"),
        ))),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn forward_headers(request: &CallRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in &request.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}

fn relay_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
