use crate::invocation::{Invocation, InvocationState, Phase};
use crate::runtime::{ContainerStdin, RuntimeClient};
use bytes::{BufMut, BytesMut};
use faas_common::{CallRequest, FaasError, FunctionResponse, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

const HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = u32::MAX as usize;
const STDOUT: u8 = 1;

/// Arguments on the command line, request body on stdin, result on the last
/// line of stdout.
#[derive(Debug, Clone, Default)]
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }

    /// `node server.js <endpoint> <query json> <method> <headers json>`
    pub fn command(&self, request: &CallRequest) -> Result<Vec<String>> {
        let query = serde_json::to_string(&request.query)
            .map_err(|e| FaasError::InvalidRequest(format!("query: {e}")))?;
        let headers = serde_json::to_string(&request.headers)
            .map_err(|e| FaasError::InvalidRequest(format!("headers: {e}")))?;
        Ok(vec![
            "node".to_string(),
            "server.js".to_string(),
            request.endpoint.clone(),
            query,
            request.method.clone(),
            headers,
        ])
    }

    pub(crate) async fn execute(
        &self,
        runtime: &dyn RuntimeClient,
        invocation: &mut Invocation,
        container_id: &str,
        request: &CallRequest,
        stdin: Option<ContainerStdin>,
    ) -> Result<FunctionResponse> {
        invocation.transition(InvocationState::Running);

        let started = Instant::now();
        if let Some(mut stdin) = stdin {
            // A process that died early surfaces through its exit code and logs.
            if let Err(e) = deliver_body(&mut stdin, &request.body).await {
                warn!(%container_id, error = %e, "Failed to write request body to stdin");
            }
        }
        invocation.record(Phase::Run, started.elapsed());

        let started = Instant::now();
        let exit_code = runtime
            .wait_container(container_id)
            .await
            .map_err(|e| FaasError::lifecycle("wait", e))?;
        invocation.record(Phase::Stop, started.elapsed());
        invocation.transition(InvocationState::Exited);
        debug!(%container_id, exit_code, "Function process exited");

        let started = Instant::now();
        let logs = runtime
            .container_logs(container_id)
            .await
            .map_err(|e| FaasError::lifecycle("logs", e))?;
        invocation.transition(InvocationState::LogsCollected);

        let result = extract_response(&logs, exit_code);
        invocation.record(Phase::Run, started.elapsed());
        result
    }
}

async fn deliver_body(stdin: &mut ContainerStdin, body: &[u8]) -> std::io::Result<()> {
    stdin.write_all(body).await?;
    stdin.shutdown().await
}

/// Turns raw container output into the function's response.
///
/// A non-zero exit still yields a response when the last line parses.
pub fn extract_response(raw: &[u8], exit_code: i64) -> Result<FunctionResponse> {
    let stdout = demultiplex(raw);
    let Some(line) = last_line(&stdout) else {
        return Err(FaasError::MalformedResult(format!(
            "no output from function (exit code {exit_code})"
        )));
    };
    match parse_payload(line) {
        Ok(response) => {
            if exit_code != 0 {
                warn!(exit_code, "Function exited non-zero but produced a result");
            }
            Ok(response)
        }
        Err(FaasError::MalformedResult(reason)) if exit_code != 0 => Err(
            FaasError::MalformedResult(format!("{reason} (exit code {exit_code})")),
        ),
        Err(e) => Err(e),
    }
}

/// Appends `payload` as multiplexed frames: `[stream, 0, 0, 0, len_be32]`
/// then the bytes. Payloads over `u32::MAX` bytes span several frames.
pub fn encode_frame(buf: &mut BytesMut, stream: u8, payload: &[u8]) {
    encode_frames(buf, stream, payload, MAX_FRAME_LEN);
}

fn encode_frames(buf: &mut BytesMut, stream: u8, payload: &[u8], max_len: usize) {
    if payload.is_empty() {
        put_frame(buf, stream, 0, payload);
        return;
    }
    // Chunks are capped at u32::MAX bytes, so each length fits the header.
    for chunk in payload.chunks(max_len.min(MAX_FRAME_LEN)) {
        put_frame(buf, stream, chunk.len() as u32, chunk);
    }
}

fn put_frame(buf: &mut BytesMut, stream: u8, len: u32, chunk: &[u8]) {
    buf.reserve(HEADER_LEN + chunk.len());
    buf.put_u8(stream);
    buf.put_slice(&[0, 0, 0]);
    buf.put_u32(len);
    buf.put_slice(chunk);
}

/// Keeps the stdout chunks of a multiplexed log stream.
///
/// Output that does not start with a frame header (a TTY container) is
/// returned unchanged. A truncated last frame keeps whatever bytes arrived.
pub fn demultiplex(raw: &[u8]) -> Vec<u8> {
    if !looks_framed(raw) {
        return raw.to_vec();
    }

    let mut stdout = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while rest.len() >= HEADER_LEN {
        let stream = rest[0];
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (HEADER_LEN + len).min(rest.len());
        if stream == STDOUT {
            stdout.extend_from_slice(&rest[HEADER_LEN..end]);
        }
        rest = &rest[end..];
    }
    stdout
}

fn looks_framed(raw: &[u8]) -> bool {
    raw.len() >= HEADER_LEN && raw[0] <= 2 && raw[1..4] == [0, 0, 0]
}

/// Last non-empty line, without its line terminator.
pub fn last_line(output: &[u8]) -> Option<&[u8]> {
    output
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .last()
}

/// Parses `{"code": <int>, "body": <any>, "headers": {..}}`.
pub fn parse_payload(line: &[u8]) -> Result<FunctionResponse> {
    let payload: Value = serde_json::from_slice(line)
        .map_err(|e| FaasError::MalformedResult(format!("result is not JSON: {e}")))?;
    let Value::Object(mut fields) = payload else {
        return Err(FaasError::MalformedResult(
            "result is not a JSON object".to_string(),
        ));
    };

    let status = fields
        .get("code")
        .and_then(Value::as_u64)
        .ok_or_else(|| FaasError::MalformedResult("missing integer `code`".to_string()))?;
    let status = u16::try_from(status)
        .ok()
        .filter(|code| (100..=599).contains(code))
        .ok_or_else(|| FaasError::MalformedResult(format!("status {status} out of range")))?;

    let mut headers = BTreeMap::new();
    if let Some(Value::Object(raw)) = fields.remove("headers") {
        for (name, value) in raw {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            headers.insert(name.to_ascii_lowercase(), value);
        }
    }
    headers.insert("content-type".to_string(), "application/json".to_string());

    let body = fields.remove("body").unwrap_or(Value::Null);
    let body = serde_json::to_vec(&body)
        .map_err(|e| FaasError::MalformedResult(format!("body: {e}")))?;

    Ok(FunctionResponse {
        status,
        headers,
        body,
    })
}
