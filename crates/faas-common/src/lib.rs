// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

#[derive(Error, Debug)]
pub enum FaasError {
    #[error("Build failed for function {name}: {message}")]
    BuildFailed { name: String, message: String },

    #[error("Function already exists: {0}")]
    DuplicateFunction(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Container {phase} failed: {message}")]
    ContainerLifecycle { phase: String, message: String },

    #[error("Function listener unreachable after {attempts} attempts ({elapsed:?})")]
    ConnectTimeout { attempts: u32, elapsed: Duration },

    #[error("Malformed function result: {0}")]
    MalformedResult(String),

    #[error("Registry Error: {0}")]
    Registry(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl FaasError {
    pub fn lifecycle(phase: impl Into<String>, message: impl Display) -> Self {
        FaasError::ContainerLifecycle {
            phase: phase.into(),
            message: message.to_string(),
        }
    }

    /// HTTP status a caller sees for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            FaasError::DuplicateFunction(_) => 409,
            FaasError::FunctionNotFound(_) => 404,
            FaasError::InvalidRequest(_) => 400,
            _ => 500,
        }
    }
}

// Define the primary Result type for FaaS operations
pub type Result<T> = std::result::Result<T, FaasError>;

/// How call arguments reach a function container and how its result comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Arguments on the command line, result on the last line of stdout.
    Stdio,
    /// The request is proxied to an HTTP listener inside the container.
    Gateway,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Gateway => "gateway",
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = FaasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "gateway" | "gateway-proxy" => Ok(TransportKind::Gateway),
            other => Err(FaasError::Config(format!("unknown transport: {other}"))),
        }
    }
}

/// Registration payload, as posted to `/function/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    /// Memory budget in MiB, `0` leaves the engine default.
    pub memory: u32,
    pub code: String,
    pub package: String,
}

impl FunctionSpec {
    /// Function names double as image tags, so they must be valid references.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.is_empty() || name.len() > 128 {
            return Err(FaasError::InvalidRequest(format!(
                "function name must be 1-128 characters, got {}",
                name.len()
            )));
        }
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
        let valid_edges = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric());
        if !valid_chars || !valid_edges {
            return Err(FaasError::InvalidRequest(format!(
                "invalid function name {name:?}: use lowercase letters, digits, '-', '_' or '.'"
            )));
        }
        Ok(())
    }
}

/// A registered function. Written once, after its image was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub memory: u32,
    pub code: String,
    pub package: String,
    pub image_tag: String,
    pub created_at: DateTime<Utc>,
}

impl Function {
    pub fn new(spec: FunctionSpec, image_tag: String) -> Self {
        Self {
            name: spec.name,
            memory: spec.memory,
            code: spec.code,
            package: spec.package,
            image_tag,
            created_at: Utc::now(),
        }
    }
}

/// One inbound call against a function endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub function: String,
    pub endpoint: String,
    pub method: String,
    /// Multi-valued, in the shape HTTP headers arrive.
    pub headers: BTreeMap<String, Vec<String>>,
    pub query: BTreeMap<String, String>,
    /// Raw query string, forwarded untouched by the gateway transport.
    pub raw_query: Option<String>,
    pub body: Vec<u8>,
}

/// What a function produced for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Per-invocation timing and outcome record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub invocation_id: String,
    pub function: String,
    pub container_id: Option<String>,
    pub transport: TransportKind,
    #[serde(with = "duration_ms")]
    pub create_duration: Duration,
    #[serde(with = "duration_ms")]
    pub start_duration: Duration,
    #[serde(with = "duration_ms::option")]
    pub connect_duration: Option<Duration>,
    #[serde(with = "duration_ms")]
    pub run_duration: Duration,
    pub result_code: u16,
    #[serde(with = "duration_ms")]
    pub stop_duration: Duration,
    #[serde(with = "duration_ms")]
    pub delete_duration: Duration,
    /// False when a container was created but could not be removed.
    pub removed: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Metric(function: {}, container: {:?}, code: {}, create: {:?}, start: {:?}, run: {:?}, delete: {:?})",
            self.function,
            self.container_id,
            self.result_code,
            self.create_duration,
            self.start_duration,
            self.run_duration,
            self.delete_duration
        )
    }
}

/// Durations as fractional milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        if !millis.is_finite() || millis < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(from_millis_f64(millis))
    }

    pub(super) fn from_millis_f64(millis: f64) -> Duration {
        Duration::from_nanos((millis * 1_000_000.0).round() as u64)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let millis = Option::<f64>::deserialize(deserializer)?;
            match millis {
                Some(m) if m.is_finite() && m >= 0.0 => Ok(Some(super::from_millis_f64(m))),
                Some(_) => Err(serde::de::Error::custom(
                    "duration must be a non-negative number",
                )),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> FunctionSpec {
        FunctionSpec {
            name: name.to_string(),
            memory: 128,
            code: "module.exports = {}".to_string(),
            package: "{}".to_string(),
        }
    }

    #[test]
    fn test_function_name_validation() {
        assert!(spec("f1").validate().is_ok());
        assert!(spec("hello-world_v2.js").validate().is_ok());
        assert!(spec("").validate().is_err());
        assert!(spec("Upper").validate().is_err());
        assert!(spec("-leading").validate().is_err());
        assert!(spec("with/slash").validate().is_err());
        assert!(spec(&"a".repeat(129)).validate().is_err());
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(FaasError::DuplicateFunction("f".into()).status_code(), 409);
        assert_eq!(FaasError::FunctionNotFound("f".into()).status_code(), 404);
        assert_eq!(FaasError::InvalidRequest("bad".into()).status_code(), 400);
        assert_eq!(FaasError::lifecycle("create", "boom").status_code(), 500);
        assert_eq!(
            FaasError::BuildFailed {
                name: "f".into(),
                message: "npm".into()
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn test_transport_parsing() {
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!(" Gateway ".parse::<TransportKind>().unwrap(), TransportKind::Gateway);
        assert!(matches!(
            "grpc".parse::<TransportKind>(),
            Err(FaasError::Config(_))
        ));
    }

    #[test]
    fn test_metric_serialization() {
        let metric = Metric {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            function: "f1".to_string(),
            container_id: Some("abc".to_string()),
            transport: TransportKind::Gateway,
            create_duration: Duration::from_millis(12),
            start_duration: Duration::from_micros(1500),
            connect_duration: None,
            run_duration: Duration::from_millis(3),
            result_code: 200,
            stop_duration: Duration::ZERO,
            delete_duration: Duration::from_millis(4),
            removed: true,
            error: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&metric).unwrap();
        println!("{json}");
        assert_eq!(json["transport"], "gateway");
        assert_eq!(json["create_duration"], 12.0);
        assert_eq!(json["start_duration"], 1.5);
        assert!(json["connect_duration"].is_null());

        let back: Metric = serde_json::from_value(json).unwrap();
        assert_eq!(back.start_duration, Duration::from_micros(1500));
        assert_eq!(back.connect_duration, None);
    }
}
