use faas_common::{FaasError, Result, TransportKind};
use faas_executor::transport::DEFAULT_GATEWAY_PORT;
use faas_executor::{FixedRetry, GatewayProxyTransport, InvocationTransport, StdioTransport};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LOG_FILTER: &str = "info,faas_executor=debug,faas_gateway_server=debug";

/// Control plane settings, read from `FAAS_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPlaneConfig {
    pub listen_addr: SocketAddr,
    pub transport: TransportKind,
    pub gateway_port: u16,
    pub connect_retry: FixedRetry,
    pub registry_path: PathBuf,
    pub metrics_path: PathBuf,
    pub telemetry_capacity: usize,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            transport: TransportKind::Stdio,
            gateway_port: DEFAULT_GATEWAY_PORT,
            connect_retry: FixedRetry::gateway_default(),
            registry_path: PathBuf::from("functions.json"),
            metrics_path: PathBuf::from("metrics.jsonl"),
            telemetry_capacity: 1024,
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or empty variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            listen_addr: parse_or(get("FAAS_LISTEN_ADDR"), "FAAS_LISTEN_ADDR", defaults.listen_addr)?,
            transport: parse_or(get("FAAS_TRANSPORT"), "FAAS_TRANSPORT", defaults.transport)?,
            gateway_port: parse_or(get("FAAS_GATEWAY_PORT"), "FAAS_GATEWAY_PORT", defaults.gateway_port)?,
            connect_retry: FixedRetry::new(
                parse_or(
                    get("FAAS_CONNECT_ATTEMPTS"),
                    "FAAS_CONNECT_ATTEMPTS",
                    defaults.connect_retry.max_attempts,
                )?,
                Duration::from_millis(parse_or(
                    get("FAAS_CONNECT_INTERVAL_MS"),
                    "FAAS_CONNECT_INTERVAL_MS",
                    defaults.connect_retry.interval.as_millis() as u64,
                )?),
            ),
            registry_path: get("FAAS_REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            metrics_path: get("FAAS_METRICS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.metrics_path),
            telemetry_capacity: parse_or(
                get("FAAS_TELEMETRY_CAPACITY"),
                "FAAS_TELEMETRY_CAPACITY",
                defaults.telemetry_capacity,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.connect_retry.max_attempts == 0 {
            return Err(FaasError::Config("FAAS_CONNECT_ATTEMPTS must be at least 1".into()));
        }
        if self.telemetry_capacity == 0 {
            return Err(FaasError::Config("FAAS_TELEMETRY_CAPACITY must be at least 1".into()));
        }
        if self.gateway_port == 0 {
            return Err(FaasError::Config("FAAS_GATEWAY_PORT must not be 0".into()));
        }
        Ok(())
    }

    pub fn build_transport(&self) -> Result<InvocationTransport> {
        Ok(match self.transport {
            TransportKind::Stdio => InvocationTransport::Stdio(StdioTransport::new()),
            TransportKind::Gateway => InvocationTransport::GatewayProxy(
                GatewayProxyTransport::new(self.gateway_port, self.connect_retry)?,
            ),
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| FaasError::Config(format!("{key}={value:?}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ControlPlaneConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ControlPlaneConfig::default());
        assert_eq!(config.listen_addr.port(), 8000);
        assert_eq!(config.connect_retry.max_attempts, 200);
        assert_eq!(config.connect_retry.interval, Duration::from_millis(10));
        assert!(matches!(
            config.build_transport().unwrap(),
            InvocationTransport::Stdio(_)
        ));
    }

    #[test]
    fn test_overrides() {
        let config = ControlPlaneConfig::from_lookup(lookup(&[
            ("FAAS_LISTEN_ADDR", "127.0.0.1:9000"),
            ("FAAS_TRANSPORT", "gateway"),
            ("FAAS_GATEWAY_PORT", "3000"),
            ("FAAS_CONNECT_ATTEMPTS", "50"),
            ("FAAS_CONNECT_INTERVAL_MS", "20"),
            ("FAAS_REGISTRY_PATH", "/var/lib/faas/functions.json"),
            ("FAAS_METRICS_PATH", " "),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.transport, TransportKind::Gateway);
        assert_eq!(config.connect_retry, FixedRetry::new(50, Duration::from_millis(20)));
        assert_eq!(config.registry_path, PathBuf::from("/var/lib/faas/functions.json"));
        assert_eq!(config.metrics_path, PathBuf::from("metrics.jsonl"));
        match config.build_transport().unwrap() {
            InvocationTransport::GatewayProxy(gateway) => assert_eq!(gateway.port(), 3000),
            other => panic!("expected gateway transport, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for vars in [
            [("FAAS_GATEWAY_PORT", "http")],
            [("FAAS_TRANSPORT", "carrier-pigeon")],
            [("FAAS_CONNECT_ATTEMPTS", "0")],
            [("FAAS_TELEMETRY_CAPACITY", "-1")],
        ] {
            let result = ControlPlaneConfig::from_lookup(lookup(&vars));
            assert!(matches!(result, Err(FaasError::Config(_))), "{vars:?}");
        }
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("FAAS_TRANSPORT", "gateway-proxy");
        std::env::set_var("FAAS_TELEMETRY_CAPACITY", "32");
        let config = ControlPlaneConfig::from_env();
        std::env::remove_var("FAAS_TRANSPORT");
        std::env::remove_var("FAAS_TELEMETRY_CAPACITY");

        let config = config.unwrap();
        assert_eq!(config.transport, TransportKind::Gateway);
        assert_eq!(config.telemetry_capacity, 32);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_address() {
        std::env::set_var("FAAS_LISTEN_ADDR", "not-an-address");
        let result = ControlPlaneConfig::from_env();
        std::env::remove_var("FAAS_LISTEN_ADDR");
        assert!(matches!(result, Err(FaasError::Config(_))));
    }
}
