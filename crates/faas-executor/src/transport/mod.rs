pub mod gateway;
pub mod stdio;

pub use gateway::{GatewayProxyTransport, DEFAULT_GATEWAY_PORT};
pub use stdio::StdioTransport;

use crate::invocation::Invocation;
use crate::runtime::{ContainerSpec, ContainerStdin, RuntimeClient};
use faas_common::{CallRequest, FaasError, Function, FunctionResponse, Result, TransportKind};

/// How a call reaches a function container.
#[derive(Debug, Clone)]
pub enum InvocationTransport {
    Stdio(StdioTransport),
    GatewayProxy(GatewayProxyTransport),
}

impl InvocationTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            InvocationTransport::Stdio(_) => TransportKind::Stdio,
            InvocationTransport::GatewayProxy(_) => TransportKind::Gateway,
        }
    }

    /// Container for one call of `function`.
    pub fn container_spec(
        &self,
        function: &Function,
        request: &CallRequest,
        invocation_id: &str,
    ) -> Result<ContainerSpec> {
        let cmd = match self {
            InvocationTransport::Stdio(stdio) => Some(stdio.command(request)?),
            InvocationTransport::GatewayProxy(_) => None,
        };
        Ok(ContainerSpec {
            name: format!("faas-{}-{}", function.name, invocation_id),
            image: function.image_tag.clone(),
            cmd,
            open_stdin: matches!(self, InvocationTransport::Stdio(_)),
            memory_limit_mb: (function.memory > 0).then_some(function.memory),
            labels: [
                ("faas.function".to_string(), function.name.clone()),
                ("faas.invocation".to_string(), invocation_id.to_string()),
            ]
            .into(),
        })
    }

    /// Listener containers keep running after the call and must be stopped.
    pub fn stops_container(&self) -> bool {
        matches!(self, InvocationTransport::GatewayProxy(_))
    }

    /// Runs between create and start. Stdio attaches stdin here so a
    /// process that exits straight away still has its output collected.
    pub(crate) async fn attach(
        &self,
        runtime: &dyn RuntimeClient,
        container_id: &str,
    ) -> Result<Option<ContainerStdin>> {
        match self {
            InvocationTransport::Stdio(_) => runtime
                .attach_stdin(container_id)
                .await
                .map(Some)
                .map_err(|e| FaasError::lifecycle("attach", e)),
            InvocationTransport::GatewayProxy(_) => Ok(None),
        }
    }

    pub(crate) async fn execute(
        &self,
        runtime: &dyn RuntimeClient,
        invocation: &mut Invocation,
        container_id: &str,
        request: &CallRequest,
        stdin: Option<ContainerStdin>,
    ) -> Result<FunctionResponse> {
        match self {
            InvocationTransport::Stdio(stdio) => {
                stdio
                    .execute(runtime, invocation, container_id, request, stdin)
                    .await
            }
            InvocationTransport::GatewayProxy(gateway) => {
                gateway
                    .execute(runtime, invocation, container_id, request)
                    .await
            }
        }
    }
}
