use bollard::errors::Error as BollardError;
use faas_common::FaasError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the gateway server)
pub use bollard;
pub use faas_common as common;

mod docker;
pub mod image_builder;
pub mod invocation;
pub mod readiness;
pub mod runtime;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use docker::DockerRuntime;
pub use image_builder::{BuildContext, BuildPipeline};
pub use invocation::{InvocationEngine, InvocationState, Phase};
pub use readiness::{AttemptError, FixedRetry, RetryError};
pub use runtime::{ContainerSpec, ContainerStdin, RuntimeClient};
pub use telemetry::{MetricSender, TelemetryHandle, TelemetryPipeline};
pub use transport::{GatewayProxyTransport, InvocationTransport, StdioTransport};

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Image build failed: {0}")]
    BuildFailed(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[source] BollardError),
    #[error("Internal runtime error: {0}")]
    Internal(String),
}

impl From<BollardError> for RuntimeError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::DockerApi(other),
        }
    }
}

// Errors that escape without a lifecycle phase attached.
impl From<RuntimeError> for FaasError {
    fn from(err: RuntimeError) -> Self {
        FaasError::lifecycle("runtime", err)
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
