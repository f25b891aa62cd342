use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// Write half of an attached container stdin. Shutting it down closes stdin.
pub type ContainerStdin = Pin<Box<dyn AsyncWrite + Send>>;

/// Everything the control plane needs to create one function container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `None` keeps the image's default command.
    pub cmd: Option<Vec<String>>,
    /// Single-use stdin that closes after the first attach is done writing.
    pub open_stdin: bool,
    /// Memory limit in MiB, `None` for the engine default.
    pub memory_limit_mb: Option<u32>,
    pub labels: HashMap<String, String>,
}

/// The container engine operations the control plane relies on.
///
/// Implementations talk to a real engine ([`crate::DockerRuntime`]) or keep
/// everything in memory for tests (`FakeRuntime`, behind the `testing`
/// feature). Log output is returned in the engine's multiplexed frame format:
/// an 8-byte header `[stream, 0, 0, 0, len_be32]` before each chunk.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Builds `context` (a tar archive with a `Dockerfile` entry) as `tag`.
    async fn build_image(&self, tag: &str, context: Bytes) -> Result<()>;

    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Returns the engine-assigned container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Attaches to the container's stdin. Called before the container is
    /// started so no input is lost to a fast-exiting process.
    async fn attach_stdin(&self, id: &str) -> Result<ContainerStdin>;

    /// Blocks until the container is no longer running; returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    async fn container_logs(&self, id: &str) -> Result<Bytes>;

    /// IP address of the container on its network.
    async fn container_address(&self, id: &str) -> Result<String>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Forced removal.
    async fn remove_container(&self, id: &str) -> Result<()>;
}
