use crate::runtime::{ContainerSpec, ContainerStdin, RuntimeClient};
use crate::transport::stdio::encode_frame;
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const STDOUT: u8 = 1;
const STDERR: u8 = 2;

/// Splits build stream errors into ones the engine reported (`Ok`, with its
/// message) and failures reading the stream itself (`Err`).
fn engine_build_error(err: BollardError) -> std::result::Result<String, BollardError> {
    match err {
        BollardError::DockerResponseServerError { message, .. } => Ok(message),
        BollardError::DockerStreamError { error } => Ok(error),
        other => Err(other),
    }
}

/// [`RuntimeClient`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connects through `DOCKER_HOST` or the local socket.
    pub fn connect_with_local_defaults() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    #[instrument(skip(self, context), fields(context_len = context.len()))]
    async fn build_image(&self, tag: &str, context: Bytes) -> Result<()> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context));
        while let Some(item) = stream.next().await {
            let info = match item.map_err(engine_build_error) {
                Ok(info) => info,
                Err(Ok(message)) => return Err(RuntimeError::BuildFailed(message)),
                Err(Err(e)) => {
                    warn!(%tag, error = %e, "Build output stream interrupted");
                    break;
                }
            };
            if let Some(detail) = info.error_detail.and_then(|d| d.message) {
                return Err(RuntimeError::BuildFailed(detail));
            }
            if let Some(error) = info.error {
                return Err(RuntimeError::BuildFailed(error));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(%tag, "{line}");
                }
            }
        }

        // The stream is best effort; the tag existing is what counts.
        self.docker.inspect_image(tag).await.map_err(|e| {
            RuntimeError::BuildFailed(format!("image {tag} not found after build: {e}"))
        })?;
        info!(%tag, "Image built");
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_image(tag, Some(options), None).await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            memory: spec
                .memory_limit_mb
                .map(|mb| i64::from(mb) * 1024 * 1024),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            attach_stdin: Some(spec.open_stdin),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.open_stdin),
            tty: Some(false),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let created = self.docker.create_container(Some(options), config).await?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn attach_stdin(&self, id: &str) -> Result<ContainerStdin> {
        let options = AttachContainerOptions::<String> {
            stream: Some(true),
            stdin: Some(true),
            ..Default::default()
        };
        // stdout/stderr are read back through the logs endpoint
        let AttachContainerResults { input, .. } =
            self.docker.attach_container(id, Some(options)).await?;
        Ok(input)
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(body)) => Ok(body.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Internal(format!(
                "wait stream for {id} ended without a status"
            ))),
        }
    }

    async fn container_logs(&self, id: &str) -> Result<Bytes> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut frames = BytesMut::new();
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    encode_frame(&mut frames, STDOUT, &message)
                }
                LogOutput::StdErr { message } => encode_frame(&mut frames, STDERR, &message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(frames.freeze())
    }

    async fn container_address(&self, id: &str) -> Result<String> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let settings = details.network_settings.unwrap_or_default();

        let primary = settings.ip_address.filter(|ip| !ip.is_empty());
        let from_networks = || {
            settings
                .networks
                .unwrap_or_default()
                .into_values()
                .filter_map(|endpoint| endpoint.ip_address)
                .find(|ip| !ip.is_empty())
        };
        primary
            .or_else(from_networks)
            .ok_or_else(|| RuntimeError::NotFound(format!("no network address for {id}")))
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 2 }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}
