//! In-memory [`RuntimeClient`] for tests that must not touch a real engine.

use crate::runtime::{ContainerSpec, ContainerStdin, RuntimeClient};
use crate::transport::stdio::encode_frame;
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

/// Knobs for the next calls made against a [`FakeRuntime`].
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub fail_build: Option<String>,
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_remove: bool,
    pub fail_remove_image: bool,
    /// The process is gone before stdin is written; writes fail.
    pub stdin_closed: bool,
    pub exit_code: i64,
    /// Raw multiplexed log output returned by `container_logs`.
    pub logs: Bytes,
    pub address: String,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            fail_build: None,
            fail_create: false,
            fail_start: false,
            fail_remove: false,
            fail_remove_image: false,
            stdin_closed: false,
            exit_code: 0,
            logs: stdout_logs(&[r#"{"code":200,"headers":{},"body":"ok"}"#]),
            address: "127.0.0.1".to_string(),
        }
    }
}

/// Frames `lines` as stdout output, one frame per line.
pub fn stdout_logs(lines: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    for line in lines {
        encode_frame(&mut buf, 1, format!("{line}\n").as_bytes());
    }
    buf.freeze()
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub started: bool,
    pub stopped: bool,
    pub stdin_attached: bool,
    /// Whether stdin was attached by the time the container was started.
    pub attached_before_start: bool,
    /// Everything written to stdin so far.
    pub stdin: Vec<u8>,
}

struct ContainerRecord {
    view: FakeContainer,
    stdin: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl ContainerRecord {
    fn snapshot(&self) -> FakeContainer {
        let mut view = self.view.clone();
        view.stdin = self
            .stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        view
    }
}

#[derive(Default)]
struct FakeState {
    images: BTreeMap<String, Bytes>,
    containers: BTreeMap<String, ContainerRecord>,
    created: Vec<ContainerSpec>,
}

/// Stdin writer that appends into the container record.
struct FakeStdin {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
    closed: bool,
}

impl AsyncWrite for FakeStdin {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "container is not reading stdin",
            )));
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Records every engine call and keeps images and containers in memory.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    behavior: Arc<Mutex<FakeBehavior>>,
    builds: Arc<AtomicUsize>,
    next_id: Arc<AtomicUsize>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            ..Self::default()
        }
    }

    pub async fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().await = behavior;
    }

    pub async fn update_behavior(&self, f: impl FnOnce(&mut FakeBehavior)) {
        f(&mut *self.behavior.lock().await);
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub async fn images(&self) -> BTreeSet<String> {
        self.state.lock().await.images.keys().cloned().collect()
    }

    /// Build context last submitted for `tag`.
    pub async fn build_context(&self, tag: &str) -> Option<Bytes> {
        self.state.lock().await.images.get(tag).cloned()
    }

    /// Containers that exist right now.
    pub async fn live_containers(&self) -> Vec<FakeContainer> {
        self.state
            .lock()
            .await
            .containers
            .values()
            .map(ContainerRecord::snapshot)
            .collect()
    }

    /// Every container spec ever created, oldest first.
    pub async fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().await.created.clone()
    }

    async fn behavior(&self) -> FakeBehavior {
        self.behavior.lock().await.clone()
    }

    async fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        let record = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {id}")))?;
        Ok(f(&mut record.view))
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn build_image(&self, tag: &str, context: Bytes) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.behavior().await.fail_build {
            return Err(RuntimeError::BuildFailed(message));
        }
        self.state
            .lock()
            .await
            .images
            .insert(tag.to_string(), context);
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        if self.behavior().await.fail_remove_image {
            return Err(RuntimeError::Internal("image removal refused".to_string()));
        }
        match self.state.lock().await.images.remove(tag) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(format!("no such image: {tag}"))),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if self.behavior().await.fail_create {
            return Err(RuntimeError::Internal("create refused".to_string()));
        }
        let mut state = self.state.lock().await;
        if !state.images.contains_key(&spec.image) {
            return Err(RuntimeError::NotFound(format!("no such image: {}", spec.image)));
        }
        let id = format!("fake-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            ContainerRecord {
                view: FakeContainer {
                    spec: spec.clone(),
                    started: false,
                    stopped: false,
                    stdin_attached: false,
                    attached_before_start: false,
                    stdin: Vec::new(),
                },
                stdin: Arc::default(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        if self.behavior().await.fail_start {
            return Err(RuntimeError::Internal("start refused".to_string()));
        }
        self.with_container(id, |c| {
            c.started = true;
            c.attached_before_start = c.stdin_attached;
        })
        .await
    }

    async fn attach_stdin(&self, id: &str) -> Result<ContainerStdin> {
        let closed = self.behavior().await.stdin_closed;
        let mut state = self.state.lock().await;
        let record = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {id}")))?;
        record.view.stdin_attached = true;
        Ok(Box::pin(FakeStdin {
            buffer: Arc::clone(&record.stdin),
            closed,
        }))
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        self.with_container(id, |c| c.stopped = true).await?;
        Ok(self.behavior().await.exit_code)
    }

    async fn container_logs(&self, id: &str) -> Result<Bytes> {
        self.with_container(id, |_| ()).await?;
        Ok(self.behavior().await.logs)
    }

    async fn container_address(&self, id: &str) -> Result<String> {
        self.with_container(id, |_| ()).await?;
        Ok(self.behavior().await.address)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.with_container(id, |c| c.stopped = true).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        if self.behavior().await.fail_remove {
            return Err(RuntimeError::Internal("remove refused".to_string()));
        }
        self.state
            .lock()
            .await
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {id}")))
    }
}
