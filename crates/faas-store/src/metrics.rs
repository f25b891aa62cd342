use crate::{Result, StoreError};
use async_trait::async_trait;
use faas_common::Metric;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Append-only store of invocation metrics.
///
/// `append` may buffer; `persist` makes everything appended so far durable.
/// Callers are expected to serialize writes through a single consumer.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn append(&self, metric: Metric) -> Result<()>;
    async fn persist(&self) -> Result<()>;
    async fn all(&self) -> Result<Vec<Metric>>;
}

#[derive(Default, Clone)]
pub struct InMemoryMetricStore {
    metrics: Arc<RwLock<Vec<Metric>>>,
}

impl InMemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.metrics.read().await.len()
    }
}

#[async_trait]
impl MetricStore for InMemoryMetricStore {
    async fn append(&self, metric: Metric) -> Result<()> {
        self.metrics.write().await.push(metric);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Metric>> {
        Ok(self.metrics.read().await.clone())
    }
}

/// Metrics appended to a JSON-lines file, one object per line.
///
/// Only metrics not yet persisted are held in memory; `all` reads the file
/// back.
pub struct JsonFileMetricStore {
    path: PathBuf,
    pending: Mutex<Vec<Metric>>,
}

impl JsonFileMetricStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::metadata(&path).await {
            Ok(meta) => debug!(path = %path.display(), bytes = meta.len(), "Opened metric store"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Metric store will be created on first persist")
            }
            Err(source) => return Err(io_error(&path, source)),
        }
        Ok(Self {
            path,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_persisted(&self) -> Result<Vec<Metric>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&self.path, source)),
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| StoreError::Corrupt {
                    path: self.path.display().to_string(),
                    source,
                })
            })
            .collect()
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl MetricStore for JsonFileMetricStore {
    async fn append(&self, metric: Metric) -> Result<()> {
        self.pending.lock().await.push(metric);
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::new();
        for metric in pending.iter() {
            serde_json::to_writer(&mut lines, metric)?;
            lines.push(b'\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&self.path, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        file.write_all(&lines)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        file.flush().await.map_err(|e| io_error(&self.path, e))?;

        debug!(path = %self.path.display(), count = pending.len(), "Metrics persisted");
        pending.clear();
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Metric>> {
        let pending = self.pending.lock().await;
        let mut metrics = self.read_persisted().await?;
        metrics.extend(pending.iter().cloned());
        Ok(metrics)
    }
}
