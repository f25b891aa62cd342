use faas_common::{FaasError, Metric, Result};
use faas_store::MetricStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type FlushAck = oneshot::Sender<Result<()>>;

/// Cloneable producer side of the metric channel.
#[derive(Clone, Debug)]
pub struct MetricSender {
    tx: mpsc::Sender<Metric>,
}

impl MetricSender {
    /// Queues `metric`; waits only while the channel is full.
    pub async fn send(&self, metric: Metric) -> Result<()> {
        self.tx
            .send(metric)
            .await
            .map_err(|_| FaasError::Internal("telemetry pipeline closed".to_string()))
    }
}

/// Control side of the running consumer task.
pub struct TelemetryHandle {
    flush_tx: mpsc::Sender<FlushAck>,
    task: JoinHandle<()>,
}

impl TelemetryHandle {
    /// Persists every metric sent before this call.
    pub async fn flush(&self) -> Result<()> {
        let closed = || FaasError::Internal("telemetry pipeline closed".to_string());
        let (ack_tx, ack_rx) = oneshot::channel();
        self.flush_tx.send(ack_tx).await.map_err(|_| closed())?;
        ack_rx.await.map_err(|_| closed())?
    }

    /// Waits for the consumer to exit. It exits once every [`MetricSender`]
    /// has been dropped, after a final persist.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.flush_tx);
        self.task
            .await
            .map_err(|e| FaasError::Internal(format!("telemetry task failed: {e}")))
    }
}

/// Single consumer that appends metrics to a [`MetricStore`].
pub struct TelemetryPipeline;

impl TelemetryPipeline {
    pub fn spawn(store: Arc<dyn MetricStore>, capacity: usize) -> (MetricSender, TelemetryHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (flush_tx, flush_rx) = mpsc::channel(8);
        let task = tokio::spawn(consume(store, rx, flush_rx));
        (MetricSender { tx }, TelemetryHandle { flush_tx, task })
    }
}

async fn consume(
    store: Arc<dyn MetricStore>,
    mut metrics: mpsc::Receiver<Metric>,
    mut flushes: mpsc::Receiver<FlushAck>,
) {
    info!("Telemetry pipeline started");
    let mut flushes_open = true;

    loop {
        tokio::select! {
            biased;
            received = metrics.recv() => match received {
                Some(metric) => {
                    append(store.as_ref(), metric).await;
                    drain(store.as_ref(), &mut metrics).await;
                    if let Err(e) = store.persist().await {
                        error!(error = %e, "Failed to persist metrics");
                    }
                }
                None => break,
            },
            ack = flushes.recv(), if flushes_open => match ack {
                Some(ack) => {
                    drain(store.as_ref(), &mut metrics).await;
                    let result = store.persist().await.map_err(FaasError::from);
                    let _ = ack.send(result);
                }
                None => flushes_open = false,
            },
        }
    }

    if let Err(e) = store.persist().await {
        error!(error = %e, "Final metric persist failed");
    }
    info!("Telemetry pipeline stopped");
}

async fn drain(store: &dyn MetricStore, metrics: &mut mpsc::Receiver<Metric>) {
    while let Ok(metric) = metrics.try_recv() {
        append(store, metric).await;
    }
}

async fn append(store: &dyn MetricStore, metric: Metric) {
    debug!(%metric, "Recording metric");
    if let Err(e) = store.append(metric).await {
        error!(error = %e, "Failed to append metric");
    }
}
