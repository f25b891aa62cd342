use crate::runtime::{ContainerStdin, RuntimeClient};
use crate::telemetry::MetricSender;
use crate::transport::InvocationTransport;
use chrono::Utc;
use faas_common::{CallRequest, FaasError, Function, FunctionResponse, Metric, Result, TransportKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Where one invocation is in the container lifecycle.
///
/// `Failed` can follow any state; removal is still attempted afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// No container yet.
    Pending,
    Created,
    Started,
    Running,
    Exited,
    LogsCollected,
    Removed,
    Failed,
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvocationState::Pending => "pending",
            InvocationState::Created => "created",
            InvocationState::Started => "started",
            InvocationState::Running => "running",
            InvocationState::Exited => "exited",
            InvocationState::LogsCollected => "logs_collected",
            InvocationState::Removed => "removed",
            InvocationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Timed lifecycle phases reported in the invocation metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Create,
    Start,
    Connect,
    Run,
    Stop,
    Delete,
}

/// Bookkeeping for a single call: state history and phase timings.
#[derive(Debug)]
pub struct Invocation {
    id: String,
    function: String,
    transport: TransportKind,
    state: InvocationState,
    history: Vec<InvocationState>,
    phases: Vec<(Phase, Duration)>,
    container_id: Option<String>,
    removed: bool,
}

impl Invocation {
    pub(crate) fn new(function: &str, transport: TransportKind) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            function: function.to_string(),
            transport,
            state: InvocationState::Pending,
            history: vec![InvocationState::Pending],
            phases: Vec::new(),
            container_id: None,
            removed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn history(&self) -> &[InvocationState] {
        &self.history
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub(crate) fn transition(&mut self, next: InvocationState) {
        debug!(invocation_id = %self.id, from = %self.state, to = %next, "Invocation state change");
        self.state = next;
        self.history.push(next);
    }

    fn reached(&self, state: InvocationState) -> bool {
        self.history.contains(&state)
    }

    /// Adds `elapsed` to `phase`; a phase may be recorded in several steps.
    pub(crate) fn record(&mut self, phase: Phase, elapsed: Duration) {
        match self.phases.iter_mut().find(|(p, _)| *p == phase) {
            Some((_, total)) => *total += elapsed,
            None => self.phases.push((phase, elapsed)),
        }
    }

    pub fn duration(&self, phase: Phase) -> Option<Duration> {
        self.phases
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, d)| *d)
    }

    /// Phases in the order they were first recorded.
    pub fn phases(&self) -> &[(Phase, Duration)] {
        &self.phases
    }

    fn to_metric(&self, result_code: u16, error: Option<String>) -> Metric {
        let phase = |p| self.duration(p).unwrap_or_default();
        Metric {
            invocation_id: self.id.clone(),
            function: self.function.clone(),
            container_id: self.container_id.clone(),
            transport: self.transport,
            create_duration: phase(Phase::Create),
            start_duration: phase(Phase::Start),
            connect_duration: self.duration(Phase::Connect),
            run_duration: phase(Phase::Run),
            result_code,
            stop_duration: phase(Phase::Stop),
            delete_duration: phase(Phase::Delete),
            removed: self.removed || self.container_id.is_none(),
            error,
            timestamp: Utc::now(),
        }
    }
}

/// Runs function calls in throwaway containers.
///
/// Every call gets a fresh container from the function's image; the
/// container is removed again on every path that created it, and one
/// [`Metric`] is sent per call.
#[derive(Clone)]
pub struct InvocationEngine {
    runtime: Arc<dyn RuntimeClient>,
    transport: InvocationTransport,
    telemetry: MetricSender,
}

impl InvocationEngine {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        transport: InvocationTransport,
        telemetry: MetricSender,
    ) -> Self {
        Self {
            runtime,
            transport,
            telemetry,
        }
    }

    pub fn transport(&self) -> &InvocationTransport {
        &self.transport
    }

    /// Runs the call on its own task, so dropping the caller's future cannot
    /// abandon a container half way through its lifecycle.
    pub async fn invoke_detached(
        self: &Arc<Self>,
        function: Function,
        request: CallRequest,
    ) -> Result<FunctionResponse> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.invoke(&function, request).await })
            .await
            .map_err(|e| FaasError::Internal(format!("invocation task failed: {e}")))?
    }

    #[instrument(skip(self, function, request), fields(function = %function.name, endpoint = %request.endpoint))]
    pub async fn invoke(&self, function: &Function, request: CallRequest) -> Result<FunctionResponse> {
        let mut invocation = Invocation::new(&function.name, self.transport.kind());
        let outcome = self.drive(&mut invocation, function, &request).await;

        if let Err(e) = &outcome {
            warn!(invocation_id = %invocation.id, state = %invocation.state, error = %e, "Invocation failed");
            invocation.transition(InvocationState::Failed);
        }
        self.cleanup(&mut invocation).await;
        if outcome.is_ok() && invocation.removed {
            invocation.transition(InvocationState::Removed);
        }

        let metric = match &outcome {
            Ok(response) => invocation.to_metric(response.status, None),
            Err(e) => invocation.to_metric(e.status_code(), Some(e.to_string())),
        };
        info!(invocation_id = %invocation.id, code = metric.result_code, removed = metric.removed, "Invocation finished");
        if let Err(e) = self.telemetry.send(metric).await {
            warn!(invocation_id = %invocation.id, error = %e, "Metric not recorded");
        }

        outcome
    }

    async fn drive(
        &self,
        invocation: &mut Invocation,
        function: &Function,
        request: &CallRequest,
    ) -> Result<FunctionResponse> {
        let spec = self
            .transport
            .container_spec(function, request, invocation.id())?;

        let started = Instant::now();
        let created = self.runtime.create_container(&spec).await;
        invocation.record(Phase::Create, started.elapsed());
        let container_id = created.map_err(|e| FaasError::lifecycle("create", e))?;
        info!(%container_id, name = %spec.name, "Container created");
        invocation.container_id = Some(container_id.clone());
        invocation.transition(InvocationState::Created);

        let started = Instant::now();
        let started_container = self.attach_and_start(&container_id).await;
        invocation.record(Phase::Start, started.elapsed());
        let stdin = started_container?;
        invocation.transition(InvocationState::Started);

        self.transport
            .execute(self.runtime.as_ref(), invocation, &container_id, request, stdin)
            .await
    }

    async fn attach_and_start(&self, container_id: &str) -> Result<Option<ContainerStdin>> {
        let stdin = self
            .transport
            .attach(self.runtime.as_ref(), container_id)
            .await?;
        self.runtime
            .start_container(container_id)
            .await
            .map_err(|e| FaasError::lifecycle("start", e))?;
        Ok(stdin)
    }

    async fn cleanup(&self, invocation: &mut Invocation) {
        let Some(container_id) = invocation.container_id.clone() else {
            return;
        };

        if self.transport.stops_container() && invocation.reached(InvocationState::Started) {
            let started = Instant::now();
            if let Err(e) = self.runtime.stop_container(&container_id).await {
                warn!(%container_id, error = %e, "Failed to stop container");
            }
            invocation.record(Phase::Stop, started.elapsed());
        }

        let started = Instant::now();
        match self.runtime.remove_container(&container_id).await {
            Ok(()) => invocation.removed = true,
            Err(e) => {
                // Leaked containers show up as `removed: false` in telemetry.
                warn!(%container_id, error = %e, "Failed to remove container");
            }
        }
        invocation.record(Phase::Delete, started.elapsed());
    }
}
