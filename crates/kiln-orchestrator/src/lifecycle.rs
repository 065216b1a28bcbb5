//! ---
//! kiln_section: "04-orchestration"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Per-service build, start, wait and stop state machine."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
//! Service process lifecycle.
//!
//! `Pending → Building → Built → Starting → Running → {Stopping → Stopped | Errored | Done}`.
//! Every transition is published as an [`UpdateEvent`]. Failures of one
//! service never propagate to another; they are reported through events.
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kiln_engine::{BuildRequest, ContainerEngine, ContainerHandle, ContainerSpec, EngineError};
use kiln_rt::LogWriter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::buffer::{LineBuffer, FAILURE_TAIL_LINES};
use crate::env::{free_port, service_environment};
use crate::run::RunSettings;
use crate::service::{image_tag, BuildDescriptor, ServiceError, ServiceSpec};

/// Grace period for forwarding output that is still in flight after exit.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Lifecycle state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    /// Declared, nothing done yet.
    Pending,
    /// Image build in progress.
    Building,
    /// Image available.
    Built,
    /// Container being created and started.
    Starting,
    /// Container running.
    Running,
    /// Stop requested, waiting for the engine.
    Stopping,
    /// Stopped on request.
    Stopped,
    /// Failed to build, start or stop, or exited non-zero.
    Errored,
    /// Exited with code zero.
    Done,
}

impl ServiceStatus {
    /// Label used in update lines.
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Pending => "Pending",
            ServiceStatus::Building => "Building",
            ServiceStatus::Built => "Built",
            ServiceStatus::Starting => "Starting",
            ServiceStatus::Running => "Running",
            ServiceStatus::Stopping => "Stopping",
            ServiceStatus::Stopped => "Stopped",
            ServiceStatus::Errored => "Errored",
            ServiceStatus::Done => "Done",
        }
    }

    /// No further transitions happen from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ServiceStatus::Stopped | ServiceStatus::Errored | ServiceStatus::Done
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status notification for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    /// Service the event belongs to.
    pub service_name: String,
    /// Status after the transition, or `Running` for forwarded output.
    pub status: ServiceStatus,
    /// Human readable detail or one chunk of output.
    pub message: String,
    /// Error description for failure transitions.
    pub error: Option<String>,
}

impl fmt::Display for UpdateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.service_name, self.status, self.message)
    }
}

/// Errors returned by lifecycle operations. Failures are also published as
/// [`UpdateEvent`]s.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The operation is not allowed from the current state.
    #[error("service '{service}' cannot {operation} while {status}")]
    InvalidState {
        /// Service name.
        service: String,
        /// Attempted operation.
        operation: &'static str,
        /// State at the time of the call.
        status: ServiceStatus,
    },
    /// A stop was requested before the service started.
    #[error("service '{0}' was stopped before it started")]
    StopRequested(String),
    /// The container engine reported an error.
    #[error("service '{service}': {source}")]
    Engine {
        /// Service name.
        service: String,
        /// Engine error.
        source: EngineError,
    },
    /// The service definition could not be turned into a build.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// No local port could be reserved.
    #[error("service '{service}': no free port available: {source}")]
    Port {
        /// Service name.
        service: String,
        /// Underlying io error.
        source: io::Error,
    },
    /// The shared development network could not be prepared.
    #[error("network '{network}' unavailable: {source}")]
    Network {
        /// Network name.
        network: String,
        /// Engine error.
        source: EngineError,
    },
}

#[derive(Debug)]
struct ProcessState {
    status: ServiceStatus,
    handle: Option<ContainerHandle>,
    port: Option<u16>,
    stop_requested: bool,
}

/// One service moving through build, start, run and stop.
pub struct ServiceProcess {
    spec: ServiceSpec,
    project: String,
    network: Option<String>,
    stop_timeout: Duration,
    engine: Arc<dyn ContainerEngine>,
    updates: mpsc::Sender<UpdateEvent>,
    state: Mutex<ProcessState>,
    stop_tx: watch::Sender<bool>,
    recent: Mutex<LineBuffer>,
}

impl fmt::Debug for ServiceProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProcess")
            .field("name", &self.spec.name)
            .field("status", &self.status())
            .field("engine", &self.engine.name())
            .finish()
    }
}

impl ServiceProcess {
    /// Create a process in the `Pending` state.
    pub fn new(
        spec: ServiceSpec,
        engine: Arc<dyn ContainerEngine>,
        updates: mpsc::Sender<UpdateEvent>,
        settings: &RunSettings,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            spec,
            project: settings.project.clone(),
            network: settings.network.clone(),
            stop_timeout: settings.stop_timeout,
            engine,
            updates,
            state: Mutex::new(ProcessState {
                status: ServiceStatus::Pending,
                handle: None,
                port: None,
                stop_requested: false,
            }),
            stop_tx,
            recent: Mutex::new(LineBuffer::new(FAILURE_TAIL_LINES)),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Static definition.
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Tag of the service image, also used as the container name.
    pub fn image_tag(&self) -> String {
        image_tag(&self.project, &self.spec.name)
    }

    /// Current status.
    pub fn status(&self) -> ServiceStatus {
        self.state.lock().status
    }

    /// Port assigned on start.
    pub fn port(&self) -> Option<u16> {
        self.state.lock().port
    }

    /// Handle of the running container, if any.
    pub fn container(&self) -> Option<ContainerHandle> {
        self.state.lock().handle.clone()
    }

    /// Build the service image. `ignore` lists paths excluded from the build
    /// context in addition to the runtime defaults.
    pub async fn build(&self, ignore: &[String], logs: &LogWriter) -> Result<(), LifecycleError> {
        self.begin(&[ServiceStatus::Pending, ServiceStatus::Built], ServiceStatus::Building, "build")?;
        self.emit(ServiceStatus::Building, "building image", None).await;

        match self.build_image(ignore, logs).await {
            Ok(()) => {
                if self.settle(ServiceStatus::Building, ServiceStatus::Built, false) {
                    self.emit(
                        ServiceStatus::Built,
                        format!("image {} built", self.image_tag()),
                        None,
                    )
                    .await;
                }
                Ok(())
            }
            Err(err) => {
                if self.settle(ServiceStatus::Building, ServiceStatus::Errored, false) {
                    self.emit(ServiceStatus::Errored, "build failed", Some(err.to_string()))
                        .await;
                }
                Err(err)
            }
        }
    }

    async fn build_image(&self, ignore: &[String], logs: &LogWriter) -> Result<(), LifecycleError> {
        let mut patterns: Vec<String> = ignore.to_vec();
        patterns.extend(
            self.spec
                .runtime
                .default_ignores()
                .iter()
                .map(|pattern| (*pattern).to_owned()),
        );

        let descriptor = BuildDescriptor::write(&self.spec, &patterns).await?;
        let request = BuildRequest {
            dockerfile: descriptor.path().to_path_buf(),
            context_dir: self.spec.context_dir.clone(),
            tag: self.image_tag(),
            build_args: self.spec.runtime.build_args(&self.spec.handler),
            ignore: patterns,
        };
        let result = self.engine.build(&request, logs).await;
        drop(descriptor);
        result.map_err(|source| self.engine_error(source))
    }

    /// Create and start the container. On failure the service is `Errored`.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.begin(&[ServiceStatus::Pending, ServiceStatus::Built], ServiceStatus::Starting, "start")?;
        self.emit(ServiceStatus::Starting, "starting container", None).await;

        let handle = match self.launch().await {
            Ok(handle) => handle,
            Err(err) => {
                if self.settle(ServiceStatus::Starting, ServiceStatus::Errored, true) {
                    self.emit(ServiceStatus::Errored, "failed to start", Some(err.to_string()))
                        .await;
                } else if self.settle(ServiceStatus::Stopping, ServiceStatus::Stopped, true) {
                    self.emit(ServiceStatus::Stopped, "stopped", None).await;
                }
                return Err(err);
            }
        };

        let (started, port) = {
            let mut state = self.state.lock();
            if state.status == ServiceStatus::Starting {
                state.status = ServiceStatus::Running;
                state.handle = Some(handle.clone());
                (true, state.port)
            } else {
                (false, state.port)
            }
        };
        if !started {
            // Stopped while the container was being created; the pending
            // stop settles here once the container is gone.
            self.discard(&handle).await;
            if self.settle(ServiceStatus::Stopping, ServiceStatus::Stopped, true) {
                self.emit(ServiceStatus::Stopped, "stopped", None).await;
            }
            return Ok(());
        }

        info!(service = %self.spec.name, container = %handle, port = ?port, "service running");
        let message = match port {
            Some(port) => format!("running on port {port}"),
            None => "running".to_owned(),
        };
        self.emit(ServiceStatus::Running, message, None).await;
        Ok(())
    }

    async fn launch(&self) -> Result<ContainerHandle, LifecycleError> {
        let port = free_port().map_err(|source| LifecycleError::Port {
            service: self.spec.name.clone(),
            source,
        })?;
        self.state.lock().port = Some(port);

        let spec = ContainerSpec {
            name: self.image_tag(),
            image: self.image_tag(),
            env: service_environment(std::env::vars(), &self.project, &self.spec, port),
            port: Some(port),
            network: self.network.clone(),
            labels: BTreeMap::from([
                ("kiln.project".to_owned(), self.project.clone()),
                ("kiln.service".to_owned(), self.spec.name.clone()),
            ]),
        };
        let handle = self
            .engine
            .create(&spec)
            .await
            .map_err(|source| self.engine_error(source))?;
        if let Err(source) = self.engine.start(&handle).await {
            self.remove(&handle).await;
            return Err(self.engine_error(source));
        }
        Ok(handle)
    }

    /// Forward output and wait for the container to exit or for a stop
    /// request. Returns the resulting status.
    pub async fn wait(&self) -> Result<ServiceStatus, LifecycleError> {
        let Some(handle) = self.container() else {
            return Ok(self.status());
        };

        let forward = self.forward_output(&handle);
        let exit = self.engine.wait(&handle);
        let stopped = until_stopped(self.stop_tx.subscribe());
        tokio::pin!(forward, exit, stopped);

        let mut forwarding = true;
        let outcome = loop {
            tokio::select! {
                code = &mut exit => break Some(code),
                _ = &mut forward, if forwarding => forwarding = false,
                _ = &mut stopped => break None,
            }
        };

        let code = match outcome {
            None => return Ok(self.status()),
            Some(Err(source)) => {
                if self.stop_requested() {
                    return Ok(self.status());
                }
                let err = self.engine_error(source);
                if self.settle(ServiceStatus::Running, ServiceStatus::Errored, true) {
                    self.emit(ServiceStatus::Errored, "lost track of container", Some(err.to_string()))
                        .await;
                }
                return Err(err);
            }
            Some(Ok(code)) => code,
        };

        if forwarding {
            let _ = tokio::time::timeout(OUTPUT_DRAIN, &mut forward).await;
        }
        if self.stop_requested() {
            return Ok(self.status());
        }
        Ok(self.finish(&handle, code).await)
    }

    async fn finish(&self, handle: &ContainerHandle, code: i64) -> ServiceStatus {
        if code == 0 {
            if self.settle(ServiceStatus::Running, ServiceStatus::Done, true) {
                self.emit(ServiceStatus::Done, "exited with code 0", None).await;
            }
            self.remove(handle).await;
            return self.status();
        }

        let tail = match self.engine.logs(handle, FAILURE_TAIL_LINES).await {
            Ok(bytes) => {
                let mut buffer = LineBuffer::new(FAILURE_TAIL_LINES);
                buffer.push(&bytes);
                buffer.joined()
            }
            Err(err) => {
                warn!(service = %self.spec.name, error = %err, "unable to fetch container logs; using captured output");
                self.recent.lock().joined()
            }
        };
        let message = if tail.is_empty() {
            format!("exited with code {code}")
        } else {
            format!("exited with code {code}:\n{tail}")
        };
        warn!(service = %self.spec.name, code, "service exited with failure");
        if self.settle(ServiceStatus::Running, ServiceStatus::Errored, true) {
            self.emit(ServiceStatus::Errored, message, Some(format!("exit code {code}")))
                .await;
        }
        self.remove(handle).await;
        self.status()
    }

    /// Forward container output as `Running` updates until the stream ends.
    /// [`wait`](Self::wait) already does this concurrently with waiting.
    pub async fn attach(&self) {
        if let Some(handle) = self.container() {
            self.forward_output(&handle).await;
        }
    }

    async fn forward_output(&self, handle: &ContainerHandle) {
        let mut output = match self.engine.attach(handle).await {
            Ok(output) => output,
            Err(err) => {
                warn!(service = %self.spec.name, error = %err, "unable to attach to container output");
                return;
            }
        };
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bytes) => {
                    self.recent.lock().push(&bytes);
                    let text = String::from_utf8_lossy(&bytes);
                    let text = text.trim_end();
                    if !text.is_empty() {
                        self.emit(ServiceStatus::Running, text.to_owned(), None).await;
                    }
                }
                Err(err) => {
                    warn!(service = %self.spec.name, error = %err, "container output stream failed");
                    break;
                }
            }
        }
        debug!(service = %self.spec.name, "container output closed");
    }

    /// Stop the service. Idempotent: only the first call on a starting or
    /// running service does anything, and at most one `Stopped` event is sent.
    /// A service stopped while starting reaches `Stopped` once
    /// [`start`](Self::start) has discarded its container.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let handle = {
            let mut state = self.state.lock();
            state.stop_requested = true;
            match state.status {
                ServiceStatus::Starting | ServiceStatus::Running => {
                    state.status = ServiceStatus::Stopping;
                    state.handle.clone()
                }
                _ => return Ok(()),
            }
        };
        self.stop_tx.send_replace(true);
        self.emit(ServiceStatus::Stopping, "stopping", None).await;

        // No handle yet: the container is still being created.
        let Some(handle) = handle else {
            return Ok(());
        };
        if let Err(source) = self.engine.stop(&handle, Some(self.stop_timeout)).await {
            let err = self.engine_error(source);
            if self.settle(ServiceStatus::Stopping, ServiceStatus::Errored, true) {
                self.emit(ServiceStatus::Errored, "failed to stop", Some(err.to_string()))
                    .await;
            }
            return Err(err);
        }

        if self.settle(ServiceStatus::Stopping, ServiceStatus::Stopped, true) {
            self.emit(ServiceStatus::Stopped, "stopped", None).await;
        }
        self.remove(&handle).await;
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        self.state.lock().stop_requested
    }

    /// Move to `to` if the current state is one of `from`.
    fn begin(
        &self,
        from: &[ServiceStatus],
        to: ServiceStatus,
        operation: &'static str,
    ) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if state.stop_requested {
            return Err(LifecycleError::StopRequested(self.spec.name.clone()));
        }
        if !from.contains(&state.status) {
            return Err(LifecycleError::InvalidState {
                service: self.spec.name.clone(),
                operation,
                status: state.status,
            });
        }
        state.status = to;
        Ok(())
    }

    /// Move from exactly `from` to `to`, optionally releasing the container
    /// handle. Returns false when another transition got there first.
    fn settle(&self, from: ServiceStatus, to: ServiceStatus, release: bool) -> bool {
        let mut state = self.state.lock();
        if state.status != from {
            return false;
        }
        state.status = to;
        if release {
            state.handle = None;
        }
        true
    }

    async fn discard(&self, handle: &ContainerHandle) {
        if let Err(err) = self.engine.stop(handle, Some(self.stop_timeout)).await {
            warn!(service = %self.spec.name, error = %err, "failed to stop discarded container");
        }
        self.remove(handle).await;
    }

    async fn remove(&self, handle: &ContainerHandle) {
        if let Err(err) = self.engine.remove(handle).await {
            warn!(service = %self.spec.name, container = %handle, error = %err, "failed to remove container");
        }
    }

    fn engine_error(&self, source: EngineError) -> LifecycleError {
        LifecycleError::Engine {
            service: self.spec.name.clone(),
            source,
        }
    }

    async fn emit(&self, status: ServiceStatus, message: impl Into<String>, error: Option<String>) {
        let event = UpdateEvent {
            service_name: self.spec.name.clone(),
            status,
            message: message.into(),
            error,
        };
        debug!(service = %event.service_name, status = ?status, "service update");
        if self.updates.send(event).await.is_err() {
            debug!(service = %self.spec.name, "update receiver dropped");
        }
    }
}

async fn until_stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_engine::{BuildScript, ContainerScript, InMemoryEngine};
    use tokio::time::timeout;

    fn settings() -> RunSettings {
        RunSettings {
            network: None,
            ..RunSettings::new("shop")
        }
    }

    fn process(
        engine: &InMemoryEngine,
        name: &str,
        context: &std::path::Path,
    ) -> (Arc<ServiceProcess>, mpsc::Receiver<UpdateEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let spec = ServiceSpec::new(name, format!("{name}.ts"), context).expect("spec");
        let engine: Arc<dyn ContainerEngine> = Arc::new(engine.clone());
        (Arc::new(ServiceProcess::new(spec, engine, tx, &settings())), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<UpdateEvent>) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn build_writes_descriptor_and_removes_it_afterwards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        let (service, mut rx) = process(&engine, "orders", dir.path());

        service
            .build(&["billing.ts".to_owned()], &LogWriter::discard())
            .await
            .expect("build");

        let builds = engine.builds();
        assert_eq!(builds.len(), 1);
        assert!(builds[0].dockerfile_present, "descriptor exists during the build");
        assert_eq!(builds[0].request.tag, "shop-orders");
        assert!(builds[0].request.ignore.contains(&"billing.ts".to_owned()));
        assert!(builds[0].request.ignore.contains(&"node_modules/".to_owned()));
        assert!(!dir.path().join("orders.kiln.dynamic.dockerfile").exists());

        let statuses: Vec<ServiceStatus> = drain(&mut rx).into_iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![ServiceStatus::Building, ServiceStatus::Built]);
        assert_eq!(service.status(), ServiceStatus::Built);
    }

    #[tokio::test]
    async fn failed_build_removes_descriptor_and_reports_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        engine.script_build("shop-orders", BuildScript::failing("npm ci exited 1"));
        let (service, mut rx) = process(&engine, "orders", dir.path());

        let err = service
            .build(&[], &LogWriter::discard())
            .await
            .expect_err("scripted failure");
        assert!(err.to_string().contains("npm ci exited 1"));
        assert!(!dir.path().join("orders.kiln.dynamic.dockerfile").exists());

        let events = drain(&mut rx);
        let last = events.last().expect("events");
        assert_eq!(last.status, ServiceStatus::Errored);
        assert!(last.error.as_deref().unwrap_or_default().contains("npm ci exited 1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        let (service, mut rx) = process(&engine, "orders", dir.path());

        service.start().await.expect("start");
        assert_eq!(service.status(), ServiceStatus::Running);
        assert!(service.port().is_some());

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move { service.wait().await })
        };
        let (first, second) = tokio::join!(service.stop(), service.stop());
        first.expect("first stop");
        second.expect("second stop");
        service.stop().await.expect("third stop");

        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait returns after stop")
            .expect("join")
            .expect("wait");
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert_eq!(engine.stop_calls().len(), 1);
        assert!(service.container().is_none());

        let stopped = drain(&mut rx)
            .into_iter()
            .filter(|e| e.status == ServiceStatus::Stopped)
            .count();
        assert_eq!(stopped, 1);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_log_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        let lines: Vec<String> = (1..=25).map(|i| format!("trace {i}")).collect();
        engine.script_container(
            "shop-orders",
            ContainerScript::exits_with(137, Duration::from_millis(10)).with_output(lines),
        );
        let (service, mut rx) = process(&engine, "orders", dir.path());

        service.start().await.expect("start");
        let status = timeout(Duration::from_secs(2), service.wait())
            .await
            .expect("exits")
            .expect("wait");
        assert_eq!(status, ServiceStatus::Errored);

        let events = drain(&mut rx);
        let failure = events
            .iter()
            .find(|e| e.status == ServiceStatus::Errored)
            .expect("errored event");
        assert!(failure.message.starts_with("exited with code 137"));
        assert!(failure.message.contains("trace 25"));
        assert!(!failure.message.contains("trace 5\n"));
        assert_eq!(failure.message.lines().count(), 21);
        assert!(events
            .iter()
            .any(|e| e.status == ServiceStatus::Running && e.message == "trace 1"));
        assert_eq!(engine.removed(), vec!["shop-orders".to_owned()]);
    }

    #[tokio::test]
    async fn attach_forwards_output_as_running_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        engine.script_container(
            "shop-api",
            ContainerScript::runs_until_stopped().with_output(["listening", "ready"]),
        );
        let (service, mut rx) = process(&engine, "api", dir.path());
        service.start().await.expect("start");
        drain(&mut rx);

        timeout(Duration::from_secs(1), service.attach())
            .await
            .expect("output stream ends");
        let lines: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.status == ServiceStatus::Running)
            .map(|e| e.message)
            .collect();
        assert_eq!(lines, vec!["listening".to_owned(), "ready".to_owned()]);
        service.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn zero_exit_is_done() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        engine.script_container("shop-cron", ContainerScript::exits_with(0, Duration::ZERO));
        let (service, _rx) = process(&engine, "cron", dir.path());
        service.start().await.expect("start");
        assert_eq!(service.wait().await.expect("wait"), ServiceStatus::Done);
        service.stop().await.expect("stop after exit is a no-op");
        assert!(engine.stop_calls().is_empty());
    }

    #[tokio::test]
    async fn start_failure_is_isolated_and_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        engine.script_container("shop-api", ContainerScript::failing_start("port in use"));
        let (service, mut rx) = process(&engine, "api", dir.path());

        let err = service.start().await.expect_err("start fails");
        assert!(matches!(err, LifecycleError::Engine { .. }));
        assert_eq!(service.status(), ServiceStatus::Errored);
        let events = drain(&mut rx);
        assert_eq!(
            events.last().map(|e| e.to_string()),
            Some("api [Errored]: failed to start".to_owned())
        );
    }

    #[tokio::test]
    async fn stop_before_start_prevents_launch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        let (service, _rx) = process(&engine, "api", dir.path());
        service.stop().await.expect("stop pending");
        assert!(matches!(
            service.start().await,
            Err(LifecycleError::StopRequested(_))
        ));
        assert!(engine.created().is_empty());
    }

    /// Engine whose container creation takes `delay`.
    struct SlowCreate {
        inner: InMemoryEngine,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ContainerEngine for SlowCreate {
        fn name(&self) -> &'static str {
            "slow-create"
        }

        async fn build(&self, request: &BuildRequest, logs: &LogWriter) -> kiln_engine::Result<()> {
            self.inner.build(request, logs).await
        }

        async fn create(&self, spec: &ContainerSpec) -> kiln_engine::Result<ContainerHandle> {
            tokio::time::sleep(self.delay).await;
            self.inner.create(spec).await
        }

        async fn start(&self, handle: &ContainerHandle) -> kiln_engine::Result<()> {
            self.inner.start(handle).await
        }

        async fn attach(&self, handle: &ContainerHandle) -> kiln_engine::Result<kiln_engine::OutputStream> {
            self.inner.attach(handle).await
        }

        async fn wait(&self, handle: &ContainerHandle) -> kiln_engine::Result<i64> {
            self.inner.wait(handle).await
        }

        async fn stop(&self, handle: &ContainerHandle, timeout: Option<Duration>) -> kiln_engine::Result<()> {
            self.inner.stop(handle, timeout).await
        }

        async fn logs(&self, handle: &ContainerHandle, tail: usize) -> kiln_engine::Result<bytes::Bytes> {
            self.inner.logs(handle, tail).await
        }

        async fn remove(&self, handle: &ContainerHandle) -> kiln_engine::Result<()> {
            self.inner.remove(handle).await
        }

        async fn ensure_network(&self, name: &str) -> kiln_engine::Result<()> {
            self.inner.ensure_network(name).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_while_starting_reports_stopped_after_the_container_is_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        let slow: Arc<dyn ContainerEngine> = Arc::new(SlowCreate {
            inner: engine.clone(),
            delay: Duration::from_millis(200),
        });
        let (tx, mut rx) = mpsc::channel(64);
        let spec = ServiceSpec::new("api", "api.ts", dir.path()).expect("spec");
        let service = Arc::new(ServiceProcess::new(spec, slow, tx, &settings()));

        let starting = {
            let service = service.clone();
            tokio::spawn(async move { service.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.status(), ServiceStatus::Starting);
        service.stop().await.expect("stop");

        let stopped = timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("update stream open");
                if event.status == ServiceStatus::Stopped {
                    break engine.stop_calls();
                }
            }
        })
        .await
        .expect("stopped reported");
        assert_eq!(stopped, vec!["shop-api".to_owned()]);

        starting.await.expect("join").expect("start");
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert_eq!(engine.removed(), vec!["shop-api".to_owned()]);
        assert!(drain(&mut rx).iter().all(|e| e.status != ServiceStatus::Stopped));
    }
}
