//! ---
//! kiln_section: "04-orchestration"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Run loop starting every service and fanning out stop."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
//! Run orchestration.
//!
//! One task per service drives `start` then `wait`. The loop returns when every
//! service has settled, or when the shared [`StopSignal`] fires, in which case
//! `stop` is fanned out to all services before the tasks are joined.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kiln_common::AppConfig;
use kiln_engine::ContainerEngine;
use kiln_rt::LogSources;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::build::{BuildError, BuildOrchestrator};
use crate::lifecycle::{LifecycleError, ServiceProcess, ServiceStatus, UpdateEvent};
use crate::service::ServiceSpec;
use crate::signal::StopSignal;

const DEFAULT_NETWORK: &str = "kiln-dev";
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_UPDATE_BUFFER: usize = 64;

/// Settings shared by every service of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Project name, prefix of every image tag.
    pub project: String,
    /// Network joined by all containers. `None` uses the engine default.
    pub network: Option<String>,
    /// Grace period given to a container on stop.
    pub stop_timeout: Duration,
    /// Capacity of the update event channel.
    pub update_buffer: usize,
}

impl RunSettings {
    /// Defaults for `project`.
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            network: Some(DEFAULT_NETWORK.to_owned()),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            update_buffer: DEFAULT_UPDATE_BUFFER,
        }
    }

    /// Settings from the `[run]` table of a project file.
    pub fn from_config(config: &AppConfig) -> Self {
        let network = config.run.network.trim();
        Self {
            project: config.name.clone(),
            network: (!network.is_empty()).then(|| network.to_owned()),
            stop_timeout: config.run.stop_timeout,
            update_buffer: config.run.update_buffer.max(1),
        }
    }
}

/// Final status of every service after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    statuses: BTreeMap<String, ServiceStatus>,
}

impl RunReport {
    /// Final status of `service`.
    pub fn status(&self, service: &str) -> Option<ServiceStatus> {
        self.statuses.get(service).copied()
    }

    /// All final statuses, by service name.
    pub fn statuses(&self) -> &BTreeMap<String, ServiceStatus> {
        &self.statuses
    }

    /// Services that ended in `Errored`.
    pub fn failed(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == ServiceStatus::Errored)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Drives every service of a project through build, run and stop.
pub struct RunOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    settings: RunSettings,
    services: Vec<Arc<ServiceProcess>>,
    stop: StopSignal,
}

impl RunOrchestrator {
    /// Create one [`ServiceProcess`] per spec. The returned receiver carries
    /// every [`UpdateEvent`] and must be drained while the run is active.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        settings: RunSettings,
        specs: Vec<ServiceSpec>,
    ) -> (Self, mpsc::Receiver<UpdateEvent>) {
        let (tx, rx) = mpsc::channel(settings.update_buffer.max(1));
        let services = specs
            .into_iter()
            .map(|spec| Arc::new(ServiceProcess::new(spec, engine.clone(), tx.clone(), &settings)))
            .collect();
        let orchestrator = Self {
            engine,
            settings,
            services,
            stop: StopSignal::new(),
        };
        (orchestrator, rx)
    }

    /// Use an externally owned stop signal.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Managed services, in declaration order.
    pub fn services(&self) -> &[Arc<ServiceProcess>] {
        &self.services
    }

    /// Signal that stops the build batch and the run loop.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Settings of this run.
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Build every service image. Submission stops once the stop signal fires.
    pub async fn build(
        &self,
        builder: &BuildOrchestrator,
        logs: Option<&LogSources>,
    ) -> Result<(), BuildError> {
        builder
            .clone()
            .with_stop_signal(self.stop.clone())
            .build_all(&self.services, logs)
            .await
    }

    /// Start every service and wait until all of them settle or the stop
    /// signal fires. Only a network failure is returned as an error; service
    /// failures are reported through update events and the [`RunReport`].
    pub async fn run(&self) -> Result<RunReport, LifecycleError> {
        if let Some(network) = &self.settings.network {
            self.engine
                .ensure_network(network)
                .await
                .map_err(|source| LifecycleError::Network {
                    network: network.clone(),
                    source,
                })?;
        }

        info!(
            project = %self.settings.project,
            services = self.services.len(),
            engine = self.engine.name(),
            "starting services"
        );
        let handles: Vec<JoinHandle<()>> = self
            .services
            .iter()
            .map(|service| tokio::spawn(drive(service.clone(), self.stop.clone())))
            .collect();

        let settled = join_all(handles);
        tokio::pin!(settled);

        let joined = tokio::select! {
            joined = &mut settled => joined,
            _ = self.stop.triggered() => {
                info!(project = %self.settings.project, "stop requested; stopping services");
                self.stop_all().await;
                settled.await
            }
        };

        // Stops settle on the stopping task, so read statuses only after every
        // task and every stop has finished.
        let mut statuses = BTreeMap::new();
        for (service, outcome) in self.services.iter().zip(joined) {
            let status = match outcome {
                Ok(()) => service.status(),
                Err(err) => {
                    error!(service = %service.name(), error = %err, "service task aborted");
                    ServiceStatus::Errored
                }
            };
            statuses.insert(service.name().to_owned(), status);
        }
        info!(project = %self.settings.project, "all services settled");
        Ok(RunReport { statuses })
    }

    /// Stop every service concurrently. Failures are logged and never
    /// interrupt the fan-out.
    pub async fn stop_all(&self) {
        let stops = self.services.iter().map(|service| async move {
            if let Err(err) = service.stop().await {
                warn!(service = %service.name(), error = %err, "stop failed");
            }
        });
        join_all(stops).await;
    }
}

async fn drive(service: Arc<ServiceProcess>, stop: StopSignal) {
    if stop.is_triggered() {
        debug!(service = %service.name(), "stop already requested; not starting");
        return;
    }
    if let Err(err) = service.start().await {
        debug!(service = %service.name(), error = %err, "service did not start");
        return;
    }
    match service.wait().await {
        Ok(status) => debug!(service = %service.name(), status = ?status, "service settled"),
        Err(err) => debug!(service = %service.name(), error = %err, "service wait failed"),
    }
}
