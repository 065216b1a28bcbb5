//! ---
//! kiln_section: "04-orchestration"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Concurrent image builds for every service of a project."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use kiln_common::{AppConfig, ConfigError};
use kiln_rt::{JobScheduler, LogSources, LogWriter, SchedulerError};
use thiserror::Error;
use tracing::{info, warn};

use crate::lifecycle::{LifecycleError, ServiceProcess};
use crate::service::is_valid_service_name;
use crate::signal::StopSignal;

/// Variable tokio reads to size its worker pool.
const TOKIO_WORKER_THREADS: &str = "TOKIO_WORKER_THREADS";

/// One service that failed to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    /// Service name.
    pub service: String,
    /// Rendered error.
    pub error: String,
}

/// Errors returned by [`BuildOrchestrator::build_all`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// Pre-flight check: names outside the identifier grammar.
    #[error(
        "invalid service name(s) {}. Names can only include lowercase alphanumeric characters separated by single underscores, periods or hyphens",
        .0.join(", ")
    )]
    InvalidNames(Vec<String>),
    /// Pre-flight check: the same name appears twice.
    #[error("service '{0}' is declared more than once")]
    DuplicateService(String),
    /// At least one build failed.
    #[error("{}", render_failures(.failures))]
    Failed {
        /// Every failing service, sorted by name.
        failures: Vec<ServiceFailure>,
    },
    /// The stop signal fired before every build was submitted.
    #[error("build cancelled; not started: {}", .skipped.join(", "))]
    Cancelled {
        /// Services never submitted.
        skipped: Vec<String>,
    },
    /// The scheduler refused a job.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl BuildError {
    /// Names of services that failed to build.
    pub fn failed_services(&self) -> Vec<&str> {
        match self {
            BuildError::Failed { failures } => {
                failures.iter().map(|failure| failure.service.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn render_failures(failures: &[ServiceFailure]) -> String {
    let mut rendered = String::from("errors occurred building images:");
    for failure in failures {
        rendered.push_str(&format!("\n  {}: {}", failure.service, failure.error));
    }
    rendered
}

/// Build-batch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSettings {
    /// Number of builds allowed to run at once.
    pub max_concurrency: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_build_concurrency(),
        }
    }
}

impl BuildSettings {
    /// Settings with an explicit ceiling.
    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Resolve the ceiling from `MAX_BUILD_CONCURRENCY`, then
    /// `build.max_concurrency`, then [`default_build_concurrency`].
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(match config.build.concurrency_override()? {
            Some(max) => Self::with_concurrency(max),
            None => Self::default(),
        })
    }
}

fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn runtime_parallelism() -> usize {
    std::env::var(TOKIO_WORKER_THREADS)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|workers| *workers > 0)
        .unwrap_or_else(logical_cpus)
}

/// `min(runtime parallelism, logical CPUs)`.
pub fn default_build_concurrency() -> usize {
    runtime_parallelism().min(logical_cpus()).max(1)
}

/// Runs one build job per service through a [`JobScheduler`].
#[derive(Debug, Clone, Default)]
pub struct BuildOrchestrator {
    settings: BuildSettings,
    stop: Option<StopSignal>,
}

impl BuildOrchestrator {
    /// Orchestrator using `settings`.
    pub fn new(settings: BuildSettings) -> Self {
        Self {
            settings,
            stop: None,
        }
    }

    /// Stop submitting builds once `stop` fires. Builds already running finish.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Effective settings.
    pub fn settings(&self) -> BuildSettings {
        self.settings
    }

    /// Pre-flight checks run before any build is scheduled.
    pub fn validate(services: &[Arc<ServiceProcess>]) -> Result<(), BuildError> {
        let invalid: Vec<String> = services
            .iter()
            .map(|service| service.name())
            .filter(|name| !is_valid_service_name(name))
            .map(str::to_owned)
            .collect();
        if !invalid.is_empty() {
            return Err(BuildError::InvalidNames(invalid));
        }
        let mut seen = HashSet::new();
        for service in services {
            if !seen.insert(service.name()) {
                return Err(BuildError::DuplicateService(service.name().to_owned()));
            }
        }
        Ok(())
    }

    /// Build every service. Output of each build goes to a source named after
    /// the service when `logs` is given, and is discarded otherwise. Succeeds
    /// only if every build succeeds.
    pub async fn build_all(
        &self,
        services: &[Arc<ServiceProcess>],
        logs: Option<&LogSources>,
    ) -> Result<(), BuildError> {
        Self::validate(services)?;

        let concurrency = self.settings.max_concurrency;
        info!(concurrency, services = services.len(), "running {concurrency} builds concurrently");
        let scheduler = JobScheduler::<LifecycleError>::new(concurrency);

        let mut skipped = Vec::new();
        for service in services {
            if self.stop.as_ref().is_some_and(StopSignal::is_triggered) {
                skipped.push(service.name().to_owned());
                continue;
            }

            // Entrypoints must not import each other; excluding siblings makes
            // such imports fail at build time.
            let ignore: Vec<String> = services
                .iter()
                .filter(|other| other.name() != service.name())
                .map(|other| other.spec().handler.clone())
                .collect();
            let writer = logs
                .map(|sources| sources.create_source(service.name()))
                .unwrap_or_else(LogWriter::discard);

            let job = service.clone();
            let stop = self.stop.clone();
            scheduler.submit(service.name(), async move {
                // Queued jobs observe a stop raised after submission.
                if stop.as_ref().is_some_and(StopSignal::is_triggered) {
                    return Err(LifecycleError::StopRequested(job.name().to_owned()));
                }
                job.build(&ignore, &writer).await
            })?;
        }

        let results = scheduler.wait().await?;
        let mut failures = Vec::new();
        for (service, failure) in results.failures() {
            if matches!(failure.error(), Some(LifecycleError::StopRequested(_))) {
                skipped.push(service.to_owned());
                continue;
            }
            failures.push(ServiceFailure {
                service: service.to_owned(),
                error: failure.to_string(),
            });
        }

        if !failures.is_empty() {
            warn!(failed = failures.len(), "image builds failed");
            return Err(BuildError::Failed { failures });
        }
        if !skipped.is_empty() {
            skipped.sort();
            info!(skipped = skipped.len(), "build batch cancelled");
            return Err(BuildError::Cancelled { skipped });
        }
        info!(built = results.len(), "all images built");
        Ok(())
    }
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.service, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunSettings;
    use crate::service::ServiceSpec;
    use kiln_engine::{BuildScript, ContainerEngine, InMemoryEngine};
    use kiln_rt::LogMultiplexer;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn services(
        engine: &InMemoryEngine,
        names: &[&str],
        dir: &std::path::Path,
    ) -> (Vec<Arc<ServiceProcess>>, mpsc::Receiver<crate::UpdateEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let shared: Arc<dyn ContainerEngine> = Arc::new(engine.clone());
        let settings = RunSettings::new("shop");
        let processes = names
            .iter()
            .map(|name| {
                let spec = ServiceSpec::new(*name, format!("{name}.py"), dir).expect("spec");
                Arc::new(ServiceProcess::new(spec, shared.clone(), tx.clone(), &settings))
            })
            .collect();
        (processes, rx)
    }

    #[tokio::test]
    async fn invalid_names_fail_before_any_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        let (processes, _rx) = services(&engine, &["orders", "Bad_Name", "ok", "also bad"], dir.path());

        let err = BuildOrchestrator::new(BuildSettings::with_concurrency(2))
            .build_all(&processes, None)
            .await
            .expect_err("invalid names");
        match &err {
            BuildError::InvalidNames(names) => {
                assert_eq!(names, &vec!["Bad_Name".to_owned(), "also bad".to_owned()])
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("Names can only include"));
        assert!(engine.builds().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failures_are_aggregated_by_service() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        engine.script_build("shop-billing", BuildScript::failing("pip install failed"));
        engine.script_build("shop-search", BuildScript::failing("missing requirements.txt"));
        let (processes, _rx) = services(&engine, &["orders", "billing", "search", "cron"], dir.path());

        let err = BuildOrchestrator::new(BuildSettings::with_concurrency(2))
            .build_all(&processes, None)
            .await
            .expect_err("two builds fail");
        assert_eq!(err.failed_services(), vec!["billing", "search"]);
        let rendered = err.to_string();
        assert!(rendered.starts_with("errors occurred building images:"));
        assert!(rendered.contains("pip install failed"));
        assert!(rendered.contains("missing requirements.txt"));
        assert_eq!(engine.builds().len(), 4, "siblings still build");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn each_build_ignores_sibling_entrypoints_and_logs_per_service() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        engine.script_build("shop-orders", BuildScript::default().with_output(["compiling orders"]));
        let (processes, _rx) = services(&engine, &["orders", "billing"], dir.path());

        let mut mux = LogMultiplexer::new();
        let sources = mux.sources().expect("sources");
        mux.seal();
        // A single line fits the multiplexer's buffer, so the build never blocks.
        BuildOrchestrator::new(BuildSettings::with_concurrency(2))
            .build_all(&processes, Some(&sources))
            .await
            .expect("builds succeed");
        drop(sources);
        let message = mux.next().await.expect("build output");
        assert_eq!(message.source_id, "orders");
        assert_eq!(message.text(), "compiling orders\n");
        assert!(mux.next().await.is_none());

        for build in engine.builds() {
            let own = if build.request.tag == "shop-orders" { "orders.py" } else { "billing.py" };
            let sibling = if own == "orders.py" { "billing.py" } else { "orders.py" };
            assert!(build.request.ignore.contains(&sibling.to_owned()));
            assert!(!build.request.ignore.contains(&own.to_owned()));
        }
    }

    #[tokio::test]
    async fn stop_signal_prevents_new_submissions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        engine.script_build("shop-a", BuildScript::taking(Duration::from_millis(5)));
        let (processes, _rx) = services(&engine, &["a", "b"], dir.path());
        let stop = StopSignal::new();
        stop.trigger();

        let err = BuildOrchestrator::new(BuildSettings::with_concurrency(1))
            .with_stop_signal(stop)
            .build_all(&processes, None)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, BuildError::Cancelled { ref skipped } if skipped.len() == 2));
        assert!(engine.builds().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_a_build_cancels_queued_builds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = InMemoryEngine::new();
        let names = ["a", "b", "c", "d"];
        for name in names {
            engine.script_build(format!("shop-{name}"), BuildScript::taking(Duration::from_millis(200)));
        }
        let (processes, _rx) = services(&engine, &names, dir.path());
        let stop = StopSignal::new();
        let trigger = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                stop.trigger();
            })
        };

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            BuildOrchestrator::new(BuildSettings::with_concurrency(1))
                .with_stop_signal(stop)
                .build_all(&processes, None),
        )
        .await
        .expect("batch returns")
        .expect_err("cancelled");
        trigger.await.expect("trigger");

        let started = engine.builds().len();
        assert_eq!(started, 1, "only the running build completes");
        match err {
            BuildError::Cancelled { skipped } => assert_eq!(skipped.len(), names.len() - started),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn default_concurrency_is_positive_and_bounded_by_cpus() {
        let value = default_build_concurrency();
        assert!(value >= 1);
        assert!(value <= logical_cpus());
    }
}
