//! ---
//! kiln_section: "02-container-engine"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Scriptable in-process container engine."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
//! In-memory [`ContainerEngine`] used by tests and `--dry-run`.
//!
//! Builds and containers follow scripts registered per image tag; anything
//! without a script builds instantly and runs until stopped.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use kiln_rt::LogWriter;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    BuildRequest, ContainerEngine, ContainerHandle, ContainerSpec, EngineError, OutputStream,
    Result,
};

/// Exit code reported for containers terminated through [`ContainerEngine::stop`].
pub const STOPPED_EXIT_CODE: i64 = 143;

/// Scripted behaviour of one image build.
#[derive(Debug, Clone, Default)]
pub struct BuildScript {
    /// Time the build takes.
    pub duration: Duration,
    /// Output lines written to the build log.
    pub output: Vec<String>,
    /// When set, the build fails with this message.
    pub failure: Option<String>,
}

impl BuildScript {
    /// Build that takes `duration` and succeeds.
    pub fn taking(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    /// Build that fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Attach output lines to the build.
    pub fn with_output<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = lines.into_iter().map(Into::into).collect();
        self
    }
}

/// Scripted behaviour of containers created from one image.
#[derive(Debug, Clone, Default)]
pub struct ContainerScript {
    /// Lines the container prints.
    pub output: Vec<String>,
    /// Exit code and the delay after start before exiting. `None` runs until stopped.
    pub exit: Option<(i64, Duration)>,
    /// When set, `start` fails with this message.
    pub start_failure: Option<String>,
}

impl ContainerScript {
    /// Container that runs until stopped.
    pub fn runs_until_stopped() -> Self {
        Self::default()
    }

    /// Container that exits with `code` after `after`.
    pub fn exits_with(code: i64, after: Duration) -> Self {
        Self {
            exit: Some((code, after)),
            ..Self::default()
        }
    }

    /// Container whose start fails.
    pub fn failing_start(message: impl Into<String>) -> Self {
        Self {
            start_failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Attach output lines to the container.
    pub fn with_output<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = lines.into_iter().map(Into::into).collect();
        self
    }
}

/// A build the engine executed, as observed when it started.
#[derive(Debug, Clone)]
pub struct RecordedBuild {
    /// Request passed to `build`.
    pub request: BuildRequest,
    /// Whether the descriptor existed on disk when the build started.
    pub dockerfile_present: bool,
}

struct Instance {
    spec: ContainerSpec,
    script: ContainerScript,
    exit: watch::Sender<Option<i64>>,
}

#[derive(Default)]
struct State {
    build_scripts: HashMap<String, BuildScript>,
    container_scripts: HashMap<String, ContainerScript>,
    instances: HashMap<String, Instance>,
    networks: BTreeSet<String>,
    builds: Vec<RecordedBuild>,
    stop_calls: Vec<String>,
    removed: Vec<String>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    active_builds: AtomicUsize,
    peak_builds: AtomicUsize,
    next_id: AtomicU64,
}

/// Scriptable in-memory container engine.
#[derive(Clone, Default)]
pub struct InMemoryEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEngine")
            .field("peak_builds", &self.peak_concurrent_builds())
            .finish()
    }
}

impl InMemoryEngine {
    /// Create an engine with no scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the build of `tag`.
    pub fn script_build(&self, tag: impl Into<String>, script: BuildScript) -> &Self {
        self.inner.state.lock().build_scripts.insert(tag.into(), script);
        self
    }

    /// Script containers created from `image`.
    pub fn script_container(&self, image: impl Into<String>, script: ContainerScript) -> &Self {
        self.inner
            .state
            .lock()
            .container_scripts
            .insert(image.into(), script);
        self
    }

    /// Highest number of builds observed running at the same time.
    pub fn peak_concurrent_builds(&self) -> usize {
        self.inner.peak_builds.load(Ordering::SeqCst)
    }

    /// Builds executed so far, in start order.
    pub fn builds(&self) -> Vec<RecordedBuild> {
        self.inner.state.lock().builds.clone()
    }

    /// Container names `stop` was called for, in call order.
    pub fn stop_calls(&self) -> Vec<String> {
        self.inner.state.lock().stop_calls.clone()
    }

    /// Container names that were removed.
    pub fn removed(&self) -> Vec<String> {
        self.inner.state.lock().removed.clone()
    }

    /// Specs of every container created so far.
    pub fn created(&self) -> Vec<ContainerSpec> {
        let state = self.inner.state.lock();
        let mut specs: Vec<ContainerSpec> =
            state.instances.values().map(|instance| instance.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Networks that exist.
    pub fn networks(&self) -> Vec<String> {
        self.inner.state.lock().networks.iter().cloned().collect()
    }

    fn exit_receiver(&self, handle: &ContainerHandle) -> Result<watch::Receiver<Option<i64>>> {
        let state = self.inner.state.lock();
        state
            .instances
            .get(handle.id())
            .map(|instance| instance.exit.subscribe())
            .ok_or_else(|| EngineError::NotFound(handle.name().to_owned()))
    }

    fn script_for(&self, handle: &ContainerHandle) -> Result<ContainerScript> {
        let state = self.inner.state.lock();
        state
            .instances
            .get(handle.id())
            .map(|instance| instance.script.clone())
            .ok_or_else(|| EngineError::NotFound(handle.name().to_owned()))
    }
}

struct ActiveBuild<'a>(&'a AtomicUsize);

impl Drop for ActiveBuild<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerEngine for InMemoryEngine {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn build(&self, request: &BuildRequest, logs: &LogWriter) -> Result<()> {
        let script = {
            let mut state = self.inner.state.lock();
            state.builds.push(RecordedBuild {
                request: request.clone(),
                dockerfile_present: request.dockerfile.exists(),
            });
            state
                .build_scripts
                .get(&request.tag)
                .cloned()
                .unwrap_or_default()
        };

        let now = self.inner.active_builds.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveBuild(&self.inner.active_builds);
        self.inner.peak_builds.fetch_max(now, Ordering::SeqCst);
        debug!(tag = %request.tag, active = now, "in-memory build started");

        for line in &script.output {
            logs.write_line(line).await?;
        }
        if !script.duration.is_zero() {
            tokio::time::sleep(script.duration).await;
        }
        match script.failure {
            Some(message) => Err(EngineError::Build {
                tag: request.tag.clone(),
                message,
            }),
            None => Ok(()),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let id = format!("mem-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut state = self.inner.state.lock();
        if let Some(network) = &spec.network {
            if !state.networks.contains(network) {
                return Err(EngineError::Network {
                    name: network.clone(),
                    message: "network does not exist".into(),
                });
            }
        }
        let script = state
            .container_scripts
            .get(&spec.image)
            .cloned()
            .unwrap_or_default();
        let (exit, _) = watch::channel(None);
        state.instances.insert(
            id.clone(),
            Instance {
                spec: spec.clone(),
                script,
                exit,
            },
        );
        Ok(ContainerHandle::new(id, spec.name.clone()))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        let script = self.script_for(handle)?;
        if let Some(message) = script.start_failure {
            return Err(EngineError::Container {
                operation: "start",
                container: handle.name().to_owned(),
                message,
            });
        }
        if let Some((code, after)) = script.exit {
            let exit = {
                let state = self.inner.state.lock();
                state
                    .instances
                    .get(handle.id())
                    .map(|instance| instance.exit.clone())
            };
            if let Some(exit) = exit {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    exit.send_if_modified(|current| {
                        if current.is_none() {
                            *current = Some(code);
                            true
                        } else {
                            false
                        }
                    });
                });
            }
        }
        Ok(())
    }

    async fn attach(&self, handle: &ContainerHandle) -> Result<OutputStream> {
        let script = self.script_for(handle)?;
        let chunks = script
            .output
            .into_iter()
            .map(|line| Ok(Bytes::from(format!("{line}\n"))));
        Ok(stream::iter(chunks).boxed())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64> {
        let mut exit = self.exit_receiver(handle)?;
        let code = exit
            .wait_for(Option::is_some)
            .await
            .map(|code| code.unwrap_or_default())
            .map_err(|_| EngineError::NotFound(handle.name().to_owned()))?;
        Ok(code)
    }

    async fn stop(&self, handle: &ContainerHandle, _timeout: Option<Duration>) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.stop_calls.push(handle.name().to_owned());
        let instance = state
            .instances
            .get(handle.id())
            .ok_or_else(|| EngineError::NotFound(handle.name().to_owned()))?;
        instance.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(STOPPED_EXIT_CODE);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn logs(&self, handle: &ContainerHandle, tail: usize) -> Result<Bytes> {
        let script = self.script_for(handle)?;
        let skip = script.output.len().saturating_sub(tail);
        let mut joined = String::new();
        for line in script.output.iter().skip(skip) {
            joined.push_str(line);
            joined.push('\n');
        }
        Ok(Bytes::from(joined))
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.removed.push(handle.name().to_owned());
        // The container stays listed in `created`; only its exit channel resolves.
        if let Some(instance) = state.instances.get(handle.id()) {
            instance.exit.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(STOPPED_EXIT_CODE);
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.inner.state.lock().networks.insert(name.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_rt::LogMultiplexer;
    use std::path::PathBuf;
    use tokio::time::timeout;

    fn request(tag: &str) -> BuildRequest {
        BuildRequest {
            dockerfile: PathBuf::from("/nonexistent/Dockerfile"),
            context_dir: PathBuf::from("/nonexistent"),
            tag: tag.into(),
            build_args: Default::default(),
            ignore: vec![],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn build_scripts_control_output_and_failure() {
        let engine = InMemoryEngine::new();
        engine.script_build("shop-api", BuildScript::taking(Duration::ZERO).with_output(["step 1", "step 2"]));
        engine.script_build("shop-bad", BuildScript::failing("npm ci failed"));

        let mut mux = LogMultiplexer::new();
        let writer = mux.create_source("api").expect("source");
        let reader = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(message) = mux.next().await {
                lines.push(message.text());
                if lines.len() == 2 {
                    break;
                }
            }
            lines
        });
        engine.build(&request("shop-api"), &writer).await.expect("build");
        assert_eq!(reader.await.expect("reader"), vec!["step 1\n", "step 2\n"]);

        let err = engine
            .build(&request("shop-bad"), &LogWriter::discard())
            .await
            .expect_err("scripted failure");
        assert!(err.to_string().contains("npm ci failed"));
        assert_eq!(engine.builds().len(), 2);
        assert!(!engine.builds()[0].dockerfile_present);
    }

    #[tokio::test]
    async fn container_runs_until_stopped() {
        let engine = InMemoryEngine::new();
        engine.ensure_network("kiln-dev").await.expect("network");
        let handle = engine
            .create(&ContainerSpec {
                name: "shop-api".into(),
                image: "shop-api".into(),
                network: Some("kiln-dev".into()),
                ..ContainerSpec::default()
            })
            .await
            .expect("create");
        engine.start(&handle).await.expect("start");

        let waiter = {
            let engine = engine.clone();
            let handle = handle.clone();
            tokio::spawn(async move { engine.wait(&handle).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        engine.stop(&handle, None).await.expect("stop");
        let code = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait returns")
            .expect("join")
            .expect("exit code");
        assert_eq!(code, STOPPED_EXIT_CODE);
        assert_eq!(engine.stop_calls(), vec!["shop-api".to_owned()]);
    }

    #[tokio::test]
    async fn scripted_exit_and_log_tail() {
        let engine = InMemoryEngine::new();
        let lines: Vec<String> = (1..=30).map(|i| format!("line {i}")).collect();
        engine.script_container(
            "crash",
            ContainerScript::exits_with(137, Duration::from_millis(5)).with_output(lines),
        );
        let handle = engine
            .create(&ContainerSpec {
                name: "crash".into(),
                image: "crash".into(),
                ..ContainerSpec::default()
            })
            .await
            .expect("create");
        engine.start(&handle).await.expect("start");
        assert_eq!(engine.wait(&handle).await.expect("wait"), 137);

        let tail = engine.logs(&handle, 20).await.expect("logs");
        let text = String::from_utf8_lossy(&tail).into_owned();
        assert_eq!(text.lines().count(), 20);
        assert!(text.starts_with("line 11\n"));
        assert!(text.ends_with("line 30\n"));
    }

    #[tokio::test]
    async fn create_requires_existing_network() {
        let engine = InMemoryEngine::new();
        let err = engine
            .create(&ContainerSpec {
                name: "svc".into(),
                image: "svc".into(),
                network: Some("missing".into()),
                ..ContainerSpec::default()
            })
            .await
            .expect_err("network missing");
        assert!(matches!(err, EngineError::Network { .. }));
    }
}
