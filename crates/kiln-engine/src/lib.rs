//! ---
//! kiln_section: "02-container-engine"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Container engine abstraction consumed by the orchestrator."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Container engine seam.
//!
//! The orchestrator only talks to [`ContainerEngine`]. [`DockerCli`] drives a
//! local Docker daemon through its command line client and [`InMemoryEngine`]
//! is a scriptable stand-in used by tests and dry runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use kiln_rt::{LogWriter, MultiplexerError};

pub mod docker;
pub mod memory;

pub use docker::DockerCli;
pub use memory::{BuildScript, ContainerScript, InMemoryEngine, RecordedBuild};

/// Shared result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Output produced by an attached container, chunk by chunk.
pub type OutputStream = BoxStream<'static, Result<Bytes>>;

/// Errors reported by a container engine. Every variant is scoped to the
/// image, container or network it names.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Image build failed; `message` carries the engine's final error line.
    #[error("build of image '{tag}' failed: {message}")]
    Build {
        /// Tag that was being built.
        tag: String,
        /// Last error reported by the engine.
        message: String,
    },
    /// An operation on an existing container failed.
    #[error("{operation} of container '{container}' failed: {message}")]
    Container {
        /// Engine operation, e.g. `start`.
        operation: &'static str,
        /// Container name or id.
        container: String,
        /// Engine error output.
        message: String,
    },
    /// Network inspection or creation failed.
    #[error("network '{name}' could not be prepared: {message}")]
    Network {
        /// Network name.
        name: String,
        /// Engine error output.
        message: String,
    },
    /// The container is unknown to the engine.
    #[error("container '{0}' not found")]
    NotFound(String),
    /// The engine returned output that could not be interpreted.
    #[error("unexpected engine output for {operation}: {output}")]
    Protocol {
        /// Engine operation.
        operation: &'static str,
        /// Offending output.
        output: String,
    },
    /// Spawning or talking to the engine process failed.
    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),
    /// Build output could not be forwarded to its log sink.
    #[error("build output could not be forwarded: {0}")]
    Log(#[from] MultiplexerError),
}

/// Everything needed to build one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Descriptor (Dockerfile) path, inside `context_dir`.
    pub dockerfile: PathBuf,
    /// Directory sent to the engine as build context.
    pub context_dir: PathBuf,
    /// Resulting image tag.
    pub tag: String,
    /// `--build-arg` values.
    pub build_args: BTreeMap<String, String>,
    /// Patterns excluded from the build context.
    pub ignore: Vec<String>,
}

/// Parameters used to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image to instantiate.
    pub image: String,
    /// Environment passed to the container.
    pub env: BTreeMap<String, String>,
    /// Port published on the host and inside the container.
    pub port: Option<u16>,
    /// Network the container joins.
    pub network: Option<String>,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

/// Handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    id: String,
    name: String,
}

impl ContainerHandle {
    /// Build a handle from the engine id and the requested name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Engine-assigned identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Build and process-lifecycle operations offered by a container runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &'static str;

    /// Build an image, streaming build output to `logs`.
    async fn build(&self, request: &BuildRequest, logs: &LogWriter) -> Result<()>;

    /// Create (but do not start) a container.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Start a created container.
    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// Follow the container's combined stdout and stderr.
    async fn attach(&self, handle: &ContainerHandle) -> Result<OutputStream>;

    /// Wait for the container to exit and return its exit code.
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64>;

    /// Ask the container to stop, killing it after `timeout`.
    async fn stop(&self, handle: &ContainerHandle, timeout: Option<Duration>) -> Result<()>;

    /// Last `tail` lines of output.
    async fn logs(&self, handle: &ContainerHandle, tail: usize) -> Result<Bytes>;

    /// Remove an exited container.
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;

    /// Create the named network unless it already exists.
    async fn ensure_network(&self, name: &str) -> Result<()>;
}
