//! ---
//! kiln_section: "04-orchestration"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Static service definitions, runtimes and build descriptors."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use kiln_common::{LoadedAppConfig, ServiceConfig};
use thiserror::Error;
use tracing::{debug, warn};

/// Suffix of the synthesized build descriptor written into a build context.
pub const DESCRIPTOR_SUFFIX: &str = "kiln.dynamic.dockerfile";

/// Problems with a service definition.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The handler extension does not map to a known runtime.
    #[error("service '{service}': no runtime for handler '{handler}' (expected .ts, .js, .py or .go, or set a dockerfile)")]
    UnsupportedRuntime {
        /// Service name.
        service: String,
        /// Handler path as configured.
        handler: String,
    },
    /// The handler does not live inside the build context.
    #[error("service '{service}': handler '{handler}' is outside the build context {context}")]
    HandlerOutsideContext {
        /// Service name.
        service: String,
        /// Handler path resolved against the project root.
        handler: String,
        /// Resolved build context directory.
        context: PathBuf,
    },
    /// A custom Dockerfile could not be read.
    #[error("service '{service}': unable to read dockerfile {path}: {source}")]
    Dockerfile {
        /// Service name.
        service: String,
        /// Configured Dockerfile path.
        path: PathBuf,
        /// Underlying io error.
        source: io::Error,
    },
    /// The descriptor or its ignore file could not be written.
    #[error("service '{service}': unable to write {path}: {source}")]
    Descriptor {
        /// Service name.
        service: String,
        /// File being written.
        path: PathBuf,
        /// Underlying io error.
        source: io::Error,
    },
}

/// How a service image is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// `.ts` handlers.
    TypeScript,
    /// `.js`, `.mjs` and `.cjs` handlers.
    JavaScript,
    /// `.py` handlers.
    Python,
    /// `.go` handlers.
    Go,
    /// A user supplied Dockerfile, used verbatim.
    Custom {
        /// Absolute path of the Dockerfile.
        dockerfile: PathBuf,
    },
}

const TYPESCRIPT_DOCKERFILE: &str = r#"FROM node:20-alpine
ARG HANDLER
ENV HANDLER=${HANDLER}
WORKDIR /usr/app
COPY package*.json ./
RUN npm install
COPY . .
CMD ["sh", "-c", "npx --yes tsx \"$HANDLER\""]
"#;

const JAVASCRIPT_DOCKERFILE: &str = r#"FROM node:20-alpine
ARG HANDLER
ENV HANDLER=${HANDLER}
WORKDIR /usr/app
COPY package*.json ./
RUN npm install --omit=dev
COPY . .
CMD ["sh", "-c", "node \"$HANDLER\""]
"#;

const PYTHON_DOCKERFILE: &str = r#"FROM python:3.11-slim
ARG HANDLER
ENV HANDLER=${HANDLER} PYTHONUNBUFFERED=1
WORKDIR /app
COPY requirements*.txt ./
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi
COPY . .
CMD ["sh", "-c", "python \"$HANDLER\""]
"#;

const GO_DOCKERFILE: &str = r#"FROM golang:1.22-alpine AS build
ARG HANDLER
WORKDIR /src
COPY go.* ./
RUN go mod download
COPY . .
RUN go build -o /bin/service "./$(dirname "$HANDLER")"

FROM alpine:3.19
COPY --from=build /bin/service /bin/service
CMD ["/bin/service"]
"#;

impl Runtime {
    /// Pick the runtime for `handler`, preferring an explicit Dockerfile.
    pub fn detect(
        service: &str,
        handler: &Path,
        dockerfile: Option<PathBuf>,
    ) -> Result<Self, ServiceError> {
        if let Some(dockerfile) = dockerfile {
            return Ok(Runtime::Custom { dockerfile });
        }
        let extension = handler
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("ts") => Ok(Runtime::TypeScript),
            Some("js" | "mjs" | "cjs") => Ok(Runtime::JavaScript),
            Some("py") => Ok(Runtime::Python),
            Some("go") => Ok(Runtime::Go),
            _ => Err(ServiceError::UnsupportedRuntime {
                service: service.to_owned(),
                handler: handler.display().to_string(),
            }),
        }
    }

    /// Descriptor contents for this runtime.
    pub async fn dockerfile(&self, service: &str) -> Result<String, ServiceError> {
        Ok(match self {
            Runtime::TypeScript => TYPESCRIPT_DOCKERFILE.to_owned(),
            Runtime::JavaScript => JAVASCRIPT_DOCKERFILE.to_owned(),
            Runtime::Python => PYTHON_DOCKERFILE.to_owned(),
            Runtime::Go => GO_DOCKERFILE.to_owned(),
            Runtime::Custom { dockerfile } => tokio::fs::read_to_string(dockerfile)
                .await
                .map_err(|source| ServiceError::Dockerfile {
                    service: service.to_owned(),
                    path: dockerfile.clone(),
                    source,
                })?,
        })
    }

    /// Build arguments passed alongside the descriptor.
    pub fn build_args(&self, handler: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("HANDLER".to_owned(), handler.to_owned())])
    }

    /// Runtime-specific ignore patterns appended to the service's list.
    pub fn default_ignores(&self) -> &'static [&'static str] {
        match self {
            Runtime::TypeScript | Runtime::JavaScript => &["node_modules/", ".git/", ".kiln/"],
            Runtime::Python => &["__pycache__/", "*.pyc", ".venv/", ".git/", ".kiln/"],
            Runtime::Go => &["vendor/", ".git/", ".kiln/"],
            Runtime::Custom { .. } => &[".git/", ".kiln/"],
        }
    }
}

/// Static definition of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service name, also the container and log source name.
    pub name: String,
    /// Entrypoint relative to `context_dir`, with `/` separators.
    pub handler: String,
    /// Build context directory.
    pub context_dir: PathBuf,
    /// Runtime used to synthesize the descriptor.
    pub runtime: Runtime,
    /// Extra environment for the running container.
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    /// Define a service whose runtime is inferred from `handler`.
    pub fn new(
        name: impl Into<String>,
        handler: impl Into<String>,
        context_dir: impl Into<PathBuf>,
    ) -> Result<Self, ServiceError> {
        let name = name.into();
        let handler = handler.into();
        let runtime = Runtime::detect(&name, Path::new(&handler), None)?;
        Ok(Self {
            name,
            handler,
            context_dir: context_dir.into(),
            runtime,
            env: BTreeMap::new(),
        })
    }

    /// Build a spec from a `[services.<name>]` entry. Relative paths resolve
    /// against `project_root`; the handler is then made relative to the build
    /// context and must lie inside it.
    pub fn from_config(
        project_root: &Path,
        name: &str,
        config: &ServiceConfig,
    ) -> Result<Self, ServiceError> {
        let context_dir = match &config.context {
            Some(context) => project_root.join(context),
            None => project_root.to_path_buf(),
        };
        let dockerfile = config.dockerfile.as_ref().map(|path| project_root.join(path));
        let runtime = Runtime::detect(name, &config.handler, dockerfile)?;
        let handler = relative_handler(name, &project_root.join(&config.handler), &context_dir)?;
        Ok(Self {
            name: name.to_owned(),
            handler,
            context_dir,
            runtime,
            env: config
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        })
    }

    /// File name of the synthesized descriptor.
    pub fn descriptor_name(&self) -> String {
        format!("{}.{DESCRIPTOR_SUFFIX}", self.name)
    }
}

/// `handler` relative to `context_dir`, with `/` separators.
fn relative_handler(service: &str, handler: &Path, context_dir: &Path) -> Result<String, ServiceError> {
    let outside = || ServiceError::HandlerOutsideContext {
        service: service.to_owned(),
        handler: handler.display().to_string(),
        context: context_dir.to_path_buf(),
    };
    let relative = handler.strip_prefix(context_dir).map_err(|_| outside())?;
    let mut parts = Vec::new();
    for part in relative.components() {
        match part {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(outside()),
        }
    }
    if parts.is_empty() {
        return Err(outside());
    }
    Ok(parts.join("/"))
}

/// Every service declared in a loaded project file, in declaration order.
pub fn services_from_config(loaded: &LoadedAppConfig) -> Result<Vec<ServiceSpec>, ServiceError> {
    let root = loaded.project_root();
    loaded
        .config
        .services
        .iter()
        .map(|(name, service)| ServiceSpec::from_config(&root, name, service))
        .collect()
}

/// Image tag for `service` in `project`.
pub fn image_tag(project: &str, service: &str) -> String {
    format!("{project}-{service}")
}

/// Whether `name` is lowercase alphanumeric runs separated by single `.`, `_` or `-`.
pub fn is_valid_service_name(name: &str) -> bool {
    let mut previous_was_separator = true;
    for ch in name.chars() {
        match ch {
            'a'..='z' | '0'..='9' => previous_was_separator = false,
            '.' | '_' | '-' if !previous_was_separator => previous_was_separator = true,
            _ => return false,
        }
    }
    !name.is_empty() && !previous_was_separator
}

/// Descriptor and ignore file written into a build context. Both files are
/// removed when the value is dropped.
#[derive(Debug)]
pub struct BuildDescriptor {
    dockerfile: PathBuf,
    ignore_file: PathBuf,
}

impl BuildDescriptor {
    /// Write the descriptor for `spec` and its ignore list.
    pub async fn write(spec: &ServiceSpec, ignore: &[String]) -> Result<Self, ServiceError> {
        let dockerfile = spec.context_dir.join(spec.descriptor_name());
        let ignore_file = spec
            .context_dir
            .join(format!("{}.dockerignore", spec.descriptor_name()));
        let contents = spec.runtime.dockerfile(&spec.name).await?;

        // The guard exists before the first write so a partial write is cleaned up.
        let descriptor = Self {
            dockerfile,
            ignore_file,
        };
        let mut patterns = ignore.join("\n");
        patterns.push('\n');
        for (path, body) in [
            (&descriptor.dockerfile, contents),
            (&descriptor.ignore_file, patterns),
        ] {
            tokio::fs::write(path, body)
                .await
                .map_err(|source| ServiceError::Descriptor {
                    service: spec.name.clone(),
                    path: path.clone(),
                    source,
                })?;
        }
        debug!(service = %spec.name, path = %descriptor.dockerfile.display(), "build descriptor written");
        Ok(descriptor)
    }

    /// Path of the descriptor.
    pub fn path(&self) -> &Path {
        &self.dockerfile
    }

    /// Path of the descriptor-scoped ignore file.
    pub fn ignore_path(&self) -> &Path {
        &self.ignore_file
    }
}

impl Drop for BuildDescriptor {
    fn drop(&mut self) {
        for path in [&self.dockerfile, &self.ignore_file] {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove build descriptor");
                }
            }
        }
    }
}
