//! ---
//! kiln_section: "01-core-functionality"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Project file model and loader."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use tracing::{debug, warn};

use crate::logging::LogFormat;

/// Environment variable overriding the build concurrency ceiling.
pub const ENV_MAX_BUILD_CONCURRENCY: &str = "MAX_BUILD_CONCURRENCY";

fn default_network() -> String {
    "kiln-dev".to_owned()
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_update_buffer() -> usize {
    64
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Structural problems detected in a project file or the environment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {origin} must be int got '{value}'")]
    InvalidConcurrency { origin: &'static str, value: String },
    #[error("project name must not be empty")]
    MissingName,
    #[error("project must declare at least one service")]
    NoServices,
    #[error("service '{0}' has an empty handler")]
    EmptyHandler(String),
    #[error("run.update_buffer must be greater than zero")]
    ZeroUpdateBuffer,
}

/// Project file (`kiln.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl LoadedAppConfig {
    /// Directory relative paths in the project file are resolved against.
    pub fn project_root(&self) -> PathBuf {
        match self.source.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "KILN_CONFIG";

    /// Load configuration from disk, respecting the `KILN_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no project file found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading project file");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read project file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid project file {}", path.display()))
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    /// Validate structural invariants. Service names are checked by the build
    /// orchestrator so that every invalid name is reported at once.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        for (name, service) in &self.services {
            if service.handler.as_os_str().is_empty() {
                return Err(ConfigError::EmptyHandler(name.clone()));
            }
        }
        if self.run.update_buffer == 0 {
            return Err(ConfigError::ZeroUpdateBuffer);
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse project file")?;
        config.validate()?;
        Ok(config)
    }
}

/// One service entry under `[services.<name>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Entrypoint, relative to the project root.
    pub handler: PathBuf,
    /// Custom Dockerfile replacing the runtime inferred from the handler.
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    /// Build context; defaults to the project root and must contain the handler.
    #[serde(default)]
    pub context: Option<PathBuf>,
    /// Extra environment passed to the running container.
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Concurrency ceiling; a value below one falls back to the default.
    #[serde(default)]
    pub max_concurrency: Option<i64>,
}

impl BuildConfig {
    /// Effective override, with `MAX_BUILD_CONCURRENCY` taking precedence
    /// over `build.max_concurrency`.
    pub fn concurrency_override(&self) -> std::result::Result<Option<usize>, ConfigError> {
        let env_value = std::env::var(ENV_MAX_BUILD_CONCURRENCY).ok();
        resolve_concurrency_override(env_value.as_deref(), self.max_concurrency)
    }
}

/// Resolve a concurrency override from a raw environment value and the
/// configured value. Non-integers are errors; values below one are ignored.
pub fn resolve_concurrency_override(
    env_value: Option<&str>,
    configured: Option<i64>,
) -> std::result::Result<Option<usize>, ConfigError> {
    if let Some(raw) = env_value.map(str::trim).filter(|raw| !raw.is_empty()) {
        let value: i64 = raw
            .parse()
            .map_err(|_| ConfigError::InvalidConcurrency {
                origin: ENV_MAX_BUILD_CONCURRENCY,
                value: raw.to_owned(),
            })?;
        return Ok(positive(value, ENV_MAX_BUILD_CONCURRENCY));
    }
    Ok(configured.and_then(|value| positive(value, "build.max_concurrency")))
}

fn positive(value: i64, origin: &'static str) -> Option<usize> {
    if value < 1 {
        warn!(origin, value, "ignoring non-positive build concurrency");
        return None;
    }
    usize::try_from(value).ok()
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_stop_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stop_timeout: Duration,
    #[serde(default = "default_update_buffer")]
    pub update_buffer: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            stop_timeout: default_stop_timeout(),
            update_buffer: default_update_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily-rolling JSON log files; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
name = "shop"

[services.orders]
handler = "services/orders.ts"

[services.billing]
handler = "services/billing.py"
env = { STRIPE_MODE = "test" }

[build]
max_concurrency = 2

[run]
stop_timeout = 3
"#;

    #[test]
    fn parses_project_with_defaults() {
        let config: AppConfig = PROJECT.parse().expect("valid project");
        assert_eq!(config.name, "shop");
        let names: Vec<&str> = config.services.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["orders", "billing"]);
        assert_eq!(config.build.max_concurrency, Some(2));
        assert_eq!(config.run.stop_timeout, Duration::from_secs(3));
        assert_eq!(config.run.network, "kiln-dev");
        assert_eq!(config.run.update_buffer, 64);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(
            config.service("billing").map(|s| s.env.get("STRIPE_MODE").cloned()),
            Some(Some("test".to_owned()))
        );
    }

    #[test]
    fn rejects_project_without_services() {
        let err = "name = \"empty\"".parse::<AppConfig>().expect_err("no services");
        assert!(err.chain().any(|cause| cause.to_string().contains("at least one service")));
    }

    #[test]
    fn env_override_wins_and_must_be_integer() {
        assert_eq!(resolve_concurrency_override(Some("4"), Some(2)), Ok(Some(4)));
        assert_eq!(resolve_concurrency_override(None, Some(2)), Ok(Some(2)));
        assert_eq!(resolve_concurrency_override(Some(" "), None), Ok(None));
        assert_eq!(
            resolve_concurrency_override(Some("lots"), Some(2)),
            Err(ConfigError::InvalidConcurrency {
                origin: ENV_MAX_BUILD_CONCURRENCY,
                value: "lots".into()
            })
        );
    }

    #[test]
    fn non_positive_override_falls_back_to_default() {
        assert_eq!(resolve_concurrency_override(Some("0"), Some(3)), Ok(None));
        assert_eq!(resolve_concurrency_override(None, Some(-1)), Ok(None));
    }
}
