//! ---
//! kiln_section: "01-core-functionality"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Shared configuration and logging for the Kiln workspace."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
//! Shared primitives for the Kiln workspace: project file loading and
//! tracing initialisation.

pub mod config;
pub mod logging;

pub use config::{
    resolve_concurrency_override, AppConfig, BuildConfig, ConfigError, LoadedAppConfig,
    LoggingConfig, RunConfig, ServiceConfig, ENV_MAX_BUILD_CONCURRENCY,
};
pub use logging::{init_tracing, LogFormat};
