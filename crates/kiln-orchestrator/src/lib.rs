//! ---
//! kiln_section: "04-orchestration"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Service definitions, lifecycle manager and build/run orchestrators."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
//! Orchestration layer of Kiln.
//!
//! [`BuildOrchestrator`] builds every service image through a bounded
//! [`kiln_rt::JobScheduler`]; [`RunOrchestrator`] starts one
//! [`ServiceProcess`] per service, streams [`UpdateEvent`]s and fans a stop
//! out to every service when its [`StopSignal`] fires.
#![warn(missing_docs)]

pub mod buffer;
pub mod build;
pub mod env;
pub mod lifecycle;
pub mod run;
pub mod service;
pub mod signal;

pub use build::{
    default_build_concurrency, BuildError, BuildOrchestrator, BuildSettings, ServiceFailure,
};
pub use lifecycle::{LifecycleError, ServiceProcess, ServiceStatus, UpdateEvent};
pub use run::{RunOrchestrator, RunReport, RunSettings};
pub use service::{
    image_tag, is_valid_service_name, services_from_config, Runtime, ServiceError, ServiceSpec,
};
pub use signal::StopSignal;
