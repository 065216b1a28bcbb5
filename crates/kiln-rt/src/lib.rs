//! ---
//! kiln_section: "01-core-functionality"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Concurrency primitives shared by the build and run pipelines."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Job scheduling and log fan-in for the Kiln runtime.

pub mod multiplexer;
pub mod scheduler;

pub use multiplexer::{LogMessage, LogMultiplexer, LogSources, LogWriter, MultiplexerError};
pub use scheduler::{JobFailure, JobId, JobOutcome, JobResults, JobScheduler, SchedulerError};
