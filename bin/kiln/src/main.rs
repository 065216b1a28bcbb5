//! ---
//! kiln_section: "05-cli"
//! kiln_subsection: "binary"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Binary entrypoint for the Kiln CLI."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use kiln_common::{init_tracing, AppConfig};
use kiln_engine::{ContainerEngine, DockerCli, InMemoryEngine};
use kiln_orchestrator::{
    services_from_config, BuildOrchestrator, BuildSettings, RunOrchestrator, RunSettings,
    StopSignal, UpdateEvent,
};
use kiln_rt::LogMultiplexer;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    version = env!("CARGO_PKG_VERSION"),
    about = "Kiln local development orchestrator",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to the project file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[arg(
        long,
        global = true,
        help = "Use the in-memory engine instead of Docker"
    )]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    #[command(about = "Build every service image")]
    Build,
    #[command(about = "Build every service image, then run all services until Ctrl-C")]
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("Kiln {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("kiln.toml"));
    candidates.push(PathBuf::from(".kiln/kiln.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    init_tracing("kiln", &loaded.config.logging)?;
    info!(
        project = %loaded.config.name,
        source = %loaded.source.display(),
        services = loaded.config.services.len(),
        "project loaded"
    );

    let build_settings =
        BuildSettings::from_config(&loaded.config).context("invalid build configuration")?;
    let specs = services_from_config(&loaded).context("invalid service definition")?;

    let engine: Arc<dyn ContainerEngine> = if cli.dry_run {
        info!("dry run; containers are simulated in memory");
        Arc::new(InMemoryEngine::new())
    } else {
        Arc::new(DockerCli::new())
    };

    let (orchestrator, updates) =
        RunOrchestrator::new(engine, RunSettings::from_config(&loaded.config), specs);
    tokio::spawn(watch_ctrl_c(orchestrator.stop_signal()));
    let printer = tokio::spawn(print_updates(updates));

    build_images(&orchestrator, &BuildOrchestrator::new(build_settings)).await?;

    let command = cli.command.unwrap_or(Commands::Run);
    let failed = match command {
        Commands::Build => Vec::new(),
        Commands::Run => {
            let report = orchestrator.run().await?;
            report.failed().into_iter().map(str::to_owned).collect()
        }
    };

    drop(orchestrator);
    printer.await.context("update printer failed")?;

    if !failed.is_empty() {
        bail!("services failed: {}", failed.join(", "));
    }
    Ok(())
}

async fn build_images(orchestrator: &RunOrchestrator, builder: &BuildOrchestrator) -> Result<()> {
    let mut logs = LogMultiplexer::new();
    let sources = logs.sources()?;
    logs.seal();

    let printer = tokio::spawn(async move {
        while let Some(message) = logs.next().await {
            for line in message.text().lines() {
                println!("{} | {}", message.source_id, line);
            }
        }
    });

    let result = orchestrator.build(builder, Some(&sources)).await;
    drop(sources);
    printer.await.context("build log printer failed")?;
    result.context("image build failed")
}

async fn print_updates(mut updates: mpsc::Receiver<UpdateEvent>) {
    while let Some(event) = updates.recv().await {
        match &event.error {
            Some(error) => println!("{event} ({error})"),
            None => println!("{event}"),
        }
    }
}

async fn watch_ctrl_c(stop: StopSignal) {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("ctrl-c received; stopping services");
            stop.trigger();
        }
        Err(err) => warn!(error = %err, "unable to listen for ctrl-c"),
    }
}
