//! ---
//! kiln_section: "02-container-engine"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Docker command line adapter."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::ffi::OsString;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kiln_rt::LogWriter;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    BuildRequest, ContainerEngine, ContainerHandle, ContainerSpec, EngineError, OutputStream,
    Result,
};

/// [`ContainerEngine`] backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: OsString,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Use `docker` from `PATH`.
    pub fn new() -> Self {
        Self {
            binary: OsString::from("docker"),
        }
    }

    /// Use an explicit client binary (e.g. `podman`).
    pub fn with_binary(binary: impl Into<OsString>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        debug!(args = ?args, "invoking docker");
        let output = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }

    async fn container_op(
        &self,
        operation: &'static str,
        container: &str,
        args: Vec<String>,
    ) -> Result<String> {
        let output = self.output(&args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned());
        }
        let message = failure_message(&output);
        if message.contains("No such container") {
            return Err(EngineError::NotFound(container.to_owned()));
        }
        Err(EngineError::Container {
            operation,
            container: container.to_owned(),
            message,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(&self, request: &BuildRequest, logs: &LogWriter) -> Result<()> {
        info!(tag = %request.tag, dockerfile = %request.dockerfile.display(), "building image");
        let mut child = self
            .command()
            .args(build_args(request))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut lines = match (stdout, stderr) {
            (Some(out), Some(err)) => stream::select(line_stream(out), line_stream(err)).boxed(),
            _ => stream::empty().boxed(),
        };

        let mut last_error: Option<String> = None;
        let mut last_line: Option<String> = None;
        while let Some(line) = lines.next().await {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if is_error_line(&line) {
                last_error = Some(line.trim().to_owned());
            }
            last_line = Some(line.trim().to_owned());
            logs.write_line(&line).await?;
        }

        let status = child.wait().await?;
        if status.success() {
            debug!(tag = %request.tag, "image built");
            return Ok(());
        }
        let message = last_error
            .or(last_line)
            .unwrap_or_else(|| format!("docker build exited with {status}"));
        Err(EngineError::Build {
            tag: request.tag.clone(),
            message,
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let output = self.output(&create_args(spec)).await?;
        if !output.status.success() {
            return Err(EngineError::Container {
                operation: "create",
                container: spec.name.clone(),
                message: failure_message(&output),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if id.is_empty() {
            return Err(EngineError::Protocol {
                operation: "create",
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        debug!(container = %spec.name, id = %id, "container created");
        Ok(ContainerHandle::new(id, spec.name.clone()))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.container_op(
            "start",
            handle.name(),
            vec!["start".into(), handle.id().into()],
        )
        .await
        .map(|_| ())
    }

    async fn attach(&self, handle: &ContainerHandle) -> Result<OutputStream> {
        let mut child = self
            .command()
            .args(["logs", "--follow", handle.id()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let merged = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => stream::select(line_stream(out), line_stream(err)).boxed(),
            _ => stream::empty().boxed(),
        };
        // The follower process lives as long as the stream does.
        let output = stream::unfold((child, merged), |(child, mut merged)| async move {
            let item = merged.next().await?;
            let chunk = item
                .map(|mut line| {
                    line.push('\n');
                    Bytes::from(line)
                })
                .map_err(EngineError::from);
            Some((chunk, (child, merged)))
        });
        Ok(output.boxed())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64> {
        let raw = self
            .container_op("wait", handle.name(), vec!["wait".into(), handle.id().into()])
            .await?;
        raw.lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .ok_or(EngineError::Protocol {
                operation: "wait",
                output: raw,
            })
    }

    async fn stop(&self, handle: &ContainerHandle, timeout: Option<Duration>) -> Result<()> {
        let mut args = vec!["stop".to_owned()];
        if let Some(timeout) = timeout {
            args.push("-t".into());
            args.push(timeout.as_secs().to_string());
        }
        args.push(handle.id().to_owned());
        self.container_op("stop", handle.name(), args).await.map(|_| ())
    }

    async fn logs(&self, handle: &ContainerHandle, tail: usize) -> Result<Bytes> {
        let output = self
            .output(&[
                "logs".into(),
                "--tail".into(),
                tail.to_string(),
                handle.id().into(),
            ])
            .await?;
        if !output.status.success() {
            return Err(EngineError::Container {
                operation: "logs",
                container: handle.name().to_owned(),
                message: failure_message(&output),
            });
        }
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(Bytes::from(combined))
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.container_op(
            "remove",
            handle.name(),
            vec!["rm".into(), "--force".into(), handle.id().into()],
        )
        .await
        .map(|_| ())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        let inspect = self
            .output(&["network".into(), "inspect".into(), name.into()])
            .await?;
        if inspect.status.success() {
            debug!(network = %name, "network already present");
            return Ok(());
        }
        let create = self
            .output(&["network".into(), "create".into(), name.into()])
            .await?;
        if create.status.success() {
            info!(network = %name, "network created");
            return Ok(());
        }
        let message = failure_message(&create);
        if message.contains("already exists") {
            warn!(network = %name, "network appeared concurrently");
            return Ok(());
        }
        Err(EngineError::Network {
            name: name.to_owned(),
            message,
        })
    }
}

fn build_args(request: &BuildRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "build".into(),
        "--progress=plain".into(),
        "-f".into(),
        request.dockerfile.clone().into_os_string(),
        "-t".into(),
        request.tag.clone().into(),
    ];
    for (key, value) in &request.build_args {
        args.push("--build-arg".into());
        args.push(format!("{key}={value}").into());
    }
    args.push(request.context_dir.clone().into_os_string());
    args
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_owned(), "--name".to_owned(), spec.name.clone()];
    if let Some(network) = &spec.network {
        args.push("--network".into());
        args.push(network.clone());
        args.push("--network-alias".into());
        args.push(spec.name.clone());
    }
    if let Some(port) = spec.port {
        args.push("-p".into());
        args.push(format!("{port}:{port}"));
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args
}

fn is_error_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("ERROR") || trimmed.starts_with("error:") || trimmed.contains("failed to solve")
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_owned());
    message.unwrap_or_else(|| format!("exited with {}", output.status))
}

fn line_stream<R>(reader: R) -> BoxStream<'static, std::io::Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(BufReader::new(reader).lines()), |state| async move {
        let mut lines = state?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(lines))),
            Ok(None) => None,
            Err(err) => Some((Err(err), None)),
        }
    })
    .boxed()
}
