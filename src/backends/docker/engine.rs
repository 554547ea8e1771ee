//! Container engine seam for the docker backend, and its `docker` CLI client.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

use crate::backends::process::{collect_limited, run, run_unchecked, stream_stdout, ExecOutput};
use crate::kernel::{ContainerEnumerator, ContainerHandle};
use crate::types::{ContainerId, KernelId, Result};

/// Container label carrying the kernel id.
pub const KERNEL_ID_LABEL: &str = "ai.backend.kernel-id";

#[async_trait]
pub trait ContainerEngine: Send + Sync + fmt::Debug {
    /// Containers labelled with a kernel id, in any state.
    async fn list_kernel_containers(&self) -> Result<Vec<(KernelId, ContainerHandle)>>;

    /// Combined stdout and stderr logs.
    async fn logs(&self, container_id: &ContainerId) -> Result<String>;

    /// Snapshot the container; returns the new image id.
    async fn commit(
        &self,
        container_id: &ContainerId,
        changes: &[String],
        reference: Option<(&str, &str)>,
    ) -> Result<String>;

    /// Image tarball as a byte stream.
    async fn export_image(&self, image_id: &str) -> Result<BoxStream<'static, Result<Bytes>>>;

    async fn delete_image(&self, image_id: &str) -> Result<()>;

    /// Tar archive of `path` inside the container, refused beyond `limit` bytes.
    async fn get_archive(&self, container_id: &ContainerId, path: &str, limit: u64) -> Result<Bytes>;

    async fn exec(&self, container_id: &ContainerId, command: &[String]) -> Result<ExecOutput>;
}

/// Adapts an engine to the recovery loader's enumeration seam.
#[derive(Debug, Clone)]
pub struct EngineEnumerator {
    engine: Arc<dyn ContainerEngine>,
}

impl EngineEnumerator {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ContainerEnumerator for EngineEnumerator {
    async fn enumerate_containers(&self) -> Result<Vec<(KernelId, ContainerHandle)>> {
        self.engine.list_kernel_containers().await
    }
}

/// `docker` CLI client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn args<I, S>(parts: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        parts.into_iter().map(Into::into).collect()
    }
}

/// Parse `docker ps --format '{{.ID}}\t{{.Label ...}}\t{{.State}}'` output.
pub fn parse_ps_output(stdout: &str) -> Vec<(KernelId, ContainerHandle)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let container_id = ContainerId::from_string(fields.next()?.trim().to_string()).ok()?;
            let kernel_id = KernelId::from_string(fields.next()?.trim().to_string()).ok()?;
            let status = fields.next().unwrap_or("").trim().to_string();
            Some((kernel_id, ContainerHandle { container_id, status }))
        })
        .collect()
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn list_kernel_containers(&self) -> Result<Vec<(KernelId, ContainerHandle)>> {
        let format = format!("{{{{.ID}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.State}}}}", KERNEL_ID_LABEL);
        let args = Self::args([
            "ps".to_string(),
            "-a".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("label={}", KERNEL_ID_LABEL),
            "--format".to_string(),
            format,
        ]);
        let output = run(&self.binary, &args).await?;
        Ok(parse_ps_output(&output.stdout))
    }

    async fn logs(&self, container_id: &ContainerId) -> Result<String> {
        let output = run(&self.binary, &Self::args(["logs", container_id.as_str()])).await?;
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    async fn commit(
        &self,
        container_id: &ContainerId,
        changes: &[String],
        reference: Option<(&str, &str)>,
    ) -> Result<String> {
        let mut args = Self::args(["commit"]);
        for change in changes {
            args.push("--change".to_string());
            args.push(change.clone());
        }
        args.push(container_id.as_str().to_string());
        if let Some((repo, tag)) = reference {
            args.push(format!("{}:{}", repo, tag));
        }
        let output = run(&self.binary, &args).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn export_image(&self, image_id: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        stream_stdout(&self.binary, &Self::args(["save", image_id]))
    }

    async fn delete_image(&self, image_id: &str) -> Result<()> {
        run(&self.binary, &Self::args(["rmi", image_id])).await?;
        Ok(())
    }

    async fn get_archive(&self, container_id: &ContainerId, path: &str, limit: u64) -> Result<Bytes> {
        let source = format!("{}:{}", container_id, path);
        let stream = stream_stdout(&self.binary, &Self::args(["cp".to_string(), source, "-".to_string()]))?;
        collect_limited(stream, limit).await
    }

    async fn exec(&self, container_id: &ContainerId, command: &[String]) -> Result<ExecOutput> {
        let mut args = Self::args(["exec", container_id.as_str()]);
        args.extend(command.iter().cloned());
        run_unchecked(&self.binary, &args).await
    }
}
