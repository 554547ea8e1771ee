//! Container-engine-backed kernels.
//!
//! The backing container is provisioned by the creation pipeline before the
//! kernel object exists; this type attaches to it. Host file writes go
//! straight to the kernel's scratch work directory, which is bind-mounted
//! as the container's home directory.

pub mod engine;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;

use super::{write_into_work_dir, BackendContext, LIST_FILES_SCRIPT};
use crate::events::KernelEvent;
use crate::kernel::{
    AbstractKernel, BackendType, ClientFeatures, CodeRunner, CommitOptions, CommitOutcome,
    CommitStatus, DomainSocketProxyDescriptor, KernelBase, KernelCreationSpec,
    KernelRecoveryData, KernelState, OpResult,
};
use crate::proxy::DomainSocketProxy;
use crate::types::{ContainerId, Error, KernelId, Result};
use crate::validation::confine_container_path;

pub use engine::{ContainerEngine, DockerCli, EngineEnumerator, KERNEL_ID_LABEL};

/// Image chunks buffered between the engine stream and the gzip writer.
const INFLIGHT_CHUNKS: usize = 8;

#[derive(Debug)]
pub struct DockerKernel {
    base: KernelBase,
    ctx: BackendContext,
    engine: Arc<dyn ContainerEngine>,
    proxy_descriptors: Vec<DomainSocketProxyDescriptor>,
    proxies: Mutex<Vec<DomainSocketProxy>>,
}

impl DockerKernel {
    /// Attach to a provisioned container and start its domain socket proxies.
    pub async fn create(
        mut spec: KernelCreationSpec,
        ctx: BackendContext,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self> {
        if spec.kernel_host.is_empty() {
            spec.kernel_host = ctx.config.container.kernel_host.clone();
        }
        let mut proxies = Vec::with_capacity(spec.domain_socket_paths.len());
        for upstream in &spec.domain_socket_paths {
            match DomainSocketProxy::start(upstream, &ctx.config.agent.ipc_base_path, &ctx.config.proxy).await {
                Ok(proxy) => proxies.push(proxy),
                Err(e) => {
                    for proxy in proxies.iter_mut() {
                        proxy.close().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::assemble(spec, KernelState::Created, ctx, engine, proxies))
    }

    /// Rebuild from a recovery snapshot, re-binding proxies at their
    /// recorded paths.
    pub async fn restore(
        data: KernelRecoveryData,
        ctx: BackendContext,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self> {
        if data.backend != BackendType::Docker {
            return Err(Error::validation(format!(
                "cannot restore a {} kernel as docker",
                data.backend.as_str()
            )));
        }
        if data.state.is_closing() {
            return Err(Error::state_transition(format!(
                "kernel {} was {:?} when saved",
                data.kernel_id(),
                data.state
            )));
        }
        let mut proxies = Vec::with_capacity(data.domain_socket_proxies.len());
        for descriptor in &data.domain_socket_proxies {
            match DomainSocketProxy::bind(descriptor.clone(), &ctx.config.proxy).await {
                Ok(proxy) => proxies.push(proxy),
                Err(e) => {
                    for proxy in proxies.iter_mut() {
                        proxy.close().await;
                    }
                    return Err(e);
                }
            }
        }
        // The saved state describes the container, not the channel: a
        // restored kernel stays READY/SERVING without a runner until init().
        let state = data.state;
        Ok(Self::assemble(data.creation_spec(), state, ctx, engine, proxies))
    }

    fn assemble(
        spec: KernelCreationSpec,
        state: KernelState,
        ctx: BackendContext,
        engine: Arc<dyn ContainerEngine>,
        proxies: Vec<DomainSocketProxy>,
    ) -> Self {
        let proxy_descriptors = proxies.iter().map(DomainSocketProxy::descriptor).collect();
        Self {
            base: KernelBase::new(spec, BackendType::Docker, state, ctx.events.clone()),
            ctx,
            engine,
            proxy_descriptors,
            proxies: Mutex::new(proxies),
        }
    }

    pub fn proxy_descriptors(&self) -> &[DomainSocketProxyDescriptor] {
        &self.proxy_descriptors
    }

    fn container_id(&self) -> Result<&ContainerId> {
        self.base
            .spec()
            .container_id
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("kernel {} has no container", self.base.kernel_id())))
    }

    fn home_dir(&self) -> &str {
        &self.ctx.config.container.home_dir
    }

    /// `(<commit_path>/<subdir>, <commit_path>/<subdir>/lock/<kernel_id>)`
    fn commit_paths(&self, kernel_id: &KernelId, subdir: &str) -> Result<(PathBuf, PathBuf)> {
        let root = &self.ctx.config.agent.image_commit_path;
        let commit_path = lexical_join(root, subdir)?;
        let lock_path = lexical_join(&commit_path.join("lock"), kernel_id.as_str())?;
        Ok((commit_path, lock_path))
    }

    async fn snapshot(
        &self,
        container_id: &ContainerId,
        commit_path: &Path,
        opts: &CommitOptions,
    ) -> Result<String> {
        let changes: Vec<String> = opts
            .extra_labels
            .iter()
            .map(|(name, value)| format!("LABEL {}={}", name, value))
            .collect();
        let reference = opts.canonical.as_deref().map(|canonical| {
            canonical
                .rsplit_once(':')
                .filter(|(_, tag)| !tag.contains('/'))
                .unwrap_or((canonical, "latest"))
        });
        if let Some((repo, tag)) = reference {
            tracing::debug!("commit_tagging: repo={} tag={}", repo, tag);
        }
        let image_id = self.engine.commit(container_id, &changes, reference).await?;

        if let Some(filename) = &opts.filename {
            let target = lexical_join(commit_path, filename)?;
            let exported = self.export_gzip(&image_id, target).await;
            let deleted = self.engine.delete_image(&image_id).await;
            exported?;
            deleted?;
        }
        Ok(image_id)
    }

    /// Stream the image into a gzip file on a blocking writer thread.
    async fn export_gzip(&self, image_id: &str, target: PathBuf) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(INFLIGHT_CHUNKS);
        let writer = tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::create(&target)?;
            let mut gz = GzEncoder::new(file, Compression::default());
            while let Some(chunk) = rx.blocking_recv() {
                gz.write_all(&chunk)?;
            }
            gz.finish()?.sync_all()?;
            Ok(())
        });

        let pumped = async {
            let mut stream = self.engine.export_image(image_id).await?;
            while let Some(chunk) = stream.next().await {
                if tx.send(chunk?).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        }
        .await;
        drop(tx);

        let written = writer
            .await
            .map_err(|e| Error::internal(format!("export writer failed: {}", e)))?;
        written?;
        pumped
    }
}

/// Join a relative path under `root` without touching the filesystem.
fn lexical_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    if escapes {
        return Err(Error::permission_denied(format!(
            "malformed committed path: {}",
            relative.display()
        )));
    }
    Ok(root.join(relative))
}

/// Extract the only member of a tar archive.
fn single_member(archive: &[u8], source: &str) -> Result<Bytes> {
    let mut tar = tar::Archive::new(archive);
    let mut content = None;
    let mut names = 0usize;
    for entry in tar.entries()? {
        let mut entry = entry?;
        names += 1;
        if names > 1 {
            return Err(Error::validation(format!(
                "expected a single-file archive but found multiple files from {}",
                source
            )));
        }
        if !entry.header().entry_type().is_file() {
            return Err(Error::validation(format!("{} is not a regular file", source)));
        }
        // The header size is untrusted; never reserve more than the archive holds.
        let mut buf = Vec::with_capacity(entry.size().min(archive.len() as u64) as usize);
        entry.read_to_end(&mut buf)?;
        content = Some(Bytes::from(buf));
    }
    content.ok_or_else(|| Error::not_found(format!("empty archive for {}", source)))
}

#[async_trait]
impl AbstractKernel for DockerKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    async fn create_code_runner(
        &self,
        client_features: ClientFeatures,
        api_version: u32,
    ) -> Result<Arc<CodeRunner>> {
        self.base.ensure_open("create_code_runner")?;
        let runner = Arc::new(CodeRunner::new(
            self.base.kernel_id().clone(),
            self.base.repl_endpoint(),
            0.0,
            client_features,
            api_version,
        )?);
        runner
            .connect(self.ctx.transport.as_ref())
            .instrument(self.base.span().clone())
            .await?;
        Ok(runner)
    }

    async fn get_logs(&self) -> Result<OpResult> {
        self.base.ensure_open("get_logs")?;
        let container_id = self.container_id()?;
        let logs = self.engine.logs(container_id).await;
        OpResult::settle(logs.map(|logs| json!({ "logs": logs })))
    }

    async fn check_duplicate_commit(&self, kernel_id: &KernelId, subdir: &str) -> Result<CommitStatus> {
        let (_, lock_path) = self.commit_paths(kernel_id, subdir)?;
        let locked = tokio::fs::try_exists(&lock_path).await?;
        if self.base.commit_flag().is_ongoing() || locked {
            return Ok(CommitStatus::Ongoing);
        }
        Ok(CommitStatus::Ready)
    }

    async fn commit(&self, kernel_id: &KernelId, subdir: &str, opts: CommitOptions) -> Result<CommitOutcome> {
        self.base.ensure_open("commit")?;
        let container_id = self.container_id()?.clone();
        let (commit_path, lock_path) = self.commit_paths(kernel_id, subdir)?;

        let Some(_guard) = self.base.commit_flag().try_begin() else {
            tracing::warn!("commit_already_ongoing: kernel_id={}", kernel_id);
            return Ok(CommitOutcome::AlreadyOngoing);
        };

        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(&commit_path).await?;
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::warn!("commit_lock_held: kernel_id={} lock={}", kernel_id, lock_path.display());
                return Ok(CommitOutcome::AlreadyOngoing);
            }
            Err(e) => return Err(e.into()),
        }

        self.base
            .publish(KernelEvent::CommitStarted {
                kernel_id: kernel_id.clone(),
                subdir: subdir.to_string(),
            })
            .await;
        tracing::info!("commit_started: kernel_id={} container_id={}", kernel_id, container_id);

        let result = self
            .snapshot(&container_id, &commit_path, &opts)
            .instrument(self.base.span().clone())
            .await;

        if let Err(e) = tokio::fs::remove_file(&lock_path).await {
            tracing::warn!("commit_unlock_failed: lock={} error={}", lock_path.display(), e);
        }
        self.base
            .publish(KernelEvent::CommitFinished {
                kernel_id: kernel_id.clone(),
                subdir: subdir.to_string(),
                success: result.is_ok(),
            })
            .await;

        let image_id = result?;
        tracing::info!("commit_finished: kernel_id={} image_id={}", kernel_id, image_id);
        Ok(CommitOutcome::Committed { image_id })
    }

    async fn accept_file(&self, container_path: &str, data: Bytes) -> Result<()> {
        self.base.ensure_open("accept_file")?;
        write_into_work_dir(&self.ctx.config, self.base.kernel_id(), container_path, data).await
    }

    async fn download_file(&self, container_path: &str) -> Result<Bytes> {
        self.base.ensure_open("download_file")?;
        let resolved = confine_container_path(self.home_dir(), container_path)?;
        let container_id = self.container_id()?;
        self.engine
            .get_archive(container_id, &resolved, self.ctx.config.limits.max_download_bytes)
            .await
    }

    async fn download_single(&self, container_path: &str) -> Result<Bytes> {
        let archive = self.download_file(container_path).await?;
        let source = container_path.to_string();
        tokio::task::spawn_blocking(move || single_member(&archive, &source))
            .await
            .map_err(|e| Error::internal(format!("archive task failed: {}", e)))?
    }

    async fn list_files(&self, container_path: &str) -> Result<Value> {
        self.base.ensure_open("list_files")?;
        let resolved = confine_container_path(self.home_dir(), container_path)?;
        let container_id = self.container_id()?;
        let command = vec![
            self.ctx.config.container.helper_python.clone(),
            "-c".to_string(),
            LIST_FILES_SCRIPT.to_string(),
            resolved,
        ];
        let output = self.engine.exec(container_id, &command).await?;
        Ok(json!({
            "files": output.stdout,
            "errors": output.stderr,
            "abspath": container_path,
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.base.lifecycle().begin_close() {
            return Ok(());
        }
        async {
            self.base.close_runner().await;
            let mut proxies = self.proxies.lock().await;
            for proxy in proxies.iter_mut() {
                proxy.close().await;
            }
            proxies.clear();
        }
        .instrument(self.base.span().clone())
        .await;
        self.base.lifecycle().finish_close();
        self.base
            .publish(KernelEvent::Closed {
                kernel_id: self.base.kernel_id().clone(),
            })
            .await;
        tracing::info!("kernel_closed: kernel_id={}", self.base.kernel_id());
        Ok(())
    }

    fn recovery_data(&self) -> Option<KernelRecoveryData> {
        let spec = self.base.spec();
        Some(KernelRecoveryData {
            backend: BackendType::Docker,
            identity: spec.identity.clone(),
            ownership: spec.ownership.clone(),
            cluster_info: spec.cluster_info.clone(),
            network_id: spec.network_id.clone(),
            network_driver: spec.network_driver.clone(),
            container_id: spec.container_id.clone(),
            session_type: spec.session_type,
            state: self.base.state(),
            block_service_ports: spec.block_service_ports,
            prevent_vfolder_mount: spec.prevent_vfolder_mount,
            domain_socket_proxies: self.proxy_descriptors.clone(),
            service_ports: spec.service_ports.clone(),
            kernel_host: spec.kernel_host.clone(),
            repl_in_port: spec.repl_in_port,
            repl_out_port: spec.repl_out_port,
            resource_spec: spec.resource_spec.clone(),
            environ: spec.environ.clone(),
        })
    }
}
