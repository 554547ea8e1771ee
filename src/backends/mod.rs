//! Backend kernel implementations and the wiring shared between them.

pub mod docker;
pub mod dummy;
pub mod kubernetes;
pub mod process;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

use crate::events::EventProducer;
use crate::kernel::{BackendType, KernelHandle, KernelRecoveryData, KernelRestorer};
use crate::repl::ReplTransport;
use crate::types::{Config, Error, KernelId, Result};
use crate::validation::{confine_container_path, confine_host_path, container_relpath};

pub use docker::{ContainerEngine, DockerCli, DockerKernel, EngineEnumerator};
pub use dummy::DummyKernel;
pub use kubernetes::{KubectlOrchestrator, KubernetesKernel, OrchestratorApi};

/// Directory listing helper run inside the container with its bundled
/// interpreter. Prints a JSON array of
/// `{mode, size, ctime, mtime, atime, filename}`.
pub const LIST_FILES_SCRIPT: &str = r#"import json
import os
import stat
import sys

files = []
for f in os.scandir(sys.argv[1]):
    fstat = f.stat(follow_symlinks=False)
    files.append({
        'mode': stat.filemode(fstat.st_mode),
        'size': fstat.st_size,
        'ctime': fstat.st_ctime,
        'mtime': fstat.st_mtime,
        'atime': fstat.st_atime,
        'filename': f.name,
    })
print(json.dumps(files))
"#;

/// Confine `container_path` to the in-container home directory and write
/// `data` to the matching path under the kernel's host scratch work dir on
/// a blocking thread.
pub(crate) async fn write_into_work_dir(
    config: &Config,
    kernel_id: &KernelId,
    container_path: &str,
    data: Bytes,
) -> Result<()> {
    let home = &config.container.home_dir;
    let resolved = confine_container_path(home, container_path)?;
    let relative = PathBuf::from(container_relpath(home, &resolved));
    let work_dir = config
        .container
        .scratch_root
        .join(kernel_id.as_str())
        .join(crate::scratch::WORK_DIR);
    let kernel_id = kernel_id.clone();
    let shown = container_path.to_string();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let host_path = confine_host_path(&work_dir, &relative)?;
        let write = || -> std::io::Result<()> {
            if let Some(parent) = host_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&host_path, &data)
        };
        write().map_err(|e| {
            Error::internal(format!(
                "{}: writing uploaded file failed: {} -> {} ({})",
                kernel_id,
                shown,
                host_path.display(),
                e
            ))
        })
    })
    .await
    .map_err(|e| Error::internal(format!("upload task failed: {}", e)))?
}

/// Collaborators every backend kernel needs.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub config: Arc<Config>,
    pub transport: Arc<dyn ReplTransport>,
    pub events: Arc<dyn EventProducer>,
}

impl BackendContext {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn ReplTransport>,
        events: Arc<dyn EventProducer>,
    ) -> Self {
        Self {
            config,
            transport,
            events,
        }
    }
}

/// Restores recovered kernels through the container engine. Only the
/// docker backend persists recovery snapshots.
#[derive(Debug, Clone)]
pub struct BackendRestorer {
    ctx: BackendContext,
    engine: Arc<dyn ContainerEngine>,
}

impl BackendRestorer {
    pub fn new(ctx: BackendContext, engine: Arc<dyn ContainerEngine>) -> Self {
        Self { ctx, engine }
    }
}

#[async_trait]
impl KernelRestorer for BackendRestorer {
    async fn restore(&self, data: KernelRecoveryData) -> Result<KernelHandle> {
        match data.backend {
            BackendType::Docker => {
                let kernel = DockerKernel::restore(data, self.ctx.clone(), self.engine.clone()).await?;
                Ok(Arc::new(kernel))
            }
            other => Err(Error::not_implemented(format!(
                "recovery of {} kernels",
                other.as_str()
            ))),
        }
    }
}
