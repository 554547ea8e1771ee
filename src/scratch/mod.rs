//! Per-kernel scratch store.
//!
//! Layout under the scratch root:
//!
//! ```text
//! <scratch_root>/<kernel_id>/config/recovery.json   KernelRecoveryScratchData
//! <scratch_root>/<kernel_id>/config/environ.txt     KEY=VALUE per line
//! <scratch_root>/<kernel_id>/config/resource.txt    KernelResourceSpec text form
//! <scratch_root>/<kernel_id>/work/                  host side of the home dir
//! ```
//!
//! `environ.txt` and `resource.txt` are written once by provisioning and are
//! required afterwards; `recovery.json` is optional and rewritten by the
//! registry writer.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::kernel::{KernelRecoveryScratchData, KernelResourceSpec};
use crate::types::{Error, KernelId, Result};

pub const CONFIG_DIR: &str = "config";
pub const WORK_DIR: &str = "work";
pub const RECOVERY_FILE: &str = "recovery.json";
pub const ENVIRON_FILE: &str = "environ.txt";
pub const RESOURCE_FILE: &str = "resource.txt";

/// Parse `environ.txt`. Lines without `=` are ignored; values may contain `=`.
pub fn parse_environ(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Render `environ.txt`.
pub fn render_environ(environ: &BTreeMap<String, String>) -> String {
    environ
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<scratch_root>/<kernel_id>`. Rejects ids that are not a single path segment.
    pub fn kernel_dir(&self, kernel_id: &KernelId) -> Result<PathBuf> {
        let id = kernel_id.as_str();
        if id == "." || id == ".." || id.contains('/') || id.contains('\\') {
            return Err(Error::validation(format!("kernel id is not a path segment: {}", id)));
        }
        Ok(self.root.join(id))
    }

    pub fn config_dir(&self, kernel_id: &KernelId) -> Result<PathBuf> {
        Ok(self.kernel_dir(kernel_id)?.join(CONFIG_DIR))
    }

    pub fn work_dir(&self, kernel_id: &KernelId) -> Result<PathBuf> {
        Ok(self.kernel_dir(kernel_id)?.join(WORK_DIR))
    }

    /// Whether the kernel has a scratch config directory at all.
    pub async fn has_config_dir(&self, kernel_id: &KernelId) -> bool {
        match self.config_dir(kernel_id) {
            Ok(dir) => tokio::fs::metadata(&dir)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Write `environ.txt` and `resource.txt` and create the work dir.
    ///
    /// Called once by the provisioning step at kernel creation.
    pub async fn provision(
        &self,
        kernel_id: &KernelId,
        resource_spec: &KernelResourceSpec,
        environ: &BTreeMap<String, String>,
    ) -> Result<()> {
        let config_dir = self.config_dir(kernel_id)?;
        tokio::fs::create_dir_all(&config_dir).await?;
        tokio::fs::create_dir_all(self.work_dir(kernel_id)?).await?;
        write_atomic(&config_dir.join(ENVIRON_FILE), render_environ(environ).as_bytes()).await?;
        write_atomic(
            &config_dir.join(RESOURCE_FILE),
            resource_spec.write_to_string()?.as_bytes(),
        )
        .await?;
        tracing::debug!("scratch_provisioned: kernel_id={}", kernel_id);
        Ok(())
    }

    pub async fn write_recovery(&self, data: &KernelRecoveryScratchData) -> Result<()> {
        let config_dir = self.config_dir(&data.identity.kernel_id)?;
        tokio::fs::create_dir_all(&config_dir).await?;
        let body = serde_json::to_vec_pretty(data)?;
        write_atomic(&config_dir.join(RECOVERY_FILE), &body).await
    }

    /// Read `recovery.json`. A missing file is `Ok(None)`; malformed JSON is an error.
    pub async fn read_recovery(&self, kernel_id: &KernelId) -> Result<Option<KernelRecoveryScratchData>> {
        let path = self.config_dir(kernel_id)?.join(RECOVERY_FILE);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&body)?))
    }

    pub async fn remove_recovery(&self, kernel_id: &KernelId) -> Result<()> {
        let path = self.config_dir(kernel_id)?.join(RECOVERY_FILE);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_environ(&self, kernel_id: &KernelId) -> Result<BTreeMap<String, String>> {
        let text = self.read_required(kernel_id, ENVIRON_FILE).await?;
        Ok(parse_environ(&text))
    }

    pub async fn read_resource_spec(&self, kernel_id: &KernelId) -> Result<KernelResourceSpec> {
        let text = self.read_required(kernel_id, RESOURCE_FILE).await?;
        KernelResourceSpec::read_from_string(&text)
    }

    /// Remove the whole `<scratch_root>/<kernel_id>` tree.
    pub async fn remove_kernel(&self, kernel_id: &KernelId) -> Result<()> {
        let dir = self.kernel_dir(kernel_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_required(&self, kernel_id: &KernelId, file: &str) -> Result<String> {
        let path = self.config_dir(kernel_id)?.join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(format!(
                "{} for kernel {} ({})",
                file,
                kernel_id,
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write through a sibling temp file and rename, so readers never see a torn file.
async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
