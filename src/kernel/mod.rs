//! Kernel contract shared by every backend.
//!
//! A kernel is the unit of user code execution backed by one container (or
//! orchestrator-managed pod). Backends implement `AbstractKernel`; the
//! operations common to REPL-backed kernels are provided as default methods
//! over `KernelBase`.
//!
//! Operational queries return an `OpResult` so one failed query never tears
//! the kernel down; `Err` is reserved for transport failures, path
//! confinement, unsupported capabilities and use after close.

pub mod base;
pub mod lifecycle;
pub mod recovery;
pub mod registry;
pub mod resources;
pub mod runner;
pub mod types;

use async_trait::async_trait;
use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::{Error, KernelId, Result};

pub use base::{CommitFlag, CommitGuard, KernelBase};
pub use lifecycle::{KernelLifecycle, KernelState};
pub use recovery::{
    ContainerEnumerator, ContainerHandle, KernelRegistryLoader, KernelRegistryWriter,
    KernelRestorer, RegistryPersistence, SaveMetadata, SaveReport,
};
pub use registry::{KernelHandle, KernelRegistry};
pub use resources::{DeviceShares, KernelResourceSpec, RESOURCE_SPEC_VERSION};
pub use runner::{ClientFeatures, CodeRunner, ReplEndpoint, DEFAULT_API_VERSION};
pub use types::{
    BackendType, ClusterInfo, ClusterMode, ClusterSshKeyPair, DomainSocketProxyDescriptor,
    ImageRef, KernelCreationSpec, KernelIdentity, KernelOwnershipData, KernelRecoveryData,
    KernelRecoveryScratchData, ServicePort, ServicePortProtocol, SessionType,
};

// =============================================================================
// Operation results
// =============================================================================

/// Payload of an operational query.
///
/// `Failed` serializes to `{"status": "failed", "error": "..."}`; `Ok`
/// serializes to the backend's payload unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum OpResult {
    Ok(Value),
    Failed(String),
}

impl OpResult {
    pub const OPERATION_BLOCKED: &'static str = "operation blocked";
    pub const INVALID_SERVICE_NAME: &'static str = "invalid service name";

    pub fn failed(error: impl Into<String>) -> Self {
        OpResult::Failed(error.into())
    }

    pub fn blocked() -> Self {
        OpResult::failed(Self::OPERATION_BLOCKED)
    }

    pub fn invalid_service_name() -> Self {
        OpResult::failed(Self::INVALID_SERVICE_NAME)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, OpResult::Failed(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            OpResult::Ok(value) => value.clone(),
            OpResult::Failed(error) => json!({"status": "failed", "error": error}),
        }
    }

    /// Fold an operation outcome into a payload. Transport failures and use
    /// after close stay errors; everything else becomes `Failed`.
    pub fn settle(outcome: Result<Value>) -> Result<Self> {
        match outcome {
            Ok(value) => Ok(OpResult::Ok(value)),
            Err(e @ (Error::StateTransition(_) | Error::Transport(_))) => Err(e),
            Err(e) => Ok(OpResult::failed(e.to_string())),
        }
    }
}

impl Serialize for OpResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            OpResult::Ok(value) => value.serialize(serializer),
            OpResult::Failed(error) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("status", "failed")?;
                map.serialize_entry("error", error)?;
                map.end()
            }
        }
    }
}

// =============================================================================
// Commit
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommitStatus {
    Ongoing,
    Ready,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOptions {
    /// `repo:tag` to apply to the snapshot; tag defaults to `latest`.
    #[serde(default)]
    pub canonical: Option<String>,
    /// Export the snapshot to `<commit_path>/<filename>` (gzip) and drop it from the engine.
    #[serde(default)]
    pub filename: Option<String>,
    /// Extra `LABEL` changes applied to the snapshot.
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { image_id: String },
    /// Another commit of this kernel is in flight; nothing was started.
    AlreadyOngoing,
}

// =============================================================================
// Kernel contract
// =============================================================================

#[async_trait]
pub trait AbstractKernel: Send + Sync + fmt::Debug {
    fn base(&self) -> &KernelBase;

    fn backend(&self) -> BackendType {
        self.base().backend()
    }

    fn kernel_id(&self) -> &KernelId {
        self.base().kernel_id()
    }

    fn state(&self) -> KernelState {
        self.base().state()
    }

    /// Establish the execution channel. Only valid once the backing
    /// container is running.
    async fn create_code_runner(
        &self,
        client_features: ClientFeatures,
        api_version: u32,
    ) -> Result<Arc<CodeRunner>>;

    /// Create the runner with default features and attach it.
    async fn init(&self) -> Result<()> {
        let runner = self
            .create_code_runner(ClientFeatures::default(), DEFAULT_API_VERSION)
            .await?;
        self.base().install_runner(runner).await
    }

    async fn check_status(&self) -> Result<OpResult> {
        let runner = self.base().runner("check_status").await?;
        OpResult::settle(runner.feed_and_get_status().await)
    }

    async fn get_completions(&self, text: &str, opts: Value) -> Result<OpResult> {
        self.base().get_completions(text, opts).await
    }

    async fn get_logs(&self) -> Result<OpResult>;

    async fn interrupt_kernel(&self) -> Result<OpResult> {
        self.base().interrupt_kernel().await
    }

    async fn start_service(&self, name: &str, opts: Value) -> Result<OpResult> {
        self.base().start_service(name, opts).await
    }

    async fn start_model_service(&self, model_spec: Value) -> Result<OpResult> {
        let base = self.base();
        let runner = base.runner("start_model_service").await?;
        let result = OpResult::settle(runner.feed_start_model_service(model_spec).await)?;
        if !result.is_failed() {
            base.lifecycle().mark_serving()?;
        }
        Ok(result)
    }

    async fn shutdown_service(&self, name: &str) -> Result<OpResult> {
        let runner = self.base().runner("shutdown_service").await?;
        OpResult::settle(runner.feed_shutdown_service(name).await)
    }

    async fn get_service_apps(&self) -> Result<OpResult> {
        let runner = self.base().runner("get_service_apps").await?;
        OpResult::settle(runner.feed_service_apps().await)
    }

    async fn check_duplicate_commit(&self, kernel_id: &KernelId, subdir: &str) -> Result<CommitStatus>;

    async fn commit(&self, kernel_id: &KernelId, subdir: &str, opts: CommitOptions) -> Result<CommitOutcome>;

    /// Store `data` at `container_path`, confined to the home directory.
    async fn accept_file(&self, container_path: &str, data: Bytes) -> Result<()>;

    /// Tar archive of `container_path`.
    async fn download_file(&self, container_path: &str) -> Result<Bytes>;

    /// Content of the single regular file at `container_path`.
    async fn download_single(&self, container_path: &str) -> Result<Bytes>;

    /// `{"files": <json text>, "errors": <text>, "abspath": <path>}`
    async fn list_files(&self, container_path: &str) -> Result<Value>;

    /// Idempotent teardown.
    async fn close(&self) -> Result<()>;

    /// Snapshot for persistence; `None` for backends that cannot be recovered.
    fn recovery_data(&self) -> Option<KernelRecoveryData> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_payload_shape() {
        assert_eq!(
            serde_json::to_value(OpResult::blocked()).unwrap(),
            json!({"status": "failed", "error": "operation blocked"})
        );
        assert_eq!(
            OpResult::invalid_service_name().to_value(),
            json!({"status": "failed", "error": "invalid service name"})
        );
        assert_eq!(serde_json::to_value(OpResult::Ok(json!({}))).unwrap(), json!({}));
    }

    #[test]
    fn test_settle_keeps_hard_errors() {
        assert!(OpResult::settle(Err(Error::transport("gone"))).is_err());
        assert!(OpResult::settle(Err(Error::state_transition("closed"))).is_err());
        let folded = OpResult::settle(Err(Error::backend("engine said no"))).unwrap();
        assert!(folded.is_failed());
    }

    #[test]
    fn test_commit_status_wire_names() {
        assert_eq!(serde_json::to_string(&CommitStatus::Ongoing).unwrap(), "\"ONGOING\"");
        assert_eq!(serde_json::to_string(&CommitStatus::Ready).unwrap(), "\"READY\"");
    }
}
