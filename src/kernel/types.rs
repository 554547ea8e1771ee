//! Kernel types: identity, ownership, cluster placement, service ports and
//! the recovery snapshots persisted to scratch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::lifecycle::KernelState;
use super::resources::KernelResourceSpec;
use crate::types::{AgentId, ContainerId, Error, KernelId, Result, SessionId};

const DEFAULT_REGISTRY: &str = "index.docker.io";
const DEFAULT_REPOSITORY: &str = "lablup";

// =============================================================================
// Image reference
// =============================================================================

/// Parsed container image reference (`registry/name:tag`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub canonical: String,
    pub registry: String,
    pub name: String,
    pub tag: String,
    pub architecture: String,
    #[serde(default)]
    pub is_local: bool,
}

impl ImageRef {
    /// Parse an image reference. A first path component containing `.` or `:`
    /// (or equal to `localhost`) names the registry; otherwise the default
    /// registry and repository are assumed.
    pub fn parse(value: &str, architecture: &str, is_local: bool) -> Result<Self> {
        if value.contains("://") || value.starts_with("//") {
            return Err(Error::validation(format!("invalid image name: {}", value)));
        }
        let (registry, rest, using_default) = match value.split_once('/') {
            Some((head, tail)) if head.contains('.') || head.contains(':') || head == "localhost" => {
                let default = head == "docker.io" || head.ends_with(".docker.io");
                (head.to_string(), tail, default)
            }
            _ => (DEFAULT_REGISTRY.to_string(), value, true),
        };

        // The tag separator must come after the last path separator.
        let (mut name, tag) = match rest.rsplit_once(':') {
            Some((n, t)) if !t.contains('/') => (n.to_string(), t.to_string()),
            _ => (rest.to_string(), "latest".to_string()),
        };
        if name.is_empty() {
            return Err(Error::validation("empty image repository/name"));
        }
        if !is_slug(&tag) {
            return Err(Error::validation(format!("invalid image tag {:?} in {}", tag, value)));
        }
        if using_default && !name.contains('/') {
            name = format!("{}/{}", DEFAULT_REPOSITORY, name);
        }
        Ok(Self {
            canonical: format!("{}/{}:{}", registry, name, tag),
            registry,
            name,
            tag,
            architecture: architecture.to_string(),
            is_local,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

fn is_slug(s: &str) -> bool {
    let bytes = s.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) => {
            edge_ok(first)
                && edge_ok(last)
                && bytes
                    .iter()
                    .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
        }
        _ => false,
    }
}

// =============================================================================
// Identity and ownership
// =============================================================================

/// Immutable kernel identity, assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelIdentity {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub image: ImageRef,
    pub version: u32,
}

/// User/project/domain ownership of a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelOwnershipData {
    pub owner_user_id: Option<String>,
    pub owner_project_id: Option<String>,
    pub domain_name: Option<String>,
}

// =============================================================================
// Cluster placement
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    #[default]
    SingleNode,
    MultiNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSshKeyPair {
    /// OpenSSH authorized-keys compatible format.
    pub public_key: String,
    /// PEM-encoded.
    pub private_key: String,
}

/// Position of a kernel within a (possibly multi-kernel) session.
///
/// Shared read-only by every kernel of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub network_id: Option<String>,
    pub cluster_mode: ClusterMode,
    pub cluster_size: u32,
    pub cluster_role: String,
    pub cluster_idx: u32,
    pub cluster_hostname: String,
    /// Per-role kernel counts.
    #[serde(default)]
    pub replicas: BTreeMap<String, u32>,
    pub ssh_keypair: Option<ClusterSshKeyPair>,
    /// hostname -> (host address, port)
    #[serde(default)]
    pub ssh_port_mapping: BTreeMap<String, (String, u16)>,
}

// =============================================================================
// Service ports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePortProtocol {
    Http,
    Tcp,
    Preopen,
    Internal,
}

/// Container-internal ports declared for a service, and their host mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub protocol: ServicePortProtocol,
    pub container_ports: Vec<u16>,
    #[serde(default)]
    pub host_ports: Vec<Option<u16>>,
    #[serde(default)]
    pub is_inference: bool,
}

impl ServicePort {
    /// The primary port handed to the in-container service launcher.
    pub fn primary_port(&self) -> Option<u16> {
        self.container_ports.first().copied()
    }
}

// =============================================================================
// Backend and session kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Docker,
    Kubernetes,
    Dummy,
}

impl BackendType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::Docker => "docker",
            BackendType::Kubernetes => "kubernetes",
            BackendType::Dummy => "dummy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    #[default]
    Interactive,
    Batch,
    Inference,
}

/// Serializable half of a domain socket proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSocketProxyDescriptor {
    /// Upstream socket, and the path the container sees.
    pub host_sock_path: PathBuf,
    /// Host-side listening socket bind-mounted into the container.
    pub host_proxy_path: PathBuf,
}

// =============================================================================
// Creation spec
// =============================================================================

/// Immutable creation spec handed to a backend kernel by the creation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelCreationSpec {
    pub identity: KernelIdentity,
    #[serde(default)]
    pub ownership: KernelOwnershipData,
    #[serde(default)]
    pub cluster_info: Option<ClusterInfo>,
    #[serde(default)]
    pub session_type: SessionType,
    pub network_id: Option<String>,
    pub network_driver: Option<String>,
    pub container_id: Option<ContainerId>,
    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub service_ports: Vec<ServicePort>,
    #[serde(default)]
    pub block_service_ports: bool,
    /// Deprecated; carried through persistence only.
    #[serde(default)]
    pub prevent_vfolder_mount: bool,
    /// Upstream sockets to expose inside the container through proxies.
    #[serde(default)]
    pub domain_socket_paths: Vec<PathBuf>,
    pub resource_spec: KernelResourceSpec,
    #[serde(default)]
    pub environ: BTreeMap<String, String>,
}

impl KernelCreationSpec {
    /// Conventional in-container REPL ports.
    pub const DEFAULT_REPL_PORTS: (u16, u16) = (2000, 2001);

    /// A spec with no services, proxies or cluster placement. An empty
    /// `kernel_host` is filled in by the backend.
    pub fn new(identity: KernelIdentity, resource_spec: KernelResourceSpec) -> Self {
        let (repl_in_port, repl_out_port) = Self::DEFAULT_REPL_PORTS;
        Self {
            identity,
            ownership: KernelOwnershipData::default(),
            cluster_info: None,
            session_type: SessionType::default(),
            network_id: None,
            network_driver: None,
            container_id: None,
            kernel_host: String::new(),
            repl_in_port,
            repl_out_port,
            service_ports: Vec::new(),
            block_service_ports: false,
            prevent_vfolder_mount: false,
            domain_socket_paths: Vec::new(),
            resource_spec,
            environ: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Recovery snapshots
// =============================================================================

/// Full snapshot sufficient to reconstruct a kernel instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRecoveryData {
    pub backend: BackendType,
    pub identity: KernelIdentity,
    pub ownership: KernelOwnershipData,
    pub cluster_info: Option<ClusterInfo>,
    pub network_id: Option<String>,
    pub network_driver: Option<String>,
    /// Absent means no backing container yet.
    pub container_id: Option<ContainerId>,
    pub session_type: SessionType,
    pub state: KernelState,
    pub block_service_ports: bool,
    pub prevent_vfolder_mount: bool,
    pub domain_socket_proxies: Vec<DomainSocketProxyDescriptor>,
    pub service_ports: Vec<ServicePort>,
    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub resource_spec: KernelResourceSpec,
    pub environ: BTreeMap<String, String>,
}

/// What goes into `recovery.json`: the snapshot minus the resource spec and
/// environment, which live in their own files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRecoveryScratchData {
    pub backend: BackendType,
    pub identity: KernelIdentity,
    #[serde(default)]
    pub ownership: KernelOwnershipData,
    #[serde(default)]
    pub cluster_info: Option<ClusterInfo>,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub network_driver: Option<String>,
    #[serde(default)]
    pub container_id: Option<ContainerId>,
    #[serde(default)]
    pub session_type: SessionType,
    pub state: KernelState,
    #[serde(default)]
    pub block_service_ports: bool,
    #[serde(default)]
    pub prevent_vfolder_mount: bool,
    #[serde(default)]
    pub domain_socket_proxies: Vec<DomainSocketProxyDescriptor>,
    #[serde(default)]
    pub service_ports: Vec<ServicePort>,
    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub saved_at: DateTime<Utc>,
}

impl KernelRecoveryData {
    pub fn kernel_id(&self) -> &KernelId {
        &self.identity.kernel_id
    }

    /// Split off the disk-persisted subset.
    pub fn to_scratch(&self) -> KernelRecoveryScratchData {
        KernelRecoveryScratchData {
            backend: self.backend,
            identity: self.identity.clone(),
            ownership: self.ownership.clone(),
            cluster_info: self.cluster_info.clone(),
            network_id: self.network_id.clone(),
            network_driver: self.network_driver.clone(),
            container_id: self.container_id.clone(),
            session_type: self.session_type,
            state: self.state,
            block_service_ports: self.block_service_ports,
            prevent_vfolder_mount: self.prevent_vfolder_mount,
            domain_socket_proxies: self.domain_socket_proxies.clone(),
            service_ports: self.service_ports.clone(),
            kernel_host: self.kernel_host.clone(),
            repl_in_port: self.repl_in_port,
            repl_out_port: self.repl_out_port,
            saved_at: Utc::now(),
        }
    }

    /// The creation spec this snapshot was built from.
    pub fn creation_spec(&self) -> KernelCreationSpec {
        KernelCreationSpec {
            identity: self.identity.clone(),
            ownership: self.ownership.clone(),
            cluster_info: self.cluster_info.clone(),
            session_type: self.session_type,
            network_id: self.network_id.clone(),
            network_driver: self.network_driver.clone(),
            container_id: self.container_id.clone(),
            kernel_host: self.kernel_host.clone(),
            repl_in_port: self.repl_in_port,
            repl_out_port: self.repl_out_port,
            service_ports: self.service_ports.clone(),
            block_service_ports: self.block_service_ports,
            prevent_vfolder_mount: self.prevent_vfolder_mount,
            domain_socket_paths: self
                .domain_socket_proxies
                .iter()
                .map(|p| p.host_sock_path.clone())
                .collect(),
            resource_spec: self.resource_spec.clone(),
            environ: self.environ.clone(),
        }
    }
}

impl KernelRecoveryScratchData {
    /// Re-attach the independently stored resource spec and environment.
    pub fn into_recovery_data(
        self,
        resource_spec: KernelResourceSpec,
        environ: BTreeMap<String, String>,
    ) -> KernelRecoveryData {
        KernelRecoveryData {
            backend: self.backend,
            identity: self.identity,
            ownership: self.ownership,
            cluster_info: self.cluster_info,
            network_id: self.network_id,
            network_driver: self.network_driver,
            container_id: self.container_id,
            session_type: self.session_type,
            state: self.state,
            block_service_ports: self.block_service_ports,
            prevent_vfolder_mount: self.prevent_vfolder_mount,
            domain_socket_proxies: self.domain_socket_proxies,
            service_ports: self.service_ports,
            kernel_host: self.kernel_host,
            repl_in_port: self.repl_in_port,
            repl_out_port: self.repl_out_port,
            resource_spec,
            environ,
        }
    }
}
