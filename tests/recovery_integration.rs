//! Recovery integration tests: scratch store → loader → docker kernels → writer.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

use kernel_agent::backends::process::ExecOutput;
use kernel_agent::backends::{BackendContext, BackendRestorer, ContainerEngine, DockerKernel, EngineEnumerator};
use kernel_agent::events::{ChannelEventProducer, KernelEvent, TracingEventProducer};
use kernel_agent::kernel::{
    AbstractKernel, BackendType, ContainerHandle, ImageRef, KernelCreationSpec, KernelIdentity,
    KernelRecoveryData, KernelRegistry, KernelRegistryLoader, KernelRegistryWriter,
    KernelResourceSpec, KernelState, RegistryPersistence, SaveMetadata,
};
use kernel_agent::repl::LoopbackTransport;
use kernel_agent::scratch::ScratchStore;
use kernel_agent::types::{AgentId, Config, ContainerId, Error, KernelId, Result, SessionId};

/// Engine that only knows which containers exist.
#[derive(Debug, Default)]
struct StaticEngine {
    containers: Vec<(KernelId, ContainerHandle)>,
}

impl StaticEngine {
    fn with(kernel_ids: &[&KernelId]) -> Self {
        let containers = kernel_ids
            .iter()
            .map(|id| {
                let handle = ContainerHandle {
                    container_id: ContainerId::from_string(format!("c-{}", id)).unwrap(),
                    status: "running".to_string(),
                };
                ((*id).clone(), handle)
            })
            .collect();
        Self { containers }
    }
}

#[async_trait]
impl ContainerEngine for StaticEngine {
    async fn list_kernel_containers(&self) -> Result<Vec<(KernelId, ContainerHandle)>> {
        Ok(self.containers.clone())
    }

    async fn logs(&self, _container_id: &ContainerId) -> Result<String> {
        Ok(String::new())
    }

    async fn commit(&self, _: &ContainerId, _: &[String], _: Option<(&str, &str)>) -> Result<String> {
        Err(Error::not_implemented("commit"))
    }

    async fn export_image(&self, _image_id: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        Err(Error::not_implemented("export"))
    }

    async fn delete_image(&self, _image_id: &str) -> Result<()> {
        Ok(())
    }

    async fn get_archive(&self, _: &ContainerId, _: &str, _: u64) -> Result<Bytes> {
        Err(Error::not_implemented("archive"))
    }

    async fn exec(&self, _: &ContainerId, _: &[String]) -> Result<ExecOutput> {
        Err(Error::not_implemented("exec"))
    }
}

struct Node {
    _dir: tempfile::TempDir,
    config: Arc<Config>,
    store: ScratchStore,
}

fn node() -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.container.scratch_root = dir.path().join("scratches");
    config.agent.ipc_base_path = dir.path().join("ipc");
    let store = ScratchStore::new(&config.container.scratch_root);
    Node {
        _dir: dir,
        config: Arc::new(config),
        store,
    }
}

fn ctx(node: &Node) -> BackendContext {
    BackendContext::new(
        node.config.clone(),
        Arc::new(LoopbackTransport::default()),
        Arc::new(TracingEventProducer),
    )
}

fn creation_spec(kernel_id: &KernelId) -> KernelCreationSpec {
    let identity = KernelIdentity {
        kernel_id: kernel_id.clone(),
        session_id: SessionId::new(),
        agent_id: AgentId::from_string("i-node".to_string()).unwrap(),
        image: ImageRef::parse("cr.backend.ai/stable/python:3.11", "x86_64", false).unwrap(),
        version: 1,
    };
    let mut resource_spec = KernelResourceSpec::new(format!("c-{}", kernel_id));
    resource_spec.scratch_disk_size = 1 << 30;
    resource_spec.mounts.push("/data:/home/work/data:rw".to_string());
    let mut spec = KernelCreationSpec::new(identity, resource_spec);
    spec.container_id = Some(ContainerId::from_string(format!("c-{}", kernel_id)).unwrap());
    spec.environ = BTreeMap::from([
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("BACKENDAI_KERNEL_ID".to_string(), kernel_id.to_string()),
    ]);
    spec
}

/// Provision scratch for a docker kernel, persist it as the writer would,
/// and return what was saved.
async fn persist_kernel(node: &Node, kernel_id: &KernelId) -> KernelRecoveryData {
    let spec = creation_spec(kernel_id);
    node.store
        .provision(kernel_id, &spec.resource_spec, &spec.environ)
        .await
        .unwrap();
    let engine = Arc::new(StaticEngine::default());
    let kernel = DockerKernel::create(spec, ctx(node), engine).await.unwrap();
    let registry = KernelRegistry::new();
    registry.register(Arc::new(kernel)).await.unwrap();

    let writer = KernelRegistryWriter::new(node.store.clone());
    let metadata = SaveMetadata {
        agent_id: AgentId::from_string("i-node".to_string()).unwrap(),
    };
    let report = writer.save_kernel_registry(&registry, &metadata).await.unwrap();
    assert_eq!(report.saved, 1);

    let kernel = registry.get(kernel_id).await.unwrap();
    let data = kernel.recovery_data().unwrap();
    kernel.close().await.unwrap();
    data
}

fn loader(node: &Node, engine: Arc<StaticEngine>) -> KernelRegistryLoader {
    KernelRegistryLoader::new(
        node.store.clone(),
        Arc::new(EngineEnumerator::new(engine.clone())),
        Arc::new(BackendRestorer::new(ctx(node), engine)),
        Arc::new(TracingEventProducer),
    )
}

#[tokio::test]
async fn test_save_then_load_round_trips() {
    let node = node();
    let kernel_id = KernelId::new();
    let saved = persist_kernel(&node, &kernel_id).await;

    let registry = loader(&node, Arc::new(StaticEngine::with(&[&kernel_id])))
        .load_kernel_registry()
        .await
        .unwrap();
    let kernel = registry.get(&kernel_id).await.unwrap();
    assert_eq!(kernel.backend(), BackendType::Docker);

    let recovered = kernel.recovery_data().unwrap();
    assert_eq!(recovered, saved);
    assert_eq!(recovered.environ["LANG"], "C.UTF-8");
    assert_eq!(recovered.resource_spec.scratch_disk_size, 1 << 30);
}

#[tokio::test]
async fn test_load_is_idempotent() {
    let node = node();
    let first_id = KernelId::new();
    let second_id = KernelId::new();
    persist_kernel(&node, &first_id).await;
    persist_kernel(&node, &second_id).await;
    let engine = Arc::new(StaticEngine::with(&[&first_id, &second_id]));

    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let registry = loader(&node, engine.clone()).load_kernel_registry().await.unwrap();
        let mut entries = Vec::new();
        for kernel_id in registry.ids().await {
            let kernel = registry.get(&kernel_id).await.unwrap();
            entries.push((kernel_id, kernel.state()));
        }
        registry.close_all().await;
        snapshots.push(entries);
    }
    assert_eq!(snapshots[0].len(), 2);
    assert_eq!(snapshots[0], snapshots[1]);
}

#[tokio::test]
async fn test_load_into_does_not_duplicate() {
    let node = node();
    let kernel_id = KernelId::new();
    persist_kernel(&node, &kernel_id).await;
    let loader = loader(&node, Arc::new(StaticEngine::with(&[&kernel_id])));

    let registry = KernelRegistry::new();
    assert_eq!(loader.load_into(&registry).await.unwrap(), 1);
    assert_eq!(loader.load_into(&registry).await.unwrap(), 0);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
#[traced_test]
async fn test_corrupt_and_orphaned_entries_are_skipped() {
    let node = node();
    let healthy = KernelId::new();
    let corrupt = KernelId::new();
    let missing_recovery = KernelId::new();
    let orphan = KernelId::new();

    persist_kernel(&node, &healthy).await;
    persist_kernel(&node, &corrupt).await;
    let corrupt_file = node.store.config_dir(&corrupt).unwrap().join("recovery.json");
    std::fs::write(corrupt_file, b"{not json").unwrap();

    let spec = creation_spec(&missing_recovery);
    node.store
        .provision(&missing_recovery, &spec.resource_spec, &spec.environ)
        .await
        .unwrap();

    let engine = Arc::new(StaticEngine::with(&[&healthy, &corrupt, &missing_recovery, &orphan]));
    let (events, mut rx) = ChannelEventProducer::new();
    let loader = KernelRegistryLoader::new(
        node.store.clone(),
        Arc::new(EngineEnumerator::new(engine.clone())),
        Arc::new(BackendRestorer::new(ctx(&node), engine)),
        Arc::new(events),
    );
    let registry = loader.load_kernel_registry().await.unwrap();

    assert_eq!(registry.ids().await, vec![healthy.clone()]);
    assert!(logs_contain("recovery_skipped"));
    assert!(logs_contain(&format!("kernel_id={}", corrupt)));
    assert!(logs_contain("recovery_orphaned_container"));

    let mut skipped = Vec::new();
    let mut recovered = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            KernelEvent::RecoverySkipped { kernel_id, .. } => skipped.push(kernel_id),
            KernelEvent::Recovered { kernel_id, .. } => recovered.push(kernel_id),
            _ => {}
        }
    }
    skipped.sort();
    let mut expected = vec![corrupt, missing_recovery];
    expected.sort();
    assert_eq!(skipped, expected);
    assert_eq!(recovered, vec![healthy]);
}

#[tokio::test]
async fn test_closing_and_foreign_backends_are_skipped() {
    let node = node();
    let closing = KernelId::new();
    let foreign = KernelId::new();

    let mut data = persist_kernel(&node, &closing).await;
    data.state = KernelState::Closing;
    node.store.write_recovery(&data.to_scratch()).await.unwrap();

    let mut data = persist_kernel(&node, &foreign).await;
    data.backend = BackendType::Kubernetes;
    node.store.write_recovery(&data.to_scratch()).await.unwrap();

    let registry = loader(&node, Arc::new(StaticEngine::with(&[&closing, &foreign])))
        .load_kernel_registry()
        .await
        .unwrap();
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_container_id_follows_live_engine() {
    let node = node();
    let kernel_id = KernelId::new();
    persist_kernel(&node, &kernel_id).await;

    let engine = StaticEngine {
        containers: vec![(
            kernel_id.clone(),
            ContainerHandle {
                container_id: ContainerId::from_string("recreated".to_string()).unwrap(),
                status: "running".to_string(),
            },
        )],
    };
    let registry = loader(&node, Arc::new(engine)).load_kernel_registry().await.unwrap();
    let data = registry.get(&kernel_id).await.unwrap().recovery_data().unwrap();
    assert_eq!(data.container_id.unwrap().as_str(), "recreated");
}

#[tokio::test]
async fn test_periodic_persistence_rewrites_snapshots() {
    let node = node();
    let kernel_id = KernelId::new();
    let spec = creation_spec(&kernel_id);
    node.store
        .provision(&kernel_id, &spec.resource_spec, &spec.environ)
        .await
        .unwrap();
    let kernel = DockerKernel::create(spec, ctx(&node), Arc::new(StaticEngine::default()))
        .await
        .unwrap();
    let registry = KernelRegistry::new();
    registry.register(Arc::new(kernel)).await.unwrap();

    let mut persistence = RegistryPersistence::new(
        registry.clone(),
        KernelRegistryWriter::new(node.store.clone()),
        SaveMetadata {
            agent_id: AgentId::from_string("i-node".to_string()).unwrap(),
        },
        Duration::from_millis(20),
    );
    persistence.start();

    let recovery_file = node.store.config_dir(&kernel_id).unwrap().join("recovery.json");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !recovery_file.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    std::fs::remove_file(&recovery_file).unwrap();
    persistence.stop().await;
    assert!(recovery_file.exists());
    registry.close_all().await;
}
