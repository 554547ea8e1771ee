//! Process-wide kernel registry: the single source of truth for what is
//! running on this node.
//!
//! Keys are unique. An entry is added on successful creation or recovery
//! and removed only after the backend has confirmed teardown.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::AbstractKernel;
use crate::scratch::ScratchStore;
use crate::types::{Error, KernelId, Result};

pub type KernelHandle = Arc<dyn AbstractKernel>;

#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    kernels: Arc<Mutex<HashMap<KernelId, KernelHandle>>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a live kernel. Fails with `AlreadyExists` if the id is taken.
    pub async fn register(&self, kernel: KernelHandle) -> Result<()> {
        let kernel_id = kernel.kernel_id().clone();
        let mut kernels = self.kernels.lock().await;
        if kernels.contains_key(&kernel_id) {
            return Err(Error::already_exists(format!("kernel {}", kernel_id)));
        }
        kernels.insert(kernel_id.clone(), kernel);
        tracing::debug!("kernel_registered: kernel_id={} total={}", kernel_id, kernels.len());
        Ok(())
    }

    pub async fn get(&self, kernel_id: &KernelId) -> Option<KernelHandle> {
        self.kernels.lock().await.get(kernel_id).cloned()
    }

    pub async fn contains(&self, kernel_id: &KernelId) -> bool {
        self.kernels.lock().await.contains_key(kernel_id)
    }

    pub async fn remove(&self, kernel_id: &KernelId) -> Option<KernelHandle> {
        self.kernels.lock().await.remove(kernel_id)
    }

    /// Registered ids, sorted.
    pub async fn ids(&self) -> Vec<KernelId> {
        let mut ids: Vec<KernelId> = self.kernels.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All live kernels. The lock is not held while callers use them.
    pub async fn snapshot(&self) -> Vec<KernelHandle> {
        self.kernels.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.kernels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.kernels.lock().await.is_empty()
    }

    /// Close a kernel whose backing resource is confirmed gone, then drop
    /// it from the registry and its recovery snapshot from scratch.
    pub async fn forget_terminated(
        &self,
        kernel_id: &KernelId,
        store: &ScratchStore,
    ) -> Result<Option<KernelHandle>> {
        let Some(kernel) = self.get(kernel_id).await else {
            return Ok(None);
        };
        kernel.close().await?;
        let removed = self.remove(kernel_id).await;
        store.remove_recovery(kernel_id).await?;
        tracing::info!("kernel_forgotten: kernel_id={}", kernel_id);
        Ok(removed)
    }

    /// Close every kernel for agent shutdown. Entries stay registered so a
    /// final registry save still sees them.
    pub async fn close_all(&self) {
        for kernel in self.snapshot().await {
            if let Err(e) = kernel.close().await {
                tracing::warn!("kernel_close_failed: kernel_id={} error={}", kernel.kernel_id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendContext, DummyKernel};
    use crate::events::TracingEventProducer;
    use crate::kernel::{ImageRef, KernelCreationSpec, KernelIdentity, KernelResourceSpec, KernelState};
    use crate::repl::LoopbackTransport;
    use crate::types::{AgentId, Config, SessionId};

    async fn dummy(kernel_id: KernelId) -> KernelHandle {
        let identity = KernelIdentity {
            kernel_id,
            session_id: SessionId::new(),
            agent_id: AgentId::from_string("i-test".to_string()).unwrap(),
            image: ImageRef::parse("python:3.11", "x86_64", false).unwrap(),
            version: 1,
        };
        let ctx = BackendContext::new(
            Arc::new(Config::default()),
            Arc::new(LoopbackTransport::default()),
            Arc::new(TracingEventProducer),
        );
        let spec = KernelCreationSpec::new(identity, KernelResourceSpec::new("dummy"));
        Arc::new(DummyKernel::create(spec, ctx).await.unwrap())
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let registry = KernelRegistry::new();
        let kernel_id = KernelId::new();
        registry.register(dummy(kernel_id.clone()).await).await.unwrap();
        let err = registry.register(dummy(kernel_id.clone()).await).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_ids_sorted() {
        let registry = KernelRegistry::new();
        for id in ["k-b", "k-c", "k-a"] {
            let kernel_id = KernelId::from_string(id.to_string()).unwrap();
            registry.register(dummy(kernel_id).await).await.unwrap();
        }
        let ids: Vec<String> = registry.ids().await.iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["k-a", "k-b", "k-c"]);
    }

    #[tokio::test]
    async fn test_forget_terminated_closes_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path());
        let registry = KernelRegistry::new();
        let kernel_id = KernelId::new();
        registry.register(dummy(kernel_id.clone()).await).await.unwrap();

        let removed = registry.forget_terminated(&kernel_id, &store).await.unwrap().unwrap();
        assert_eq!(removed.state(), KernelState::Closed);
        assert!(!registry.contains(&kernel_id).await);
        assert!(registry.forget_terminated(&kernel_id, &store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_all_keeps_entries() {
        let registry = KernelRegistry::new();
        registry.register(dummy(KernelId::new()).await).await.unwrap();
        registry.register(dummy(KernelId::new()).await).await.unwrap();
        registry.close_all().await;
        assert_eq!(registry.len().await, 2);
        for kernel in registry.snapshot().await {
            assert_eq!(kernel.state(), KernelState::Closed);
        }
    }
}
