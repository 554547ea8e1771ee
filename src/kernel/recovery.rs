//! Registry recovery and persistence.
//!
//! `KernelRegistryLoader` rebuilds the registry from the scratch store after
//! an agent restart; `KernelRegistryWriter` mirrors live kernels back to it;
//! `RegistryPersistence` runs the writer periodically in the background.
//!
//! Recovery is partial-failure tolerant: a kernel with missing or corrupt
//! scratch state is skipped with a warning, and a panic while restoring one
//! kernel is contained to that kernel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::{KernelHandle, KernelRegistry};
use super::types::KernelRecoveryData;
use crate::events::{EventProducer, KernelEvent};
use crate::scratch::ScratchStore;
use crate::types::{AgentId, ContainerId, Error, KernelId, Result};

// =============================================================================
// Collaborators
// =============================================================================

/// A container the backend reports as belonging to a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub container_id: ContainerId,
    /// Backend-reported status text (e.g. `running`).
    pub status: String,
}

/// Lists kernel containers known to the backend.
#[async_trait]
pub trait ContainerEnumerator: Send + Sync + fmt::Debug {
    async fn enumerate_containers(&self) -> Result<Vec<(KernelId, ContainerHandle)>>;
}

/// Turns a recovery snapshot into a live backend kernel.
#[async_trait]
pub trait KernelRestorer: Send + Sync + fmt::Debug {
    async fn restore(&self, data: KernelRecoveryData) -> Result<KernelHandle>;
}

// =============================================================================
// Loader
// =============================================================================

#[derive(Debug)]
pub struct KernelRegistryLoader {
    store: ScratchStore,
    enumerator: Arc<dyn ContainerEnumerator>,
    restorer: Arc<dyn KernelRestorer>,
    events: Arc<dyn EventProducer>,
}

impl KernelRegistryLoader {
    pub fn new(
        store: ScratchStore,
        enumerator: Arc<dyn ContainerEnumerator>,
        restorer: Arc<dyn KernelRestorer>,
        events: Arc<dyn EventProducer>,
    ) -> Self {
        Self {
            store,
            enumerator,
            restorer,
            events,
        }
    }

    /// Build a fresh registry from the containers the backend reports.
    pub async fn load_kernel_registry(&self) -> Result<KernelRegistry> {
        let registry = KernelRegistry::new();
        self.load_into(&registry).await?;
        Ok(registry)
    }

    /// Restore into an existing registry; returns how many kernels were added.
    ///
    /// Only enumeration failure aborts; per-kernel problems are skipped.
    pub async fn load_into(&self, registry: &KernelRegistry) -> Result<usize> {
        let containers = self.enumerator.enumerate_containers().await?;
        let total = containers.len();
        let mut restored = 0usize;

        for (kernel_id, handle) in containers {
            if !self.store.has_config_dir(&kernel_id).await {
                tracing::debug!(
                    "recovery_orphaned_container: kernel_id={} container_id={}",
                    kernel_id,
                    handle.container_id
                );
                continue;
            }
            if registry.contains(&kernel_id).await {
                tracing::warn!("recovery_duplicate_kernel: kernel_id={}", kernel_id);
                continue;
            }

            let outcome = AssertUnwindSafe(self.restore_one(&kernel_id, &handle))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(Error::internal(format!(
                        "panic while restoring: {}",
                        panic_message(&payload)
                    )))
                });

            match outcome {
                Ok(kernel) => match registry.register(kernel).await {
                    Ok(()) => restored += 1,
                    Err(e) => self.skip(&kernel_id, e.to_string()).await,
                },
                Err(e) => self.skip(&kernel_id, e.to_string()).await,
            }
        }

        tracing::info!("registry_loaded: restored={} containers={}", restored, total);
        Ok(restored)
    }

    async fn restore_one(&self, kernel_id: &KernelId, handle: &ContainerHandle) -> Result<KernelHandle> {
        let scratch = self
            .store
            .read_recovery(kernel_id)
            .await?
            .ok_or_else(|| Error::not_found("recovery.json"))?;
        if &scratch.identity.kernel_id != kernel_id {
            return Err(Error::validation(format!(
                "recovery data belongs to kernel {}",
                scratch.identity.kernel_id
            )));
        }
        let resource_spec = self.store.read_resource_spec(kernel_id).await?;
        let environ = self.store.read_environ(kernel_id).await?;
        let mut data = scratch.into_recovery_data(resource_spec, environ);

        if data.container_id.as_ref() != Some(&handle.container_id) {
            tracing::debug!(
                "recovery_container_rebound: kernel_id={} container_id={}",
                kernel_id,
                handle.container_id
            );
            data.container_id = Some(handle.container_id.clone());
        }

        let session_id = data.identity.session_id.clone();
        let kernel = self.restorer.restore(data).await?;
        tracing::info!("kernel_recovered: kernel_id={} state={:?}", kernel_id, kernel.state());
        self.events
            .produce(KernelEvent::Recovered {
                kernel_id: kernel_id.clone(),
                session_id,
            })
            .await;
        Ok(kernel)
    }

    async fn skip(&self, kernel_id: &KernelId, reason: String) {
        tracing::warn!("recovery_skipped: kernel_id={} reason={}", kernel_id, reason);
        self.events
            .produce(KernelEvent::RecoverySkipped {
                kernel_id: kernel_id.clone(),
                reason,
            })
            .await;
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Context recorded with a save, for logs.
#[derive(Debug, Clone)]
pub struct SaveMetadata {
    pub agent_id: AgentId,
}

/// Statistics from one save pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    /// Snapshots written.
    pub saved: usize,
    /// Kernels whose backend does not support persistence.
    pub skipped: usize,
    /// Snapshots that could not be written.
    pub failed: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct KernelRegistryWriter {
    store: ScratchStore,
}

impl KernelRegistryWriter {
    pub fn new(store: ScratchStore) -> Self {
        Self { store }
    }

    /// Write `recovery.json` for every recoverable kernel. `environ.txt` and
    /// `resource.txt` are left untouched.
    pub async fn save_kernel_registry(
        &self,
        registry: &KernelRegistry,
        metadata: &SaveMetadata,
    ) -> Result<SaveReport> {
        let mut report = SaveReport::default();
        for kernel in registry.snapshot().await {
            let Some(data) = kernel.recovery_data() else {
                report.skipped += 1;
                continue;
            };
            match self.store.write_recovery(&data.to_scratch()).await {
                Ok(()) => report.saved += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        "recovery_save_failed: kernel_id={} error={}",
                        kernel.kernel_id(),
                        e
                    );
                }
            }
        }
        report.completed_at = Some(Utc::now());
        tracing::debug!(
            "registry_saved: agent_id={} saved={} skipped={} failed={}",
            metadata.agent_id,
            report.saved,
            report.skipped,
            report.failed
        );
        Ok(report)
    }
}

// =============================================================================
// Periodic persistence
// =============================================================================

/// Background task that saves the registry on a fixed interval and once
/// more when stopped.
#[derive(Debug)]
pub struct RegistryPersistence {
    registry: KernelRegistry,
    writer: KernelRegistryWriter,
    metadata: SaveMetadata,
    interval: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RegistryPersistence {
    pub fn new(
        registry: KernelRegistry,
        writer: KernelRegistryWriter,
        metadata: SaveMetadata,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            writer,
            metadata,
            interval,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start the save loop. Returns immediately.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let registry = self.registry.clone();
        let writer = self.writer.clone();
        let metadata = self.metadata.clone();
        let period = self.interval.max(Duration::from_millis(1));
        let cancel = self.cancel.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = writer.save_kernel_registry(&registry, &metadata).await {
                            tracing::error!("registry_save_cycle_failed: {}", e);
                        }
                    }
                }
            }
            match writer.save_kernel_registry(&registry, &metadata).await {
                Ok(report) => tracing::info!("registry_persistence_stopped: saved={}", report.saved),
                Err(e) => tracing::error!("registry_final_save_failed: {}", e),
            }
        }));
    }

    /// Stop the loop and wait for the final save.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("registry_persistence_join_failed: {}", e);
            }
        }
    }
}
