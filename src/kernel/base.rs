//! State shared by every backend kernel: creation spec, lifecycle, the
//! attached code runner, the commit in-flight flag and the event sink.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::Instrument;

use super::lifecycle::{KernelLifecycle, KernelState};
use super::runner::{CodeRunner, ReplEndpoint};
use super::types::{BackendType, KernelCreationSpec, ServicePort};
use super::OpResult;
use crate::events::{EventProducer, KernelEvent};
use crate::observability::kernel_span;
use crate::types::{Error, KernelId, Result};

#[derive(Debug)]
pub struct KernelBase {
    spec: KernelCreationSpec,
    backend: BackendType,
    lifecycle: KernelLifecycle,
    runner: RwLock<Option<Arc<CodeRunner>>>,
    commit: CommitFlag,
    events: Arc<dyn EventProducer>,
    span: tracing::Span,
}

impl KernelBase {
    pub fn new(
        spec: KernelCreationSpec,
        backend: BackendType,
        state: KernelState,
        events: Arc<dyn EventProducer>,
    ) -> Self {
        let span = kernel_span(
            &spec.identity.kernel_id,
            &spec.identity.session_id,
            backend.as_str(),
        );
        Self {
            spec,
            backend,
            lifecycle: KernelLifecycle::new(state),
            runner: RwLock::new(None),
            commit: CommitFlag::default(),
            events,
            span,
        }
    }

    pub fn spec(&self) -> &KernelCreationSpec {
        &self.spec
    }

    pub fn backend(&self) -> BackendType {
        self.backend
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.spec.identity.kernel_id
    }

    pub fn lifecycle(&self) -> &KernelLifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> KernelState {
        self.lifecycle.state()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn commit_flag(&self) -> &CommitFlag {
        &self.commit
    }

    pub fn ensure_open(&self, op: &str) -> Result<()> {
        self.lifecycle.ensure_open(op)
    }

    pub fn repl_endpoint(&self) -> ReplEndpoint {
        ReplEndpoint {
            kernel_host: self.spec.kernel_host.clone(),
            repl_in_port: self.spec.repl_in_port,
            repl_out_port: self.spec.repl_out_port,
        }
    }

    pub fn find_service_port(&self, name: &str) -> Option<&ServicePort> {
        self.spec.service_ports.iter().find(|port| port.name == name)
    }

    pub async fn publish(&self, event: KernelEvent) {
        self.events.produce(event).await;
    }

    /// The attached runner. Fails after close and before `init()`.
    pub async fn runner(&self, op: &str) -> Result<Arc<CodeRunner>> {
        self.ensure_open(op)?;
        self.runner.read().await.clone().ok_or_else(|| {
            Error::state_transition(format!("cannot {}: code runner not initialized", op))
        })
    }

    /// Attach a runner, closing any previous one, and mark the kernel ready.
    pub async fn install_runner(&self, runner: Arc<CodeRunner>) -> Result<()> {
        self.ensure_open("install code runner")?;
        let previous = self.runner.write().await.replace(runner);
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.lifecycle.mark_ready()
    }

    /// `{"status": "finished", "completions": <runner reply>}`
    pub async fn get_completions(&self, text: &str, opts: Value) -> Result<OpResult> {
        let runner = self.runner("get_completions").await?;
        let reply = runner.feed_and_get_completion(text, opts).await;
        OpResult::settle(reply.map(|completions| json!({"status": "finished", "completions": completions})))
    }

    /// Signal the running execution; the runner reply is discarded.
    pub async fn interrupt_kernel(&self) -> Result<OpResult> {
        let runner = self.runner("interrupt_kernel").await?;
        let reply = runner.feed_interrupt().await;
        OpResult::settle(reply.map(|_| json!({"status": "finished"})))
    }

    /// Start a declared service through the runner. Refused while service
    /// ports are blocked; unknown names are reported, not raised.
    pub async fn start_service(&self, name: &str, opts: Value) -> Result<OpResult> {
        async move {
            self.ensure_open("start_service")?;
            if self.spec.block_service_ports {
                tracing::info!("service_blocked: service={}", name);
                self.publish(KernelEvent::ServicePortsBlocked {
                    kernel_id: self.kernel_id().clone(),
                    service: name.to_string(),
                })
                .await;
                return Ok(OpResult::blocked());
            }
            let Some(port) = self.find_service_port(name) else {
                return Ok(OpResult::invalid_service_name());
            };
            let service_info = json!({
                "name": port.name,
                "port": port.primary_port(),
                "ports": port.container_ports,
                "protocol": port.protocol,
                "options": opts,
            });
            let runner = self.runner("start_service").await?;
            let result = OpResult::settle(runner.feed_start_service(service_info).await)?;
            if !result.is_failed() {
                self.lifecycle.mark_serving()?;
            }
            Ok(result)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Detach and close the runner, if any.
    pub async fn close_runner(&self) {
        let runner = self.runner.write().await.take();
        if let Some(runner) = runner {
            runner.close().await;
        }
    }
}

/// Per-kernel commit in-flight flag.
#[derive(Debug, Default)]
pub struct CommitFlag {
    ongoing: AtomicBool,
}

impl CommitFlag {
    pub fn is_ongoing(&self) -> bool {
        self.ongoing.load(Ordering::Acquire)
    }

    /// Claim the flag. `None` while another commit holds it.
    pub fn try_begin(&self) -> Option<CommitGuard<'_>> {
        self.ongoing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CommitGuard { flag: self })
    }
}

/// Clears the in-flight flag when dropped.
#[derive(Debug)]
pub struct CommitGuard<'a> {
    flag: &'a CommitFlag,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.flag.ongoing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_flag_excludes_second_claim() {
        let flag = CommitFlag::default();
        let guard = flag.try_begin().unwrap();
        assert!(flag.is_ongoing());
        assert!(flag.try_begin().is_none());
        drop(guard);
        assert!(!flag.is_ongoing());
        assert!(flag.try_begin().is_some());
    }

    #[test]
    fn test_commit_flag_released_on_panic() {
        let flag = CommitFlag::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = flag.try_begin().unwrap();
            panic!("snapshot exploded");
        }));
        assert!(result.is_err());
        assert!(!flag.is_ongoing());
    }
}
