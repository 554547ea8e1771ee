//! Simulated kernels for load and latency testing without containers.
//!
//! Every operation sleeps for `dummy.delay.<op>` seconds and returns a canned
//! payload. The runner talks to an in-process loopback channel, so the
//! kernel is ready as soon as it is created.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;

use super::BackendContext;
use crate::events::KernelEvent;
use crate::kernel::{
    AbstractKernel, BackendType, ClientFeatures, CodeRunner, CommitOptions, CommitOutcome,
    CommitStatus, KernelBase, KernelCreationSpec, KernelState, OpResult,
};
use crate::repl::LoopbackTransport;
use crate::types::{KernelId, Result};
use crate::validation::confine_container_path;

#[derive(Debug)]
pub struct DummyKernel {
    base: KernelBase,
    ctx: BackendContext,
    transport: LoopbackTransport,
}

impl DummyKernel {
    /// Build the kernel and attach its loopback runner.
    pub async fn create(spec: KernelCreationSpec, ctx: BackendContext) -> Result<Self> {
        let kernel = Self::with_transport(spec, ctx, LoopbackTransport::default());
        kernel.init().await?;
        Ok(kernel)
    }

    /// Build without a runner, replying through `transport` once initialized.
    pub fn with_transport(mut spec: KernelCreationSpec, ctx: BackendContext, transport: LoopbackTransport) -> Self {
        if spec.kernel_host.is_empty() {
            spec.kernel_host = ctx.config.container.kernel_host.clone();
        }
        Self {
            base: KernelBase::new(spec, BackendType::Dummy, KernelState::Created, ctx.events.clone()),
            ctx,
            transport,
        }
    }

    async fn pause(&self, op: &str) {
        let delay = self.ctx.config.dummy.delay_for(op);
        if !delay.is_zero() {
            tracing::trace!("dummy_delay: op={} delay={:?}", op, delay);
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AbstractKernel for DummyKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    async fn create_code_runner(
        &self,
        client_features: ClientFeatures,
        api_version: u32,
    ) -> Result<Arc<CodeRunner>> {
        self.base.ensure_open("create_code_runner")?;
        self.pause("create-code-runner").await;
        let runner = Arc::new(CodeRunner::new(
            self.base.kernel_id().clone(),
            self.base.repl_endpoint(),
            0.0,
            client_features,
            api_version,
        )?);
        runner.connect(&self.transport).await?;
        Ok(runner)
    }

    async fn check_status(&self) -> Result<OpResult> {
        let runner = self.base.runner("check_status").await?;
        self.pause("check-status").await;
        OpResult::settle(runner.feed_and_get_status().await)
    }

    async fn get_completions(&self, text: &str, opts: Value) -> Result<OpResult> {
        self.base.ensure_open("get_completions")?;
        self.pause("get-completions").await;
        self.base.get_completions(text, opts).await
    }

    async fn get_logs(&self) -> Result<OpResult> {
        self.base.ensure_open("get_logs")?;
        self.pause("get-logs").await;
        Ok(OpResult::Ok(json!({"logs": ""})))
    }

    async fn interrupt_kernel(&self) -> Result<OpResult> {
        self.base.ensure_open("interrupt_kernel")?;
        self.pause("interrupt-kernel").await;
        self.base.interrupt_kernel().await
    }

    async fn start_service(&self, name: &str, opts: Value) -> Result<OpResult> {
        self.pause("start-service").await;
        self.base.start_service(name, opts).await
    }

    async fn start_model_service(&self, model_spec: Value) -> Result<OpResult> {
        let runner = self.base.runner("start_model_service").await?;
        self.pause("start-model-service").await;
        let result = OpResult::settle(runner.feed_start_model_service(model_spec).await)?;
        if !result.is_failed() {
            self.base.lifecycle().mark_serving()?;
        }
        Ok(result)
    }

    async fn shutdown_service(&self, name: &str) -> Result<OpResult> {
        let runner = self.base.runner("shutdown_service").await?;
        self.pause("shutdown-service").await;
        OpResult::settle(runner.feed_shutdown_service(name).await)
    }

    async fn get_service_apps(&self) -> Result<OpResult> {
        let runner = self.base.runner("get_service_apps").await?;
        self.pause("get-service-apps").await;
        OpResult::settle(runner.feed_service_apps().await)
    }

    async fn check_duplicate_commit(&self, _kernel_id: &KernelId, _subdir: &str) -> Result<CommitStatus> {
        self.pause("check-duplicate-commit").await;
        if self.base.commit_flag().is_ongoing() {
            return Ok(CommitStatus::Ongoing);
        }
        Ok(CommitStatus::Ready)
    }

    async fn commit(&self, kernel_id: &KernelId, subdir: &str, _opts: CommitOptions) -> Result<CommitOutcome> {
        self.base.ensure_open("commit")?;
        let Some(_guard) = self.base.commit_flag().try_begin() else {
            return Ok(CommitOutcome::AlreadyOngoing);
        };
        self.base
            .publish(KernelEvent::CommitStarted {
                kernel_id: kernel_id.clone(),
                subdir: subdir.to_string(),
            })
            .await;
        self.pause("commit").await;
        self.base
            .publish(KernelEvent::CommitFinished {
                kernel_id: kernel_id.clone(),
                subdir: subdir.to_string(),
                success: true,
            })
            .await;
        Ok(CommitOutcome::Committed {
            image_id: format!("dummy-{}", kernel_id),
        })
    }

    async fn accept_file(&self, container_path: &str, _data: Bytes) -> Result<()> {
        self.base.ensure_open("accept_file")?;
        confine_container_path(&self.ctx.config.container.home_dir, container_path)?;
        self.pause("accept-file").await;
        Ok(())
    }

    async fn download_file(&self, container_path: &str) -> Result<Bytes> {
        self.base.ensure_open("download_file")?;
        confine_container_path(&self.ctx.config.container.home_dir, container_path)?;
        self.pause("download-file").await;
        Ok(Bytes::new())
    }

    async fn download_single(&self, container_path: &str) -> Result<Bytes> {
        self.base.ensure_open("download_single")?;
        confine_container_path(&self.ctx.config.container.home_dir, container_path)?;
        self.pause("download-single").await;
        Ok(Bytes::new())
    }

    async fn list_files(&self, container_path: &str) -> Result<Value> {
        self.base.ensure_open("list_files")?;
        confine_container_path(&self.ctx.config.container.home_dir, container_path)?;
        self.pause("list-files").await;
        Ok(json!({"files": "[]", "errors": "", "abspath": container_path}))
    }

    async fn close(&self) -> Result<()> {
        if !self.base.lifecycle().begin_close() {
            return Ok(());
        }
        self.pause("destroy").await;
        self.base.close_runner().await;
        self.base.lifecycle().finish_close();
        self.base
            .publish(KernelEvent::Closed {
                kernel_id: self.base.kernel_id().clone(),
            })
            .await;
        Ok(())
    }
}
