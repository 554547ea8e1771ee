//! Orchestrator-backed kernels.
//!
//! Each kernel owns a one-replica deployment named `kernel-<kernel_id>`.
//! Creating the code runner scales it up and waits for readiness; closing
//! scales it back to zero. Deleting the deployment is left to the manager.

pub mod api;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::process::collect_limited;
use super::{write_into_work_dir, BackendContext, LIST_FILES_SCRIPT};
use crate::events::KernelEvent;
use crate::kernel::{
    AbstractKernel, BackendType, ClientFeatures, CodeRunner, CommitOptions, CommitOutcome,
    CommitStatus, KernelBase, KernelCreationSpec, KernelState, OpResult,
};
use crate::types::{Error, KernelId, Result};
use crate::validation::confine_container_path;

pub use api::{
    is_scaled, ContainerStatus, DeploymentCondition, DeploymentStatus, KubectlOrchestrator,
    OrchestratorApi, PodStatus, ScaleStatus,
};

#[derive(Debug)]
pub struct KubernetesKernel {
    base: KernelBase,
    ctx: BackendContext,
    api: Arc<dyn OrchestratorApi>,
    deployment_name: String,
    /// Set once a scale-down to zero replicas has been acknowledged.
    scaled_down: AtomicBool,
}

impl KubernetesKernel {
    pub fn new(mut spec: KernelCreationSpec, ctx: BackendContext, api: Arc<dyn OrchestratorApi>) -> Self {
        if spec.kernel_host.is_empty() {
            spec.kernel_host = ctx.config.container.kernel_host.clone();
        }
        let deployment_name = format!("kernel-{}", spec.identity.kernel_id);
        Self {
            base: KernelBase::new(spec, BackendType::Kubernetes, KernelState::Created, ctx.events.clone()),
            ctx,
            api,
            deployment_name,
            scaled_down: AtomicBool::new(false),
        }
    }

    pub fn deployment_name(&self) -> &str {
        &self.deployment_name
    }

    pub fn label_selector(&self) -> String {
        format!("run={}", self.deployment_name)
    }

    fn namespace(&self) -> &str {
        &self.ctx.config.orchestrator.namespace
    }

    async fn scale(&self, replicas: u32) -> Result<ScaleStatus> {
        self.api
            .scale_deployment(self.namespace(), &self.deployment_name, replicas)
            .await
    }

    async fn is_scaled(&self) -> Result<bool> {
        let deployment = self.api.read_deployment(self.namespace(), &self.deployment_name).await?;
        if deployment.replicas == 0 {
            return Ok(false);
        }
        let pods = self.api.list_pods(self.namespace(), &self.label_selector()).await?;
        Ok(is_scaled(&deployment, &pods))
    }

    /// Poll until the deployment is ready. Unbounded; callers apply their
    /// own creation timeout.
    async fn wait_until_scaled(&self) -> Result<()> {
        let interval = self.ctx.config.orchestrator.readiness_poll_interval;
        while !self.is_scaled().await? {
            tokio::time::sleep(interval).await;
        }
        tracing::debug!("deployment_ready: deployment={}", self.deployment_name);
        Ok(())
    }

    async fn first_pod(&self) -> Result<String> {
        let pods = self.api.list_pods(self.namespace(), &self.label_selector()).await?;
        pods.into_iter()
            .next()
            .map(|pod| pod.name)
            .ok_or_else(|| Error::not_found(format!("no pod for {}", self.deployment_name)))
    }

    /// Accumulate the stdout of a remote exec, optionally capped at `limit` bytes.
    async fn exec_collect(&self, command: Vec<String>, limit: Option<u64>) -> Result<Bytes> {
        let pod = self.first_pod().await?;
        let mut stream = self.api.exec_stream(self.namespace(), &pod, &command).await?;
        if let Some(limit) = limit {
            return collect_limited(stream, limit).await;
        }
        let mut out = bytes::BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tracing::trace!("exec_stream_chunk: pod={} len={}", pod, chunk.len());
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Connect and perform the first status handshake, retrying transport
    /// errors with a quadratic backoff. Every retry reconnects on fresh
    /// sockets.
    async fn handshake(&self, runner: &Arc<CodeRunner>) -> Result<()> {
        let max_retries = self.ctx.config.orchestrator.handshake_max_retries;
        let mut retries: u32 = 0;
        loop {
            let attempt = async {
                runner.connect(self.ctx.transport.as_ref()).await?;
                runner.feed_and_get_status().await.map(|_| ())
            }
            .await;
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && retries < max_retries => {
                    runner.reset().await;
                    retries += 1;
                    tracing::debug!(
                        "repl_handshake_retry: kernel_id={} attempt={} error={}",
                        self.base.kernel_id(),
                        retries,
                        e
                    );
                    tokio::time::sleep(Duration::from_secs(u64::from(retries * retries))).await;
                }
                Err(e) => {
                    tracing::error!(
                        "repl_handshake_failed: kernel_id={} retries={} error={}",
                        self.base.kernel_id(),
                        retries,
                        e
                    );
                    runner.close().await;
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl AbstractKernel for KubernetesKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    async fn create_code_runner(
        &self,
        client_features: ClientFeatures,
        api_version: u32,
    ) -> Result<Arc<CodeRunner>> {
        self.base.ensure_open("create_code_runner")?;
        async {
            let scale = self.scale(1).await?;
            if scale.spec_replicas == 0 {
                tracing::error!("scale_failed: deployment={} status={:?}", self.deployment_name, scale);
                return Err(Error::backend(format!("scaling failed: {}", self.deployment_name)));
            }
            if scale.status_replicas == 0 {
                self.wait_until_scaled().await?;
            }

            let runner = Arc::new(CodeRunner::new(
                self.base.kernel_id().clone(),
                self.base.repl_endpoint(),
                0.0,
                client_features,
                api_version,
            )?);
            self.handshake(&runner).await?;
            Ok(runner)
        }
        .instrument(self.base.span().clone())
        .await
    }

    async fn get_logs(&self) -> Result<OpResult> {
        self.base.ensure_open("get_logs")?;
        let logs = async {
            let pod = self.first_pod().await?;
            self.api.read_pod_log(self.namespace(), &pod).await
        }
        .await;
        OpResult::settle(logs.map(|logs| json!({ "logs": logs })))
    }

    async fn check_duplicate_commit(&self, _kernel_id: &KernelId, _subdir: &str) -> Result<CommitStatus> {
        Ok(CommitStatus::Ready)
    }

    async fn commit(&self, _kernel_id: &KernelId, _subdir: &str, _opts: CommitOptions) -> Result<CommitOutcome> {
        Err(Error::not_implemented("commit on kubernetes kernels"))
    }

    async fn accept_file(&self, container_path: &str, data: Bytes) -> Result<()> {
        self.base.ensure_open("accept_file")?;
        write_into_work_dir(&self.ctx.config, self.base.kernel_id(), container_path, data).await
    }

    async fn download_file(&self, container_path: &str) -> Result<Bytes> {
        self.base.ensure_open("download_file")?;
        let resolved = confine_container_path(&self.ctx.config.container.home_dir, container_path)?;
        let command = vec!["tar".to_string(), "cf".to_string(), "-".to_string(), resolved];
        self.exec_collect(command, Some(self.ctx.config.limits.max_download_bytes))
            .await
    }

    async fn download_single(&self, _container_path: &str) -> Result<Bytes> {
        Err(Error::not_implemented("single-file download on kubernetes kernels"))
    }

    async fn list_files(&self, container_path: &str) -> Result<Value> {
        self.base.ensure_open("list_files")?;
        let resolved = confine_container_path(&self.ctx.config.container.home_dir, container_path)?;
        let command = vec![
            self.ctx.config.container.helper_python.clone(),
            "-c".to_string(),
            LIST_FILES_SCRIPT.to_string(),
            resolved,
        ];
        let stdout = self.exec_collect(command, None).await?;
        Ok(json!({
            "files": String::from_utf8_lossy(&stdout),
            "errors": "",
            "abspath": container_path,
        }))
    }

    async fn close(&self) -> Result<()> {
        let first = self.base.lifecycle().begin_close();
        if !first && self.scaled_down.load(Ordering::Acquire) {
            return Ok(());
        }
        if first {
            self.base.close_runner().await;
        }
        // A later close() retries the scale-down until it is acknowledged.
        let scaled = self.scale(0).instrument(self.base.span().clone()).await;
        if scaled.is_ok() {
            self.scaled_down.store(true, Ordering::Release);
        }
        if first {
            self.base.lifecycle().finish_close();
            self.base
                .publish(KernelEvent::Closed {
                    kernel_id: self.base.kernel_id().clone(),
                })
                .await;
        }
        match scaled {
            Ok(_) => {
                tracing::info!("kernel_closed: kernel_id={} deployment={}", self.base.kernel_id(), self.deployment_name);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("scale_down_failed: deployment={} error={}", self.deployment_name, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEventProducer;
    use crate::kernel::{ImageRef, KernelIdentity, KernelResourceSpec};
    use crate::repl::codec::{read_frame, write_frame, MAX_FRAME_BYTES};
    use crate::repl::{LoopbackTransport, ReplOp, TcpReplTransport};
    use crate::types::{AgentId, Config, SessionId};
    use futures::stream::BoxStream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    /// Scripted orchestrator: `read_deployment` pops readiness answers.
    #[derive(Debug, Default)]
    struct FakeApi {
        scale_calls: StdMutex<Vec<u32>>,
        spec_replicas_on_scale: Option<u32>,
        status_replicas_on_scale: u32,
        readiness: StdMutex<VecDeque<bool>>,
        polls: StdMutex<u32>,
        exec_commands: StdMutex<Vec<Vec<String>>>,
        /// Number of upcoming scale-to-zero calls that fail.
        fail_scale_down: AtomicU32,
    }

    #[async_trait]
    impl OrchestratorApi for FakeApi {
        async fn scale_deployment(&self, _ns: &str, _name: &str, replicas: u32) -> Result<ScaleStatus> {
            self.scale_calls.lock().unwrap().push(replicas);
            if replicas == 0
                && self
                    .fail_scale_down
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(Error::internal("apiserver unavailable"));
            }
            Ok(ScaleStatus {
                spec_replicas: self.spec_replicas_on_scale.unwrap_or(replicas),
                status_replicas: self.status_replicas_on_scale,
            })
        }

        async fn read_deployment(&self, _ns: &str, _name: &str) -> Result<DeploymentStatus> {
            *self.polls.lock().unwrap() += 1;
            let ready = self.readiness.lock().unwrap().pop_front().unwrap_or(true);
            Ok(DeploymentStatus {
                replicas: u32::from(ready),
                conditions: vec![DeploymentCondition {
                    kind: "Available".to_string(),
                    status: ready,
                }],
            })
        }

        async fn list_pods(&self, _ns: &str, _selector: &str) -> Result<Vec<PodStatus>> {
            Ok(vec![PodStatus {
                name: "kernel-pod-0".to_string(),
                container_statuses: vec![ContainerStatus {
                    name: "kernel".to_string(),
                    ready: true,
                    started: Some(true),
                }],
            }])
        }

        async fn read_pod_log(&self, _ns: &str, pod: &str) -> Result<String> {
            Ok(format!("log of {}", pod))
        }

        async fn exec_stream(
            &self,
            _ns: &str,
            _pod: &str,
            command: &[String],
        ) -> Result<BoxStream<'static, Result<Bytes>>> {
            self.exec_commands.lock().unwrap().push(command.to_vec());
            let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(b"[]"))];
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    fn spec() -> KernelCreationSpec {
        let identity = KernelIdentity {
            kernel_id: KernelId::new(),
            session_id: SessionId::new(),
            agent_id: AgentId::from_string("i-test".to_string()).unwrap(),
            image: ImageRef::parse("python:3.11", "x86_64", false).unwrap(),
            version: 1,
        };
        KernelCreationSpec::new(identity, KernelResourceSpec::new("pod"))
    }

    fn kernel(api: Arc<FakeApi>, transport: LoopbackTransport) -> KubernetesKernel {
        let ctx = BackendContext::new(
            Arc::new(Config::default()),
            Arc::new(transport),
            Arc::new(TracingEventProducer),
        );
        KubernetesKernel::new(spec(), ctx, api)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_polls_until_ready() {
        let api = Arc::new(FakeApi {
            readiness: StdMutex::new(VecDeque::from([false, false, true])),
            ..Default::default()
        });
        let kernel = kernel(api.clone(), LoopbackTransport::default());
        kernel.init().await.unwrap();
        assert_eq!(*api.polls.lock().unwrap(), 3);
        assert_eq!(*api.scale_calls.lock().unwrap(), vec![1]);
        assert_eq!(kernel.check_status().await.unwrap().to_value(), json!({}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_skips_polling_when_replicas_reported() {
        let api = Arc::new(FakeApi {
            status_replicas_on_scale: 1,
            ..Default::default()
        });
        let kernel = kernel(api.clone(), LoopbackTransport::default());
        kernel.init().await.unwrap();
        assert_eq!(*api.polls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_spec_replicas_is_scaling_failure() {
        let api = Arc::new(FakeApi {
            spec_replicas_on_scale: Some(0),
            ..Default::default()
        });
        let kernel = kernel(api, LoopbackTransport::default());
        let err = kernel.init().await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_retries_with_quadratic_backoff() {
        let api = Arc::new(FakeApi::default());
        let transport = LoopbackTransport::default().with_connect_failures(4);
        let kernel = kernel(api, transport.clone());
        let started = tokio::time::Instant::now();
        kernel.init().await.unwrap();
        assert_eq!(transport.attempts(), 5);
        // 1 + 4 + 9 + 16 seconds of backoff
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_gives_up_after_budget() {
        let api = Arc::new(FakeApi::default());
        let transport = LoopbackTransport::default().with_connect_failures(5);
        let kernel = kernel(api, transport.clone());
        let err = kernel.init().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(transport.attempts(), 5);
        assert!(matches!(kernel.check_status().await, Err(Error::StateTransition(_))));
    }

    /// TCP runner that drops the first (input, output) pair it accepts and
    /// answers every request with `{}` on later pairs.
    async fn runner_dropping_first_pair() -> (u16, u16, Arc<AtomicU32>) {
        let input = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let output = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let in_port = input.local_addr().unwrap().port();
        let out_port = output.local_addr().unwrap().port();
        let pairs = Arc::new(AtomicU32::new(0));
        let counter = pairs.clone();
        tokio::spawn(async move {
            loop {
                let Ok((req, _)) = input.accept().await else { break };
                let Ok((rep, _)) = output.accept().await else { break };
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    drop((req, rep));
                    continue;
                }
                tokio::spawn(async move {
                    let (mut req, mut rep) = (req, rep);
                    while let Ok(Some((op, _payload))) = read_frame(&mut req, MAX_FRAME_BYTES).await {
                        if write_frame(&mut rep, op, b"{}").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (in_port, out_port, pairs)
    }

    #[tokio::test]
    async fn test_handshake_reconnects_after_dropped_channel() {
        let (in_port, out_port, pairs) = runner_dropping_first_pair().await;
        let mut spec = spec();
        spec.kernel_host = "127.0.0.1".to_string();
        spec.repl_in_port = in_port;
        spec.repl_out_port = out_port;
        let ctx = BackendContext::new(
            Arc::new(Config::default()),
            Arc::new(TcpReplTransport),
            Arc::new(TracingEventProducer),
        );
        let api = Arc::new(FakeApi {
            status_replicas_on_scale: 1,
            ..Default::default()
        });
        let kernel = KubernetesKernel::new(spec, ctx, api);

        tokio::time::timeout(Duration::from_secs(10), kernel.init())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pairs.load(Ordering::SeqCst), 2);
        assert_eq!(kernel.check_status().await.unwrap().to_value(), json!({}));
        kernel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_completions_and_interrupt_are_wrapped() {
        let transport = LoopbackTransport::new(Arc::new(|op: ReplOp, _payload: &Value| -> Result<Value> {
            match op {
                ReplOp::Complete => Ok(json!(["print", "property"])),
                ReplOp::Interrupt => Ok(json!({"signal": "SIGINT"})),
                _ => Ok(json!({})),
            }
        }));
        let api = Arc::new(FakeApi {
            status_replicas_on_scale: 1,
            ..Default::default()
        });
        let kernel = kernel(api, transport);
        kernel.init().await.unwrap();

        assert_eq!(
            kernel.get_completions("pr", json!({})).await.unwrap().to_value(),
            json!({"status": "finished", "completions": ["print", "property"]})
        );
        assert_eq!(
            kernel.interrupt_kernel().await.unwrap().to_value(),
            json!({"status": "finished"})
        );
    }

    #[tokio::test]
    async fn test_close_scales_to_zero_once() {
        let api = Arc::new(FakeApi {
            status_replicas_on_scale: 1,
            ..Default::default()
        });
        let kernel = kernel(api.clone(), LoopbackTransport::default());
        kernel.init().await.unwrap();
        kernel.close().await.unwrap();
        kernel.close().await.unwrap();
        assert_eq!(*api.scale_calls.lock().unwrap(), vec![1, 0]);
        assert_eq!(kernel.state(), KernelState::Closed);
    }

    #[tokio::test]
    async fn test_close_retries_failed_scale_down() {
        let api = Arc::new(FakeApi {
            status_replicas_on_scale: 1,
            fail_scale_down: AtomicU32::new(1),
            ..Default::default()
        });
        let kernel = kernel(api.clone(), LoopbackTransport::default());
        kernel.init().await.unwrap();

        assert!(kernel.close().await.is_err());
        assert_eq!(kernel.state(), KernelState::Closed);
        kernel.close().await.unwrap();
        kernel.close().await.unwrap();
        assert_eq!(*api.scale_calls.lock().unwrap(), vec![1, 0, 0]);
    }

    #[tokio::test]
    async fn test_commit_and_single_download_unsupported() {
        let kernel = kernel(Arc::new(FakeApi::default()), LoopbackTransport::default());
        let kernel_id = kernel.kernel_id().clone();
        let err = kernel.commit(&kernel_id, "snap", CommitOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
        assert!(!err.is_retryable());
        assert!(matches!(kernel.download_single("a").await, Err(Error::NotImplemented(_))));
        assert_eq!(
            kernel.check_duplicate_commit(&kernel_id, "snap").await.unwrap(),
            CommitStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_file_ops_go_through_exec() {
        let api = Arc::new(FakeApi::default());
        let kernel = kernel(api.clone(), LoopbackTransport::default());

        let listing = kernel.list_files("src").await.unwrap();
        assert_eq!(listing, json!({"files": "[]", "errors": "", "abspath": "src"}));
        kernel.download_file("src").await.unwrap();

        let commands = api.exec_commands.lock().unwrap();
        assert_eq!(commands[0].last().unwrap(), "/home/work/src");
        assert_eq!(commands[1], vec!["tar", "cf", "-", "/home/work/src"]);

        let err = kernel.list_files("../../etc").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_logs_from_first_pod() {
        let kernel = kernel(Arc::new(FakeApi::default()), LoopbackTransport::default());
        assert_eq!(
            kernel.get_logs().await.unwrap().to_value(),
            json!({"logs": "log of kernel-pod-0"})
        );
        assert_eq!(kernel.label_selector(), format!("run=kernel-{}", kernel.kernel_id()));
    }
}
