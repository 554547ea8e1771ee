//! Code runner: the addressed execution channel bound to one kernel.
//!
//! NOT-CONNECTED → CONNECTED → CLOSED. A connected runner keeps a background
//! status ping alive so idle NAT mappings between the agent and the kernel
//! do not expire. `reset()` drops a broken channel back to NOT-CONNECTED so
//! the next `connect()` opens fresh sockets.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::repl::{ReplChannel, ReplOp, ReplTransport};
use crate::types::{Error, KernelId, Result};

/// Protocol version spoken with in-container runners.
pub const DEFAULT_API_VERSION: u32 = 4;

/// Interval between keep-alive status pings.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Capability flags negotiated with the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFeatures {
    pub input: bool,
    pub continuation: bool,
}

impl Default for ClientFeatures {
    fn default() -> Self {
        Self {
            input: true,
            continuation: true,
        }
    }
}

impl ClientFeatures {
    /// Build from feature names; unknown names are ignored.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut features = Self {
            input: false,
            continuation: false,
        };
        for name in names {
            match name {
                "input" => features.input = true,
                "continuation" => features.continuation = true,
                other => tracing::debug!("client_feature_ignored: name={}", other),
            }
        }
        features
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.input {
            names.push("input");
        }
        if self.continuation {
            names.push("continuation");
        }
        names
    }
}

/// Host binding of the two REPL ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplEndpoint {
    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
}

#[derive(Debug)]
enum ChannelState {
    NotConnected,
    Connected {
        channel: Arc<dyn ReplChannel>,
        keep_alive: CancellationToken,
    },
    Closed,
}

#[derive(Debug)]
pub struct CodeRunner {
    kernel_id: KernelId,
    endpoint: ReplEndpoint,
    exec_timeout: Option<Duration>,
    client_features: ClientFeatures,
    api_version: u32,
    channel: Mutex<ChannelState>,
    request_lock: Mutex<()>,
}

impl CodeRunner {
    /// `exec_timeout` is in seconds; zero disables the timeout.
    pub fn new(
        kernel_id: KernelId,
        endpoint: ReplEndpoint,
        exec_timeout: f64,
        client_features: ClientFeatures,
        api_version: u32,
    ) -> Result<Self> {
        if !exec_timeout.is_finite() || exec_timeout < 0.0 {
            return Err(Error::validation(format!(
                "exec_timeout must be zero or a positive number, got {}",
                exec_timeout
            )));
        }
        crate::validation::validate_non_empty(&endpoint.kernel_host, "kernel_host")?;
        Ok(Self {
            kernel_id,
            endpoint,
            exec_timeout: (exec_timeout > 0.0).then(|| Duration::from_secs_f64(exec_timeout)),
            client_features,
            api_version,
            channel: Mutex::new(ChannelState::NotConnected),
            request_lock: Mutex::new(()),
        })
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    pub fn get_repl_in_addr(&self) -> String {
        format!("tcp://{}:{}", self.endpoint.kernel_host, self.endpoint.repl_in_port)
    }

    pub fn get_repl_out_addr(&self) -> String {
        format!("tcp://{}:{}", self.endpoint.kernel_host, self.endpoint.repl_out_port)
    }

    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout
    }

    pub fn client_features(&self) -> ClientFeatures {
        self.client_features
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.channel.lock().await, ChannelState::Connected { .. })
    }

    pub async fn is_closed(&self) -> bool {
        matches!(*self.channel.lock().await, ChannelState::Closed)
    }

    /// Open the channel and start the keep-alive ping. No-op when already connected.
    pub async fn connect(self: &Arc<Self>, transport: &dyn ReplTransport) -> Result<()> {
        let mut state = self.channel.lock().await;
        match *state {
            ChannelState::Connected { .. } => return Ok(()),
            ChannelState::Closed => {
                return Err(Error::state_transition("cannot connect a closed code runner"))
            }
            ChannelState::NotConnected => {}
        }
        let channel = transport
            .connect(&self.get_repl_in_addr(), &self.get_repl_out_addr())
            .await?;
        let keep_alive_token = CancellationToken::new();
        *state = ChannelState::Connected {
            channel,
            keep_alive: keep_alive_token.clone(),
        };
        drop(state);

        tokio::spawn(keep_alive(Arc::downgrade(self), keep_alive_token));
        tracing::debug!(
            "code_runner_connected: kernel_id={} in={} out={}",
            self.kernel_id,
            self.get_repl_in_addr(),
            self.get_repl_out_addr()
        );
        Ok(())
    }

    /// Idempotent. Stops the keep-alive ping and closes the channel.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.channel.lock().await, ChannelState::Closed);
        if let ChannelState::Connected { channel, keep_alive } = previous {
            keep_alive.cancel();
            channel.close().await;
            tracing::debug!("code_runner_closed: kernel_id={}", self.kernel_id);
        }
    }

    /// Close the current channel and return to NOT-CONNECTED. A closed
    /// runner stays closed.
    pub async fn reset(&self) {
        let mut state = self.channel.lock().await;
        if matches!(*state, ChannelState::Closed) {
            return;
        }
        let previous = std::mem::replace(&mut *state, ChannelState::NotConnected);
        drop(state);
        if let ChannelState::Connected { channel, keep_alive } = previous {
            keep_alive.cancel();
            channel.close().await;
            tracing::debug!("code_runner_reset: kernel_id={}", self.kernel_id);
        }
    }

    async fn connected_channel(&self) -> Result<Arc<dyn ReplChannel>> {
        match &*self.channel.lock().await {
            ChannelState::Connected { channel, .. } => Ok(channel.clone()),
            ChannelState::NotConnected => Err(Error::transport("code runner is not connected")),
            ChannelState::Closed => Err(Error::state_transition("code runner is closed")),
        }
    }

    async fn request(&self, op: ReplOp, payload: Value) -> Result<Value> {
        let channel = self.connected_channel().await?;
        let _serialized = self.request_lock.lock().await;
        channel.send(op, &payload).await?;
        channel.recv(op).await
    }

    pub async fn feed_and_get_status(&self) -> Result<Value> {
        self.request(ReplOp::Status, json!({})).await
    }

    pub async fn feed_and_get_completion(&self, text: &str, opts: Value) -> Result<Value> {
        self.request(ReplOp::Complete, json!({"code": text, "options": opts}))
            .await
    }

    pub async fn feed_interrupt(&self) -> Result<Value> {
        self.request(ReplOp::Interrupt, json!({})).await
    }

    pub async fn feed_start_service(&self, service_info: Value) -> Result<Value> {
        self.request(ReplOp::StartService, service_info).await
    }

    pub async fn feed_start_model_service(&self, model_info: Value) -> Result<Value> {
        self.request(ReplOp::StartModelService, model_info).await
    }

    pub async fn feed_shutdown_service(&self, name: &str) -> Result<Value> {
        self.request(ReplOp::ShutdownService, json!({"name": name}))
            .await
    }

    pub async fn feed_service_apps(&self) -> Result<Value> {
        self.request(ReplOp::ServiceApps, json!({})).await
    }
}

async fn keep_alive(runner: Weak<CodeRunner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL,
        KEEP_ALIVE_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(runner) = runner.upgrade() else { break };
        if let Err(e) = runner.feed_and_get_status().await {
            tracing::debug!("keep_alive_failed: kernel_id={} error={}", runner.kernel_id, e);
        }
    }
}
