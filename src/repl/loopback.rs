//! In-process REPL transport.
//!
//! Replies are produced by a responder function instead of a remote runner.
//! The simulated backend uses it for its canned channel, and tests use it to
//! script handshake failures without opening sockets.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::channel::{ReplChannel, ReplTransport};
use super::codec::ReplOp;
use crate::types::{Error, Result};

pub type Responder = Arc<dyn Fn(ReplOp, &Value) -> Result<Value> + Send + Sync>;

/// Canned replies matching what an idle kernel runner reports.
pub fn canned_reply(op: ReplOp, payload: &Value) -> Result<Value> {
    Ok(match op {
        ReplOp::Status => json!({}),
        ReplOp::Complete => json!([]),
        ReplOp::Interrupt => json!({}),
        ReplOp::StartService | ReplOp::StartModelService => json!({"status": "started"}),
        ReplOp::ShutdownService => json!({"status": "finished", "name": payload.get("name")}),
        ReplOp::ServiceApps => json!({"status": "done", "data": []}),
        ReplOp::Console => Value::Null,
    })
}

#[derive(Clone)]
pub struct LoopbackTransport {
    responder: Responder,
    pending_failures: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("pending_failures", &self.pending_failures.load(Ordering::Relaxed))
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(Arc::new(canned_reply))
    }
}

impl LoopbackTransport {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            pending_failures: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Refuse the next `n` connection attempts with a transport error.
    pub fn with_connect_failures(self, n: u32) -> Self {
        self.pending_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Number of `connect` calls so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplTransport for LoopbackTransport {
    async fn connect(&self, in_addr: &str, _out_addr: &str) -> Result<Arc<dyn ReplChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::transport(format!("connect {}: connection refused", in_addr)));
        }
        Ok(Arc::new(LoopbackChannel::new(self.responder.clone())))
    }
}

struct LoopbackChannel {
    responder: Responder,
    senders: HashMap<ReplOp, mpsc::UnboundedSender<Value>>,
    replies: HashMap<ReplOp, Mutex<mpsc::UnboundedReceiver<Value>>>,
    closed: AtomicBool,
}

impl fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoopbackChannel {
    fn new(responder: Responder) -> Self {
        let mut senders = HashMap::new();
        let mut replies = HashMap::new();
        for op in ReplOp::REQUESTS {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(op, tx);
            replies.insert(op, Mutex::new(rx));
        }
        Self {
            responder,
            senders,
            replies,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ReplChannel for LoopbackChannel {
    async fn send(&self, op: ReplOp, payload: &Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport("REPL channel closed"));
        }
        let reply = (self.responder)(op, payload)?;
        if let Some(tx) = self.senders.get(&op) {
            tx.send(reply)
                .map_err(|_| Error::transport("REPL channel closed"))?;
        }
        Ok(())
    }

    async fn recv(&self, op: ReplOp) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport("REPL channel closed"));
        }
        let queue = self
            .replies
            .get(&op)
            .ok_or_else(|| Error::validation(format!("{:?} has no reply queue", op)))?;
        queue
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::transport("REPL output closed"))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let transport = LoopbackTransport::default().with_connect_failures(2);
        assert!(transport.connect("tcp://h:1", "tcp://h:2").await.is_err());
        assert!(transport.connect("tcp://h:1", "tcp://h:2").await.is_err());
        let channel = transport.connect("tcp://h:1", "tcp://h:2").await.unwrap();
        assert_eq!(transport.attempts(), 3);

        channel.send(ReplOp::Status, &json!({})).await.unwrap();
        assert_eq!(channel.recv(ReplOp::Status).await.unwrap(), json!({}));
        channel.close().await;
        assert!(channel.send(ReplOp::Status, &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_custom_responder() {
        let transport = LoopbackTransport::new(Arc::new(|op: ReplOp, _payload: &Value| -> Result<Value> {
            match op {
                ReplOp::Status => Err(Error::transport("runner not started")),
                _ => Ok(json!({"ok": true})),
            }
        }));
        let channel = transport.connect("tcp://h:1", "tcp://h:2").await.unwrap();
        assert!(channel.send(ReplOp::Status, &json!({})).await.is_err());
        channel.send(ReplOp::Interrupt, &json!({})).await.unwrap();
        assert_eq!(channel.recv(ReplOp::Interrupt).await.unwrap()["ok"], true);
    }
}
