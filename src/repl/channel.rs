//! TCP REPL channel: one connection for requests, one for replies.
//!
//! A reader task drains the output connection and routes each reply to the
//! queue of its op, so callers awaiting different ops never steal each
//! other's replies.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::codec::{read_frame, write_frame, ReplOp, MAX_FRAME_BYTES};
use crate::types::{Error, Result};

/// Replies buffered per op before the reader applies backpressure.
const REPLY_QUEUE_DEPTH: usize = 128;

/// Connected request/reply channel to a kernel runner.
#[async_trait]
pub trait ReplChannel: Send + Sync + std::fmt::Debug {
    async fn send(&self, op: ReplOp, payload: &Value) -> Result<()>;

    /// Next reply for `op`. Fails with a transport error once the channel is gone.
    async fn recv(&self, op: ReplOp) -> Result<Value>;

    async fn close(&self);
}

/// Opens REPL channels from `tcp://host:port` addresses.
#[async_trait]
pub trait ReplTransport: Send + Sync + std::fmt::Debug {
    async fn connect(&self, in_addr: &str, out_addr: &str) -> Result<Arc<dyn ReplChannel>>;
}

/// Strip the `tcp://` scheme from a REPL address.
pub fn socket_addr(addr: &str) -> Result<&str> {
    addr.strip_prefix("tcp://")
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| Error::validation(format!("unsupported REPL address: {}", addr)))
}

#[derive(Debug, Default, Clone)]
pub struct TcpReplTransport;

#[async_trait]
impl ReplTransport for TcpReplTransport {
    async fn connect(&self, in_addr: &str, out_addr: &str) -> Result<Arc<dyn ReplChannel>> {
        let input = TcpStream::connect(socket_addr(in_addr)?)
            .await
            .map_err(|e| Error::transport(format!("connect {}: {}", in_addr, e)))?;
        let output = TcpStream::connect(socket_addr(out_addr)?)
            .await
            .map_err(|e| Error::transport(format!("connect {}: {}", out_addr, e)))?;
        input.set_nodelay(true)?;
        Ok(Arc::new(TcpReplChannel::spawn(input, output)))
    }
}

#[derive(Debug)]
pub struct TcpReplChannel {
    writer: Mutex<TcpStream>,
    replies: HashMap<ReplOp, Mutex<mpsc::Receiver<Value>>>,
    cancel: CancellationToken,
}

impl TcpReplChannel {
    fn spawn(input: TcpStream, output: TcpStream) -> Self {
        let mut senders = HashMap::new();
        let mut replies = HashMap::new();
        for op in ReplOp::REQUESTS {
            let (tx, rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
            senders.insert(op, tx);
            replies.insert(op, Mutex::new(rx));
        }
        let cancel = CancellationToken::new();
        tokio::spawn(route_replies(output, senders, cancel.clone()));
        Self {
            writer: Mutex::new(input),
            replies,
            cancel,
        }
    }
}

async fn route_replies(
    mut output: TcpStream,
    senders: HashMap<ReplOp, mpsc::Sender<Value>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut output, MAX_FRAME_BYTES) => frame,
        };
        let (op, payload) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("repl_output_closed");
                break;
            }
            Err(e) => {
                tracing::warn!("repl_output_failed: error={}", e);
                break;
            }
        };
        let Some(op) = ReplOp::from_u8(op) else {
            tracing::warn!("repl_unknown_op: op=0x{:02X}", op);
            continue;
        };
        if op == ReplOp::Console {
            tracing::trace!("repl_console: bytes={}", payload.len());
            continue;
        }
        let value: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("repl_bad_reply: op={:?} error={}", op, e);
                continue;
            }
        };
        if let Some(tx) = senders.get(&op) {
            if tx.send(value).await.is_err() {
                break;
            }
        }
    }
    // Dropping the senders wakes every pending recv with a closed channel.
}

#[async_trait]
impl ReplChannel for TcpReplChannel {
    async fn send(&self, op: ReplOp, payload: &Value) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::transport("REPL channel closed"));
        }
        let body = serde_json::to_vec(payload)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, op as u8, &body)
            .await
            .map_err(|e| Error::transport(format!("REPL send failed: {}", e)))
    }

    async fn recv(&self, op: ReplOp) -> Result<Value> {
        let queue = self
            .replies
            .get(&op)
            .ok_or_else(|| Error::validation(format!("{:?} has no reply queue", op)))?;
        let mut rx = queue.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::transport("REPL channel closed")),
            reply = rx.recv() => reply.ok_or_else(|| Error::transport("REPL output closed")),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
