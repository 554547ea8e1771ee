//! Outbound kernel events.
//!
//! Kernels and the recovery loader publish through an `EventProducer`; the
//! host agent decides where events go (manager RPC, message bus, logs).

pub mod translation;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

use crate::types::{KernelId, SessionId};

pub use translation::event_payload;

/// Asynchronous kernel events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    Recovered {
        kernel_id: KernelId,
        session_id: SessionId,
    },
    RecoverySkipped {
        kernel_id: KernelId,
        reason: String,
    },
    CommitStarted {
        kernel_id: KernelId,
        subdir: String,
    },
    CommitFinished {
        kernel_id: KernelId,
        subdir: String,
        success: bool,
    },
    ServicePortsBlocked {
        kernel_id: KernelId,
        service: String,
    },
    Closed {
        kernel_id: KernelId,
    },
}

impl KernelEvent {
    pub fn kernel_id(&self) -> &KernelId {
        match self {
            KernelEvent::Recovered { kernel_id, .. }
            | KernelEvent::RecoverySkipped { kernel_id, .. }
            | KernelEvent::CommitStarted { kernel_id, .. }
            | KernelEvent::CommitFinished { kernel_id, .. }
            | KernelEvent::ServicePortsBlocked { kernel_id, .. }
            | KernelEvent::Closed { kernel_id } => kernel_id,
        }
    }
}

/// Sink for kernel events. Delivery is best-effort and never fails the
/// operation that produced the event.
#[async_trait]
pub trait EventProducer: Send + Sync + fmt::Debug {
    async fn produce(&self, event: KernelEvent);
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone)]
pub struct TracingEventProducer;

#[async_trait]
impl EventProducer for TracingEventProducer {
    async fn produce(&self, event: KernelEvent) {
        let (name, payload) = event_payload(&event);
        tracing::info!("kernel_event: name={} payload={}", name, payload);
    }
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventProducer {
    tx: mpsc::UnboundedSender<KernelEvent>,
}

impl ChannelEventProducer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<KernelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventProducer for ChannelEventProducer {
    async fn produce(&self, event: KernelEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event_dropped: receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_producer_delivers() {
        let (producer, mut rx) = ChannelEventProducer::new();
        let kernel_id = KernelId::new();
        producer
            .produce(KernelEvent::Closed {
                kernel_id: kernel_id.clone(),
            })
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kernel_id(), &kernel_id);
    }

    #[tokio::test]
    async fn test_channel_producer_tolerates_dropped_receiver() {
        let (producer, rx) = ChannelEventProducer::new();
        drop(rx);
        producer
            .produce(KernelEvent::Closed {
                kernel_id: KernelId::new(),
            })
            .await;
    }
}
