//! Event publishing seam.
//!
//! Production wires a pub-sub topic client behind `EventPublisher`; the
//! in-process implementation is a broadcast bus that server-sent-event
//! consumers and tests subscribe to. Publishing is fire-and-forget — a
//! publish failure is logged, never propagated.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use autopilot_types::DomainEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent);
}

#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: DomainEvent) {
        debug!(
            event_type = event.event_type.as_str(),
            tenant_id = %event.tenant_id,
            "domain_event"
        );
        let _ = self.tx.send(event);
    }
}
