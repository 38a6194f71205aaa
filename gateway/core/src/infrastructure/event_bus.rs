// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - Pub/Sub for Gateway Events
//
// In-memory fan-out of lifecycle events to the notification layer (alerting,
// chat integrations, SSE) using a tokio broadcast channel. Publishing is
// fire-and-forget: a slow or absent subscriber never blocks the publisher.

use crate::domain::events::{GatewayEvent, ResilienceEvent, ReviewEvent, RolloutEvent};
use crate::domain::tenant::TenantId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to gateway events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<GatewayEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Lagging subscribers lose the oldest events beyond this.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_review_event(&self, event: ReviewEvent) {
        self.publish(GatewayEvent::Review(event));
    }

    pub fn publish_rollout_event(&self, event: RolloutEvent) {
        self.publish(GatewayEvent::Rollout(event));
    }

    pub fn publish_resilience_event(&self, event: ResilienceEvent) {
        self.publish(GatewayEvent::Resilience(event));
    }

    fn publish(&self, event: GatewayEvent) {
        debug!("Publishing event: {}", event.summary());

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all gateway events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to one tenant's events. Tenant-less events (circuit
    /// transitions) are delivered to every tenant subscriber.
    pub fn subscribe_tenant(&self, tenant: TenantId) -> TenantEventReceiver {
        TenantEventReceiver {
            receiver: self.sender.subscribe(),
            tenant,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver for all gateway events
pub struct EventReceiver {
    receiver: broadcast::Receiver<GatewayEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<GatewayEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<GatewayEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one tenant
pub struct TenantEventReceiver {
    receiver: broadcast::Receiver<GatewayEvent>,
    tenant: TenantId,
}

impl TenantEventReceiver {
    pub async fn recv(&mut self) -> Result<GatewayEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            match event.tenant_id() {
                Some(tenant) if tenant != &self.tenant => continue,
                _ => return Ok(event),
            }
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule_version::SemanticVersion;
    use chrono::Utc;

    fn deployed(tenant: &str) -> RolloutEvent {
        RolloutEvent::CanaryDeployed {
            tenant_id: TenantId::new(tenant),
            version: SemanticVersion::new(0, 0, 1),
            percentage: 10,
            deployed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_rollout_event(deployed("acme"));

        match receiver.recv().await.unwrap() {
            GatewayEvent::Rollout(RolloutEvent::CanaryDeployed { percentage, .. }) => {
                assert_eq!(percentage, 10);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_tenant_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_tenant(TenantId::new("acme"));

        event_bus.publish_rollout_event(deployed("globex"));
        event_bus.publish_resilience_event(ResilienceEvent::CircuitOpened {
            channel: "reasoning".into(),
            consecutive_failures: 5,
            open_cycles: 1,
            opened_at: Utc::now(),
        });
        event_bus.publish_rollout_event(deployed("acme"));

        assert!(matches!(receiver.recv().await.unwrap(), GatewayEvent::Resilience(_)));
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.tenant_id(), Some(&TenantId::new("acme")));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let event_bus = EventBus::default();
        assert_eq!(event_bus.subscriber_count(), 0);
        event_bus.publish_rollout_event(deployed("acme"));
    }
}
