//! Event publication.
//!
//! Mutations record their events in the outbox inside the same transaction;
//! [`EventPublisher::relay`] moves them to the bus. An event whose publish
//! failed stays in the outbox and goes out on the next relay, so a mutation
//! never loses its event, even when the retried call finds nothing to change.
//!
//! Delivery is at-least-once: a publish that fails after the bus accepted the
//! event is sent again. Consumers dedupe on `event_id`, which is derived from
//! the causing operation.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::store::{bounded, EventOutbox};
use super::{metrics, ServiceError};
use crate::models::DomainEvent;

/// Events claimed from the outbox per round trip.
const RELAY_BATCH: usize = 64;

/// Transport for domain events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), ServiceError>;
}

/// Drains the [`EventOutbox`] into an [`EventBus`], each publish within a
/// deadline.
///
/// Failures are reported, never retried here: undelivered events stay in the
/// outbox for the next relay.
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    outbox: Arc<dyn EventOutbox>,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, outbox: Arc<dyn EventOutbox>, timeout: Duration) -> Self {
        Self {
            bus,
            outbox,
            timeout,
        }
    }

    /// Publish pending events oldest first until the outbox is empty or one
    /// fails. Returns how many were delivered.
    ///
    /// Claimed events are leased, so concurrent relays never send the same
    /// event at once. Delivered events are removed; on failure the rest of
    /// the batch is released and the error is returned.
    pub async fn relay(&self) -> Result<usize, ServiceError> {
        let lease = self.timeout * (RELAY_BATCH as u32 + 1);
        let mut delivered = 0;

        loop {
            let batch = self.outbox.claim_events(RELAY_BATCH, lease).await?;
            if batch.is_empty() {
                return Ok(delivered);
            }

            let mut published: Vec<Uuid> = Vec::with_capacity(batch.len());
            let mut failure = None;
            for event in &batch {
                match self.publish(event).await {
                    Ok(()) => published.push(event.event_id),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            self.outbox.complete_events(&published).await?;
            delivered += published.len();

            if let Some(e) = failure {
                let unsent: Vec<Uuid> = batch[published.len()..]
                    .iter()
                    .map(|event| event.event_id)
                    .collect();
                if let Err(release) = self.outbox.release_events(&unsent).await {
                    tracing::warn!(
                        error = %release,
                        pending = unsent.len(),
                        "Could not release claimed events; they return when the lease lapses"
                    );
                }
                return Err(e);
            }
            if batch.len() < RELAY_BATCH {
                return Ok(delivered);
            }
        }
    }

    /// Returns once the bus has durably accepted `event`. Any failure surfaces
    /// as `Unavailable("event bus")`; the state change that produced the event
    /// is not rolled back.
    pub async fn publish(&self, event: &DomainEvent) -> Result<(), ServiceError> {
        let event_type = event.event_type.as_str();
        match bounded("event bus", self.timeout, self.bus.publish(event)).await {
            Ok(()) => {
                metrics::record_publish(event_type, "ok");
                tracing::debug!(event_id = %event.event_id, event_type, "Event published");
                Ok(())
            }
            Err(e) => {
                metrics::record_publish(event_type, "failed");
                tracing::error!(
                    event_id = %event.event_id,
                    event_type,
                    error = %e,
                    "Event publish failed"
                );
                Err(match e {
                    ServiceError::Unavailable { component: "event bus", .. } => e,
                    other => ServiceError::unavailable("event bus", other),
                })
            }
        }
    }
}

/// Bus that records events in publish order. Can be switched to fail.
#[derive(Default)]
pub struct InMemoryBus {
    events: Mutex<Vec<DomainEvent>>,
    failing: Mutex<bool>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails as unavailable.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }

    pub fn published(&self) -> Vec<DomainEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, event: &DomainEvent) -> Result<(), ServiceError> {
        let failing = *self
            .failing
            .lock()
            .map_err(|e| anyhow::anyhow!("In-memory bus mutex poisoned: {}", e))?;
        if failing {
            return Err(ServiceError::unavailable("event bus", "bus is down"));
        }
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("In-memory bus mutex poisoned: {}", e))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DomainEventType;
    use crate::services::memory::MemoryStore;
    use crate::services::store::RefreshTokenStore;
    use chrono::Utc;

    struct StalledBus;

    #[async_trait]
    impl EventBus for StalledBus {
        async fn publish(&self, _event: &DomainEvent) -> Result<(), ServiceError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn event(op: Uuid) -> DomainEvent {
        DomainEvent::new(
            DomainEventType::RoleAssigned,
            Uuid::nil(),
            Uuid::nil(),
            op,
            serde_json::json!({}),
        )
    }

    fn publisher(bus: Arc<dyn EventBus>, timeout: Duration) -> (EventPublisher, Arc<MemoryStore>) {
        let outbox = Arc::new(MemoryStore::new());
        (EventPublisher::new(bus, outbox.clone(), timeout), outbox)
    }

    /// Record `events` the way a committed mutation would.
    async fn enqueue(outbox: &MemoryStore, events: &[DomainEvent]) {
        outbox
            .revoke_family(Uuid::new_v4(), Utc::now(), events)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn caller_retries_publish_duplicates_with_one_id() {
        let bus = Arc::new(InMemoryBus::new());
        let (publisher, _) = publisher(bus.clone(), Duration::from_secs(1));
        let op = Uuid::new_v4();

        publisher.publish(&event(op)).await.unwrap();
        publisher.publish(&event(op)).await.unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].event_id, published[1].event_id);
    }

    #[tokio::test]
    async fn failing_bus_surfaces_as_unavailable() {
        let bus = Arc::new(InMemoryBus::new());
        bus.set_failing(true);
        let (publisher, _) = publisher(bus.clone(), Duration::from_secs(1));

        let result = publisher.publish(&event(Uuid::new_v4())).await;

        assert!(matches!(
            result,
            Err(ServiceError::Unavailable { component: "event bus", .. })
        ));
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_bus_is_bounded_by_the_timeout() {
        let (publisher, _) = publisher(Arc::new(StalledBus), Duration::from_millis(50));

        let result = publisher.publish(&event(Uuid::new_v4())).await;

        assert!(matches!(
            result,
            Err(ServiceError::Unavailable { component: "event bus", .. })
        ));
    }

    #[tokio::test]
    async fn relay_drains_the_outbox_in_order() {
        let bus = Arc::new(InMemoryBus::new());
        let (publisher, outbox) = publisher(bus.clone(), Duration::from_secs(1));
        let events: Vec<_> = (0..3).map(|_| event(Uuid::new_v4())).collect();
        enqueue(&outbox, &events).await;

        assert_eq!(publisher.relay().await.unwrap(), 3);
        assert_eq!(publisher.relay().await.unwrap(), 0);

        let ids: Vec<_> = bus.published().iter().map(|e| e.event_id).collect();
        let expected: Vec<_> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn failed_relay_keeps_events_for_the_next_one() {
        let bus = Arc::new(InMemoryBus::new());
        let (publisher, outbox) = publisher(bus.clone(), Duration::from_secs(1));
        let pending = event(Uuid::new_v4());
        enqueue(&outbox, std::slice::from_ref(&pending)).await;

        bus.set_failing(true);
        assert!(matches!(
            publisher.relay().await,
            Err(ServiceError::Unavailable { component: "event bus", .. })
        ));

        bus.set_failing(false);
        assert_eq!(publisher.relay().await.unwrap(), 1);
        assert_eq!(publisher.relay().await.unwrap(), 0);

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_id, pending.event_id);
    }
}
