use anyhow::{Context, Result};
use registry_sync_core::{Channel, Delta, EntityId};
use ulid::Ulid;

use crate::transport::{DeltaEnvelope, DeltaTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub message_id: Ulid,
    pub channel: Channel,
    pub entity_id: EntityId,
}

/// Sends publishable deltas to a transport as [`DeltaEnvelope`] bodies.
pub struct DeltaPublisher<'a> {
    transport: &'a dyn DeltaTransport,
}

impl<'a> DeltaPublisher<'a> {
    #[must_use]
    pub fn new(transport: &'a dyn DeltaTransport) -> Self {
        Self { transport }
    }

    /// Publish `Unseen` on `new` and `Changed` on `changed`. Other deltas are
    /// not messages and yield `Ok(None)`.
    ///
    /// # Errors
    /// Returns an error when the envelope cannot be encoded or the transport rejects it.
    pub fn publish(&self, delta: Delta) -> Result<Option<PublishedMessage>> {
        let Some((channel, record)) = delta.into_message() else {
            return Ok(None);
        };
        let entity_id = record.entity_id.clone();
        let envelope = DeltaEnvelope::new(channel, record);
        let body = serde_json::to_string(&envelope).context("failed to encode delta envelope")?;
        let message_id = envelope.message_id.to_string();

        self.transport
            .publish(channel, &message_id, &body)
            .with_context(|| format!("failed to publish {} message for {entity_id}", channel.as_str()))?;

        tracing::debug!(
            entity_id = %entity_id,
            channel = channel.as_str(),
            message_id = %message_id,
            "published delta"
        );
        Ok(Some(PublishedMessage { message_id: envelope.message_id, channel, entity_id }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use registry_sync_core::{ChangedDelta, RemoteRecord};

    use super::*;
    use crate::transport::{Delivery, InMemoryTransport};

    struct RejectingTransport;

    impl DeltaTransport for RejectingTransport {
        fn publish(&self, _channel: Channel, _message_id: &str, _body: &str) -> Result<()> {
            Err(anyhow!("broker unavailable"))
        }

        fn receive(&self, _timeout: Duration) -> Result<Option<Delivery>> {
            Ok(None)
        }

        fn ack(&self, _delivery: &Delivery) -> Result<()> {
            Ok(())
        }

        fn release(&self, _delivery: &Delivery) -> Result<()> {
            Ok(())
        }
    }

    // Test IDs: TPUB-001
    #[test]
    fn unseen_and_changed_travel_on_their_channels() -> Result<()> {
        let transport = InMemoryTransport::new();
        let publisher = DeltaPublisher::new(&transport);
        let record = RemoteRecord::new("2023/1234");

        let Some(first) = publisher.publish(Delta::Unseen(record.clone()))? else {
            return Err(anyhow!("expected unseen delta to be published"));
        };
        assert_eq!(first.channel, Channel::New);

        let delta = ChangedDelta {
            entity_id: record.entity_id.clone(),
            fields: Vec::new(),
            collections: Vec::new(),
        };
        publisher.publish(Delta::Changed { record: record.clone(), delta })?;

        let Some(delivery) = transport.receive(Duration::ZERO)? else {
            return Err(anyhow!("expected a delivery"));
        };
        let envelope: DeltaEnvelope = serde_json::from_str(&delivery.body)?;
        assert_eq!(envelope.message_id, first.message_id);
        assert_eq!(envelope.record, record);
        assert_eq!(delivery.message_id, first.message_id.to_string());

        let Some(changed) = transport.receive(Duration::ZERO)? else {
            return Err(anyhow!("expected a changed delivery"));
        };
        assert_eq!(changed.channel, Channel::Changed);
        Ok(())
    }

    // Test IDs: TPUB-002
    #[test]
    fn unchanged_and_vanished_are_never_published() -> Result<()> {
        let transport = InMemoryTransport::new();
        let publisher = DeltaPublisher::new(&transport);

        assert!(publisher.publish(Delta::Unchanged { entity_id: EntityId::from("a") })?.is_none());
        assert!(publisher.publish(Delta::Vanished { entity_id: EntityId::from("a") })?.is_none());
        assert_eq!(transport.ready_len()?, 0);
        Ok(())
    }

    // Test IDs: TPUB-003
    #[test]
    fn transport_failure_surfaces_as_error() {
        let publisher = DeltaPublisher::new(&RejectingTransport);
        let result = publisher.publish(Delta::Unseen(RemoteRecord::new("a")));
        assert!(result.is_err());
    }
}
