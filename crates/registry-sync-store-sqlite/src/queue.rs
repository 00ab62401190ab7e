use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use registry_sync_core::Channel;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{now_rfc3339, SqliteStore};

/// A message handed out by [`SqliteStore::lease_next`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedMessage {
    pub seq: i64,
    pub message_id: String,
    pub channel: Channel,
    pub body: String,
    pub delivery_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueueDepth {
    pub new: i64,
    pub changed: i64,
    pub leased: i64,
}

impl SqliteStore {
    /// Append one message to the durable delta queue.
    ///
    /// # Errors
    /// Returns an error when the insert fails, including a duplicate `message_id`.
    pub fn enqueue(&mut self, channel: Channel, message_id: &str, body: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO delta_queue(message_id, channel, body, enqueued_at, delivery_count)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![message_id, channel.as_str(), body, now_rfc3339()?],
            )
            .with_context(|| format!("failed to enqueue message {message_id}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Lease the oldest available message on any of `channels`.
    ///
    /// A leased message is invisible to other consumers until it is acked,
    /// released, or its lease expires; expiry makes it deliverable again.
    ///
    /// # Errors
    /// Returns an error when the queue cannot be read or the lease cannot be recorded.
    pub fn lease_next(
        &mut self,
        channels: &[Channel],
        lease: Duration,
    ) -> Result<Option<QueuedMessage>> {
        if channels.is_empty() {
            return Ok(None);
        }

        let now_ms = unix_millis(OffsetDateTime::now_utc());
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let channel_list = channels
            .iter()
            .map(|channel| format!("'{}'", channel.as_str()))
            .collect::<Vec<_>>()
            .join(",");

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start queue lease transaction")?;

        let candidate = tx
            .query_row(
                &format!(
                    "SELECT seq, message_id, channel, body, delivery_count
                     FROM delta_queue
                     WHERE channel IN ({channel_list})
                       AND (leased_until_ms IS NULL OR leased_until_ms <= ?1)
                     ORDER BY seq ASC
                     LIMIT 1"
                ),
                params![now_ms],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to read next queued message")?;

        let Some((seq, message_id, channel_raw, body, delivery_count)) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE delta_queue
             SET leased_until_ms = ?1, delivery_count = delivery_count + 1
             WHERE seq = ?2",
            params![now_ms.saturating_add(lease_ms), seq],
        )
        .with_context(|| format!("failed to lease queued message {message_id}"))?;
        tx.commit().context("failed to commit queue lease")?;

        let channel = Channel::parse(&channel_raw)
            .ok_or_else(|| anyhow!("unknown queue channel: {channel_raw}"))?;
        Ok(Some(QueuedMessage {
            seq,
            message_id,
            channel,
            body,
            delivery_count: delivery_count + 1,
        }))
    }

    /// Remove a delivered message permanently.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn ack(&mut self, seq: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM delta_queue WHERE seq = ?1", params![seq])
            .with_context(|| format!("failed to ack queued message {seq}"))?;
        Ok(removed == 1)
    }

    /// Return a leased message to the queue for immediate redelivery.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn release(&mut self, seq: i64) -> Result<bool> {
        let updated = self
            .conn
            .execute("UPDATE delta_queue SET leased_until_ms = NULL WHERE seq = ?1", params![seq])
            .with_context(|| format!("failed to release queued message {seq}"))?;
        Ok(updated == 1)
    }

    /// # Errors
    /// Returns an error when the queue cannot be counted.
    pub fn queue_depth(&self) -> Result<QueueDepth> {
        let now_ms = unix_millis(OffsetDateTime::now_utc());
        self.conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN channel = 'new' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN channel = 'changed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN leased_until_ms > ?1 THEN 1 ELSE 0 END), 0)
                 FROM delta_queue",
                params![now_ms],
                |row| {
                    Ok(QueueDepth { new: row.get(0)?, changed: row.get(1)?, leased: row.get(2)? })
                },
            )
            .context("failed to count queued messages")
    }
}

fn unix_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    // Test IDs: TQ-001
    #[test]
    fn lease_returns_messages_in_enqueue_order_across_channels() -> Result<()> {
        let mut store = store()?;
        store.enqueue(Channel::New, "m1", "{\"n\":1}")?;
        store.enqueue(Channel::Changed, "m2", "{\"n\":2}")?;
        store.enqueue(Channel::New, "m3", "{\"n\":3}")?;

        let mut seen = Vec::new();
        while let Some(message) = store.lease_next(&Channel::ALL, Duration::from_secs(30))? {
            seen.push((message.message_id.clone(), message.channel));
            assert!(store.ack(message.seq)?);
        }

        assert_eq!(
            seen,
            vec![
                ("m1".to_string(), Channel::New),
                ("m2".to_string(), Channel::Changed),
                ("m3".to_string(), Channel::New),
            ]
        );
        assert_eq!(store.queue_depth()?, QueueDepth::default());
        Ok(())
    }

    // Test IDs: TQ-002
    #[test]
    fn leased_message_is_hidden_until_released() -> Result<()> {
        let mut store = store()?;
        store.enqueue(Channel::New, "m1", "{}")?;

        let Some(first) = store.lease_next(&Channel::ALL, Duration::from_secs(30))? else {
            return Err(anyhow!("expected a leased message"));
        };
        assert_eq!(first.delivery_count, 1);
        assert!(store.lease_next(&Channel::ALL, Duration::from_secs(30))?.is_none());
        assert_eq!(store.queue_depth()?.leased, 1);

        assert!(store.release(first.seq)?);
        let Some(again) = store.lease_next(&Channel::ALL, Duration::from_secs(30))? else {
            return Err(anyhow!("expected released message to be redelivered"));
        };
        assert_eq!(again.message_id, "m1");
        assert_eq!(again.delivery_count, 2);
        Ok(())
    }

    // Test IDs: TQ-003
    #[test]
    fn expired_lease_is_redelivered() -> Result<()> {
        let mut store = store()?;
        store.enqueue(Channel::Changed, "m1", "{}")?;

        let first = store.lease_next(&Channel::ALL, Duration::ZERO)?;
        assert!(first.is_some());
        let second = store.lease_next(&Channel::ALL, Duration::from_secs(30))?;
        assert_eq!(second.map(|message| message.message_id), Some("m1".to_string()));
        Ok(())
    }

    // Test IDs: TQ-004
    #[test]
    fn lease_filters_by_channel_and_rejects_duplicate_ids() -> Result<()> {
        let mut store = store()?;
        store.enqueue(Channel::New, "m1", "{}")?;
        assert!(store.enqueue(Channel::New, "m1", "{}").is_err());

        assert!(store.lease_next(&[Channel::Changed], Duration::from_secs(30))?.is_none());
        assert!(store.lease_next(&[], Duration::from_secs(30))?.is_none());
        assert!(store.lease_next(&[Channel::New], Duration::from_secs(30))?.is_some());
        Ok(())
    }
}
