//! Message transport between the producer and the applier.
//!
//! Deliveries stay outstanding until acknowledged; the applier only acks
//! after the apply transaction has committed or been rolled back.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use registry_sync_core::{Channel, RemoteRecord};
use registry_sync_store_sqlite::{QueueDepth, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Wire body of every message on the `new` and `changed` channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaEnvelope {
    pub message_id: Ulid,
    pub channel: Channel,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    pub record: RemoteRecord,
}

impl DeltaEnvelope {
    #[must_use]
    pub fn new(channel: Channel, record: RemoteRecord) -> Self {
        Self { message_id: Ulid::new(), channel, published_at: OffsetDateTime::now_utc(), record }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-specific handle passed back to [`DeltaTransport::ack`].
    pub tag: i64,
    pub message_id: String,
    pub channel: Channel,
    pub body: String,
    pub redelivered: bool,
}

pub trait DeltaTransport {
    /// # Errors
    /// Returns an error when the message could not be handed to the transport.
    fn publish(&self, channel: Channel, message_id: &str, body: &str) -> Result<()>;

    /// Wait up to `timeout` for the next message on any channel.
    ///
    /// # Errors
    /// Returns an error when the transport cannot be read.
    fn receive(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// # Errors
    /// Returns an error when the acknowledgement cannot be recorded.
    fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Hand an unacknowledged delivery back for redelivery.
    ///
    /// # Errors
    /// Returns an error when the delivery cannot be requeued.
    fn release(&self, delivery: &Delivery) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryQueue {
    next_tag: i64,
    ready: VecDeque<Delivery>,
    unacked: BTreeMap<i64, Delivery>,
}

/// Process-local transport for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    queue: Mutex<MemoryQueue>,
    available: Condvar,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryQueue>> {
        self.queue.lock().map_err(|_| anyhow!("in-memory transport lock poisoned"))
    }

    /// # Errors
    /// Returns an error when the queue lock is poisoned.
    pub fn ready_len(&self) -> Result<usize> {
        Ok(self.lock()?.ready.len())
    }

    /// # Errors
    /// Returns an error when the queue lock is poisoned.
    pub fn unacked_len(&self) -> Result<usize> {
        Ok(self.lock()?.unacked.len())
    }

    /// Put every unacknowledged delivery back at the front of the queue,
    /// as a broker does when a consumer disconnects.
    ///
    /// # Errors
    /// Returns an error when the queue lock is poisoned.
    pub fn requeue_unacked(&self) -> Result<usize> {
        let mut queue = self.lock()?;
        let unacked = std::mem::take(&mut queue.unacked);
        let count = unacked.len();
        for (_, mut delivery) in unacked.into_iter().rev() {
            delivery.redelivered = true;
            queue.ready.push_front(delivery);
        }
        drop(queue);
        self.available.notify_all();
        Ok(count)
    }
}

impl DeltaTransport for InMemoryTransport {
    fn publish(&self, channel: Channel, message_id: &str, body: &str) -> Result<()> {
        let mut queue = self.lock()?;
        queue.next_tag += 1;
        let tag = queue.next_tag;
        queue.ready.push_back(Delivery {
            tag,
            message_id: message_id.to_string(),
            channel,
            body: body.to_string(),
            redelivered: false,
        });
        drop(queue);
        self.available.notify_one();
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock()?;

        loop {
            if let Some(delivery) = queue.ready.pop_front() {
                queue.unacked.insert(delivery.tag, delivery.clone());
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .available
                .wait_timeout(queue, deadline - now)
                .map_err(|_| anyhow!("in-memory transport lock poisoned"))?;
            queue = guard;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.lock()?.unacked.remove(&delivery.tag);
        Ok(())
    }

    fn release(&self, delivery: &Delivery) -> Result<()> {
        let mut queue = self.lock()?;
        if let Some(mut released) = queue.unacked.remove(&delivery.tag) {
            released.redelivered = true;
            queue.ready.push_front(released);
        }
        drop(queue);
        self.available.notify_one();
        Ok(())
    }
}

/// Durable transport backed by the `delta_queue` table.
///
/// Every call opens its own store handle so producer and applier processes
/// can share the queue file.
#[derive(Debug, Clone)]
pub struct SqliteTransport {
    queue_path: PathBuf,
    lease: Duration,
    poll_interval: Duration,
}

impl SqliteTransport {
    /// # Errors
    /// Returns an error when the queue database cannot be opened or migrated.
    pub fn open(queue_path: &Path, lease: Duration) -> Result<Self> {
        let mut store = SqliteStore::open(queue_path)?;
        store.migrate().context("failed to migrate delta queue database")?;
        Ok(Self {
            queue_path: queue_path.to_path_buf(),
            lease,
            poll_interval: Duration::from_millis(200),
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.queue_path)
    }

    /// # Errors
    /// Returns an error when the queue cannot be counted.
    pub fn depth(&self) -> Result<QueueDepth> {
        self.open_store()?.queue_depth()
    }
}

impl DeltaTransport for SqliteTransport {
    fn publish(&self, channel: Channel, message_id: &str, body: &str) -> Result<()> {
        self.open_store()?.enqueue(channel, message_id, body)?;
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;

        loop {
            let leased = self.open_store()?.lease_next(&Channel::ALL, self.lease)?;
            if let Some(message) = leased {
                return Ok(Some(Delivery {
                    tag: message.seq,
                    message_id: message.message_id,
                    channel: message.channel,
                    body: message.body,
                    redelivered: message.delivery_count > 1,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        if !self.open_store()?.ack(delivery.tag)? {
            tracing::warn!(
                message_id = %delivery.message_id,
                "acked message was already removed from the queue"
            );
        }
        Ok(())
    }

    fn release(&self, delivery: &Delivery) -> Result<()> {
        self.open_store()?.release(delivery.tag)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("registry-sync-queue-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    // Test IDs: TTRN-001
    #[test]
    fn envelope_carries_the_full_record() -> Result<()> {
        let mut record = RemoteRecord::new("2023/1234");
        record.name = Some("DOE".to_string());
        let envelope = DeltaEnvelope::new(Channel::Changed, record.clone());

        let body = serde_json::to_value(&envelope)?;
        assert_eq!(body["channel"], "changed");
        assert_eq!(body["record"]["entity_id"], "2023/1234");
        assert!(body["published_at"].is_string());

        let decoded: DeltaEnvelope = serde_json::from_value(body)?;
        assert_eq!(decoded.record, record);
        assert_eq!(decoded.message_id, envelope.message_id);
        Ok(())
    }

    // Test IDs: TTRN-002
    #[test]
    fn in_memory_transport_holds_deliveries_until_acked() -> Result<()> {
        let transport = InMemoryTransport::new();
        transport.publish(Channel::New, "m1", "{}")?;
        transport.publish(Channel::Changed, "m2", "{}")?;

        let Some(first) = transport.receive(Duration::ZERO)? else {
            return Err(anyhow!("expected first delivery"));
        };
        assert_eq!(first.message_id, "m1");
        assert_eq!(transport.unacked_len()?, 1);

        assert_eq!(transport.requeue_unacked()?, 1);
        let Some(again) = transport.receive(Duration::ZERO)? else {
            return Err(anyhow!("expected redelivery"));
        };
        assert_eq!(again.message_id, "m1");
        assert!(again.redelivered);
        transport.ack(&again)?;

        let Some(second) = transport.receive(Duration::ZERO)? else {
            return Err(anyhow!("expected second delivery"));
        };
        assert_eq!(second.channel, Channel::Changed);
        transport.ack(&second)?;

        assert!(transport.receive(Duration::from_millis(10))?.is_none());
        assert_eq!(transport.unacked_len()?, 0);
        Ok(())
    }

    // Test IDs: TTRN-003
    #[test]
    fn in_memory_receive_wakes_on_publish() -> Result<()> {
        let transport = Arc::new(InMemoryTransport::new());
        let publisher = Arc::clone(&transport);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish(Channel::New, "late", "{}")
        });

        let delivery = transport.receive(Duration::from_secs(5))?;
        assert_eq!(delivery.map(|d| d.message_id), Some("late".to_string()));
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("publisher thread panicked")),
        }
        Ok(())
    }

    // Test IDs: TTRN-004
    #[test]
    fn sqlite_transport_redelivers_unacked_messages() -> Result<()> {
        let path = unique_temp_db_path();
        let transport = SqliteTransport::open(&path, Duration::from_secs(30))?
            .with_poll_interval(Duration::from_millis(5));
        transport.publish(Channel::New, "m1", "{\"n\":1}")?;
        transport.publish(Channel::Changed, "m2", "{\"n\":2}")?;
        assert_eq!(transport.depth()?.new, 1);

        let Some(first) = transport.receive(Duration::ZERO)? else {
            return Err(anyhow!("expected first delivery"));
        };
        assert_eq!(first.message_id, "m1");
        assert!(!first.redelivered);

        transport.release(&first)?;
        let Some(again) = transport.receive(Duration::ZERO)? else {
            return Err(anyhow!("expected redelivery"));
        };
        assert_eq!(again.message_id, "m1");
        assert!(again.redelivered);
        transport.ack(&again)?;

        let Some(second) = transport.receive(Duration::ZERO)? else {
            return Err(anyhow!("expected second delivery"));
        };
        transport.ack(&second)?;
        assert!(transport.receive(Duration::from_millis(20))?.is_none());
        assert_eq!(transport.depth()?, QueueDepth::default());

        cleanup(&path);
        Ok(())
    }
}
