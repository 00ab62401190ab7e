//! Sequential consumer: one message, one fresh store handle, one transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use registry_sync_core::{Channel, EntityId, SyncError};
use registry_sync_store_sqlite::{ApplyReport, ChangedApply, SqliteStore};
use serde::{Deserialize, Serialize};

use crate::transport::{DeltaEnvelope, DeltaTransport, Delivery};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Inserted { report: ApplyReport },
    Updated { report: ApplyReport },
    Unchanged { entity_id: EntityId },
    /// Changed message for an entity that is not stored; the next fetch
    /// cycle classifies it as unseen.
    SkippedMissing { entity_id: EntityId },
    RolledBack { reason: String },
    Malformed { reason: String },
    Failed { reason: String },
}

impl ApplyOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::Updated { .. } => "updated",
            Self::Unchanged { .. } => "unchanged",
            Self::SkippedMissing { .. } => "skipped_missing",
            Self::RolledBack { .. } => "rolled_back",
            Self::Malformed { .. } => "malformed",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_missing: usize,
    pub rolled_back: usize,
    pub malformed: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn record(&mut self, outcome: &ApplyOutcome) {
        self.received += 1;
        let counter = match outcome {
            ApplyOutcome::Inserted { .. } => &mut self.inserted,
            ApplyOutcome::Updated { .. } => &mut self.updated,
            ApplyOutcome::Unchanged { .. } => &mut self.unchanged,
            ApplyOutcome::SkippedMissing { .. } => &mut self.skipped_missing,
            ApplyOutcome::RolledBack { .. } => &mut self.rolled_back,
            ApplyOutcome::Malformed { .. } => &mut self.malformed,
            ApplyOutcome::Failed { .. } => &mut self.failed,
        };
        *counter += 1;
    }
}

#[derive(Debug, Clone)]
pub struct DeltaApplier {
    db_path: PathBuf,
}

impl DeltaApplier {
    #[must_use]
    pub fn new(db_path: &Path) -> Self {
        Self { db_path: db_path.to_path_buf() }
    }

    /// Apply one message body received on `channel`.
    ///
    /// Never fails: every problem is folded into the returned outcome. Only
    /// `Failed` outcomes leave the message for redelivery.
    #[must_use]
    pub fn apply_message(&self, channel: Channel, body: &str) -> ApplyOutcome {
        let envelope = match serde_json::from_str::<DeltaEnvelope>(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                return ApplyOutcome::Malformed { reason: format!("undecodable envelope: {err}") }
            }
        };
        if envelope.channel != channel {
            return ApplyOutcome::Malformed {
                reason: format!(
                    "envelope for channel {} arrived on {}",
                    envelope.channel.as_str(),
                    channel.as_str()
                ),
            };
        }

        match self.apply_envelope(&envelope) {
            Ok(outcome) => outcome,
            Err(err) => classify_failure(&err),
        }
    }

    fn apply_envelope(&self, envelope: &DeltaEnvelope) -> Result<ApplyOutcome> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;

        match envelope.channel {
            Channel::New => {
                Ok(ApplyOutcome::Inserted { report: store.apply_unseen(&envelope.record)? })
            }
            Channel::Changed => Ok(match store.apply_changed_record(&envelope.record)? {
                ChangedApply::Applied(report) => ApplyOutcome::Updated { report },
                ChangedApply::Unchanged { entity_id } => ApplyOutcome::Unchanged { entity_id },
                ChangedApply::Missing { entity_id } => ApplyOutcome::SkippedMissing { entity_id },
            }),
        }
    }

    /// Receive and apply at most one message.
    ///
    /// Applied, rolled-back and malformed messages are acknowledged. A
    /// `Failed` outcome means the store itself was unusable, so the message
    /// is released back to the transport instead.
    ///
    /// # Errors
    /// Returns an error only when the transport itself fails.
    pub fn run_once(
        &self,
        transport: &dyn DeltaTransport,
        timeout: Duration,
    ) -> Result<Option<ApplyOutcome>> {
        let Some(delivery) = transport.receive(timeout)? else {
            return Ok(None);
        };

        let outcome = self.apply_message(delivery.channel, &delivery.body);
        log_outcome(&delivery, &outcome);
        if matches!(outcome, ApplyOutcome::Failed { .. }) {
            transport.release(&delivery)?;
        } else {
            transport.ack(&delivery)?;
        }
        Ok(Some(outcome))
    }

    /// Apply messages until none arrives within `timeout`, or until one
    /// fails and is left queued.
    ///
    /// # Errors
    /// Returns an error when the transport fails.
    pub fn drain(&self, transport: &dyn DeltaTransport, timeout: Duration) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        while let Some(outcome) = self.run_once(transport, timeout)? {
            report.record(&outcome);
            if matches!(outcome, ApplyOutcome::Failed { .. }) {
                tracing::warn!(received = report.received, "store unavailable; leaving remaining deltas queued");
                break;
            }
        }
        Ok(report)
    }
}

fn classify_failure(err: &anyhow::Error) -> ApplyOutcome {
    let reason = format!("{err:#}");
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::IntegrityViolation(_)) => ApplyOutcome::RolledBack { reason },
        Some(SyncError::MalformedDelta(_) | SyncError::Validation(_)) => {
            ApplyOutcome::Malformed { reason }
        }
        None => ApplyOutcome::Failed { reason },
    }
}

fn log_outcome(delivery: &Delivery, outcome: &ApplyOutcome) {
    let channel = delivery.channel.as_str();
    let message_id = delivery.message_id.as_str();
    match outcome {
        ApplyOutcome::Inserted { report } | ApplyOutcome::Updated { report } => tracing::info!(
            channel,
            message_id,
            entity_id = %report.entity_id,
            outcome = outcome.label(),
            fields = report.fields_updated,
            rows_added = report.rows_added,
            rows_deleted = report.rows_deleted,
            "applied delta"
        ),
        ApplyOutcome::Unchanged { entity_id } | ApplyOutcome::SkippedMissing { entity_id } => {
            tracing::info!(channel, message_id, entity_id = %entity_id, outcome = outcome.label(), "nothing to apply");
        }
        ApplyOutcome::RolledBack { reason } | ApplyOutcome::Malformed { reason } => {
            tracing::warn!(channel, message_id, outcome = outcome.label(), %reason, "dropped delta");
        }
        ApplyOutcome::Failed { reason } => {
            tracing::error!(channel, message_id, %reason, "failed to apply delta; released for redelivery");
        }
    }
}
