//! One fetch-classify-publish cycle followed by the vanished sweep.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use registry_sync_core::{classify, vanished_ids, Delta, EntityId};
use registry_sync_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};

use crate::fetch::RecordSource;
use crate::publisher::DeltaPublisher;
use crate::transport::DeltaTransport;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub pages: u32,
    pub fetched: usize,
    pub unseen: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub published: usize,
    pub publish_failures: usize,
    pub malformed: usize,
    pub vanished: usize,
    /// Set when a malformed record made the fetched id set untrustworthy.
    pub sweep_skipped: bool,
}

/// Run one producer cycle against `db_path`.
///
/// Every page is fetched before the sweep, so a fetch failure aborts the
/// cycle without deactivating anything.
///
/// # Errors
/// Returns an error when the source fails for the cycle or the store cannot be read.
pub fn run_cycle(
    db_path: &Path,
    nationality: &str,
    source: &mut dyn RecordSource,
    transport: &dyn DeltaTransport,
) -> Result<CycleReport> {
    let mut store = SqliteStore::open(db_path)?;
    store.migrate()?;
    let publisher = DeltaPublisher::new(transport);
    let mut report = CycleReport::default();
    let mut fetched_ids = BTreeSet::<EntityId>::new();

    tracing::info!(nationality, "starting producer cycle");

    let mut page = 1;
    loop {
        let fetched = source
            .fetch_page(nationality, page)
            .with_context(|| format!("fetch of page {page} failed; cycle aborted without sweep"))?;
        let Some(fetched) = fetched else {
            break;
        };
        report.pages += 1;

        for rejected in &fetched.rejected {
            tracing::warn!(reference = %rejected.reference, reason = %rejected.reason, "unusable source record");
            report.malformed += 1;
        }

        for record in fetched.records {
            report.fetched += 1;
            let entity_id = record.entity_id.clone();
            let stored = store.load_entity(&entity_id)?;

            let delta = match classify(record, stored.as_ref()) {
                Ok(delta) => delta,
                Err(err) => {
                    tracing::warn!(entity_id = %entity_id, error = %err, "skipping malformed record");
                    report.malformed += 1;
                    continue;
                }
            };
            fetched_ids.insert(entity_id.clone());

            match &delta {
                Delta::Unseen(_) => report.unseen += 1,
                Delta::Changed { .. } => report.changed += 1,
                Delta::Unchanged { .. } => {
                    report.unchanged += 1;
                    continue;
                }
                Delta::Vanished { .. } => continue,
            }

            match publisher.publish(delta) {
                Ok(_) => report.published += 1,
                Err(err) => {
                    let error = format!("{err:#}");
                    tracing::error!(entity_id = %entity_id, %error, "publish failed");
                    report.publish_failures += 1;
                }
            }
        }

        if fetched.is_last {
            break;
        }
        page += 1;
    }

    if report.malformed > 0 {
        tracing::warn!(malformed = report.malformed, "vanished sweep skipped for this cycle");
        report.sweep_skipped = true;
    } else {
        let active = store.active_entity_ids()?;
        for entity_id in vanished_ids(&active, &fetched_ids) {
            if store.apply_vanished(&entity_id)? {
                report.vanished += 1;
            }
        }
    }

    tracing::info!(
        fetched = report.fetched,
        unseen = report.unseen,
        changed = report.changed,
        unchanged = report.unchanged,
        vanished = report.vanished,
        publish_failures = report.publish_failures,
        "producer cycle finished"
    );
    Ok(report)
}
