use std::path::{Path, PathBuf};

use anyhow::Result;
use registry_sync_core::{classify, Delta, EntityId, RemoteRecord};
use registry_sync_store_sqlite::{
    AuditCounters, EntityDetail, EntityPage, IntegrityReport, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};

pub mod applier;
pub mod config;
pub mod fetch;
pub mod producer;
pub mod publisher;
pub mod query;
pub mod retry;
pub mod transport;

pub use applier::{ApplyOutcome, DeltaApplier, DrainReport};
pub use config::SyncConfig;
pub use fetch::{FileRecordSource, HttpRecordSource, RecordSource};
pub use producer::{run_cycle, CycleReport};
pub use query::{AuditPoll, AuditPoller};
pub use retry::FetchError;
pub use transport::{DeltaEnvelope, DeltaTransport, InMemoryTransport, SqliteTransport};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Read and admin facade over one registry database. Each call opens its own
/// store handle.
#[derive(Debug, Clone)]
pub struct RegistrySyncApi {
    db_path: PathBuf,
}

impl RegistrySyncApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.open_store()?.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn list_entities(&self, page: u32, per_page: u32) -> Result<EntityPage> {
        self.open_migrated()?.list_entities(page, per_page)
    }

    /// `Ok(None)` for an unknown `entity_id`.
    ///
    /// # Errors
    /// Returns an error when the detail query fails.
    pub fn entity_detail(&self, entity_id: &EntityId) -> Result<Option<EntityDetail>> {
        self.open_migrated()?.entity_detail(entity_id)
    }

    /// # Errors
    /// Returns an error when the audit tables cannot be counted.
    pub fn audit_counters(&self) -> Result<AuditCounters> {
        self.open_migrated()?.audit_counters()
    }

    /// Classify `record` against current storage without publishing or applying.
    ///
    /// # Errors
    /// Returns `SyncError` (wrapped) for invalid records, or a storage error.
    pub fn classify_record(&self, record: RemoteRecord) -> Result<Delta> {
        let store = self.open_migrated()?;
        let stored = store.load_entity(&record.entity_id)?;
        Ok(classify(record, stored.as_ref())?)
    }
}
