use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use registry_sync_core::{
    diff_entity, parse_decimal, parse_source_date, ArrestWarrantRow, AuditAction, ChangeLogEntry,
    ChangedDelta, CollectionKind, CollectionOp, CollectionRow, ColumnValue, EntityField, EntityFields,
    EntityId, FieldValue, LanguageRow, LogEntry, NationalityRow, PictureRow, RemoteRecord,
    StoredEntity, SyncError, ENTITY_TABLE,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod audit;
mod queue;

pub use audit::AuditCounters;
pub use queue::{QueueDepth, QueuedMessage};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entities (
  entity_id TEXT PRIMARY KEY,
  forename TEXT,
  name TEXT,
  sex_id TEXT,
  date_of_birth TEXT,
  place_of_birth TEXT,
  country_of_birth_id TEXT,
  weight TEXT,
  height TEXT,
  distinguishing_marks TEXT,
  eyes_colors_id TEXT,
  hairs_id TEXT,
  is_active INTEGER NOT NULL CHECK (is_active IN (0, 1)),
  thumbnail TEXT
);

CREATE TABLE IF NOT EXISTS entity_languages (
  language_id INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_id TEXT NOT NULL,
  languages_spoken_id TEXT,
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS entity_nationalities (
  nationality_id INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_id TEXT NOT NULL,
  nationality TEXT,
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS entity_arrest_warrants (
  arrest_warrant_id INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_id TEXT NOT NULL,
  issuing_country_id TEXT,
  charge TEXT,
  charge_translation TEXT,
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS entity_pictures (
  row_id INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_id TEXT NOT NULL,
  picture_id INTEGER NOT NULL,
  picture_url TEXT,
  picture_base64 TEXT,
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS change_log (
  log_id INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_id TEXT NOT NULL,
  table_name TEXT NOT NULL,
  field_name TEXT NOT NULL,
  old_value TEXT,
  new_value TEXT,
  description TEXT,
  change_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_log (
  log_id INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_id TEXT NOT NULL,
  table_name TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('Added','Deleted')),
  timestamp TEXT NOT NULL,
  column_data TEXT NOT NULL,
  description TEXT
);

CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name, entity_id);
CREATE INDEX IF NOT EXISTS idx_entity_languages_entity ON entity_languages(entity_id);
CREATE INDEX IF NOT EXISTS idx_entity_nationalities_entity ON entity_nationalities(entity_id);
CREATE INDEX IF NOT EXISTS idx_entity_arrest_warrants_entity ON entity_arrest_warrants(entity_id);
CREATE INDEX IF NOT EXISTS idx_entity_pictures_entity ON entity_pictures(entity_id, picture_id);
CREATE INDEX IF NOT EXISTS idx_change_log_entity ON change_log(entity_id);
CREATE INDEX IF NOT EXISTS idx_activity_log_entity ON activity_log(entity_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS delta_queue (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  message_id TEXT NOT NULL UNIQUE,
  channel TEXT NOT NULL CHECK (channel IN ('new','changed')),
  body TEXT NOT NULL,
  enqueued_at TEXT NOT NULL,
  leased_until_ms INTEGER,
  delivery_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_delta_queue_available ON delta_queue(leased_until_ms, seq);
";

const ENTITY_COLUMNS: &str = "entity_id, forename, name, sex_id, date_of_birth, place_of_birth, \
     country_of_birth_id, weight, height, distinguishing_marks, eyes_colors_id, hairs_id, \
     is_active, thumbnail";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Row and audit counts produced by one committed apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ApplyReport {
    pub entity_id: EntityId,
    pub fields_updated: usize,
    pub rows_added: usize,
    pub rows_deleted: usize,
    pub change_log_entries: usize,
    pub log_entries: usize,
}

impl ApplyReport {
    fn new(entity_id: &EntityId) -> Self {
        Self { entity_id: entity_id.clone(), ..Self::default() }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.fields_updated == 0 && self.rows_added == 0 && self.rows_deleted == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChangedApply {
    Applied(ApplyReport),
    Unchanged { entity_id: EntityId },
    Missing { entity_id: EntityId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitySummary {
    pub entity_id: EntityId,
    pub forename: Option<String>,
    pub name: Option<String>,
    pub sex_id: Option<String>,
    pub date_of_birth: Option<String>,
    pub is_active: bool,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityPage {
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub total_pages: i64,
    pub entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityDetail {
    pub entity_id: EntityId,
    pub fields: EntityFields,
    pub languages: Vec<LanguageRow>,
    pub nationalities: Vec<NationalityRow>,
    pub arrest_warrants: Vec<ArrestWarrantRow>,
    pub pictures: Vec<PictureRow>,
    pub change_log: Vec<ChangeLogEntry>,
    pub log: Vec<LogEntry>,
}

impl SqliteStore {
    /// Open a SQLite-backed registry store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration 002")?;
            record_schema_version(&tx, 2)?;
            tx.commit().context("failed to commit migration 002")?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "entities")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if !table_has_column(&self.conn, "entities", "is_active")? {
            return Err(anyhow!("database schema is invalid: entities has no is_active column"));
        }

        // Tables created before migrations were tracked; adopt them as version 1
        // and re-run the idempotent DDL to fill in any missing indexes.
        self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "delta_queue")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    /// Load the stored state of one entity with all of its collection rows.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_entity(&self, entity_id: &EntityId) -> Result<Option<StoredEntity>> {
        load_stored_entity(&self.conn, entity_id)
    }

    /// IDs of all entities currently flagged active, in key order.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn active_entity_ids(&self) -> Result<Vec<EntityId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_id FROM entities WHERE is_active = 1 ORDER BY entity_id ASC")
            .context("failed to prepare active entity query")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(EntityId(row?));
        }
        Ok(ids)
    }

    /// Apply transactions take the write lock up front so a commit from
    /// another connection cannot invalidate the snapshot they read from.
    fn write_transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")
    }

    /// Insert a previously unseen entity with all of its collection rows.
    ///
    /// Appends one `Added` log entry for the entity row and one per collection
    /// row. A duplicate `entity_id` rolls the whole insert back.
    ///
    /// # Errors
    /// Returns `SyncError::IntegrityViolation` (wrapped) on a constraint failure,
    /// `SyncError::MalformedDelta` when a field cannot be coerced, or a storage error.
    pub fn apply_unseen(&mut self, record: &RemoteRecord) -> Result<ApplyReport> {
        record.validate()?;
        let fields = record.entity_fields()?;
        let entity_id = &record.entity_id;
        let now = now_rfc3339()?;

        let tx = self.write_transaction()?;
        let mut report = ApplyReport::new(entity_id);

        let mut values = vec![SqlValue::Text(entity_id.0.clone())];
        values.extend(EntityField::ALL.into_iter().map(|field| sql_value(&field.value_of(&fields))));
        tx.execute(
            &format!(
                "INSERT INTO entities({ENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params_from_iter(values),
        )
        .map_err(|err| storage_error(err, &format!("failed to insert entity {entity_id}")))?;
        audit::record_row_event(
            &tx,
            entity_id,
            ENTITY_TABLE,
            AuditAction::Added,
            &fields.snapshot(entity_id),
            &now,
        )?;
        report.log_entries += 1;

        for row in record.all_rows() {
            insert_collection_row(&tx, entity_id, &row, &now)?;
            report.rows_added += 1;
            report.log_entries += 1;
        }

        tx.commit().context("failed to commit unseen entity")?;
        tracing::debug!(entity_id = %entity_id, rows = report.rows_added, "inserted unseen entity");
        Ok(report)
    }

    /// Recompute the delta for `record` against current storage and apply it,
    /// all inside one transaction.
    ///
    /// # Errors
    /// Returns `SyncError::MalformedDelta` or `SyncError::IntegrityViolation`
    /// (wrapped) and rolls back on any failure.
    pub fn apply_changed_record(&mut self, record: &RemoteRecord) -> Result<ChangedApply> {
        record.validate()?;
        let now = now_rfc3339()?;
        let tx = self.write_transaction()?;

        let Some(stored) = load_stored_entity(&tx, &record.entity_id)? else {
            return Ok(ChangedApply::Missing { entity_id: record.entity_id.clone() });
        };

        let delta = diff_entity(record, &stored)?;
        if delta.is_empty() {
            return Ok(ChangedApply::Unchanged { entity_id: record.entity_id.clone() });
        }

        let report = apply_changed_in(&tx, &delta, &now)?;
        tx.commit().context("failed to commit changed entity")?;
        Ok(ChangedApply::Applied(report))
    }

    /// Apply a precomputed delta, re-checking every field against its current
    /// stored value and skipping deletes whose row is already gone.
    ///
    /// # Errors
    /// Returns `SyncError::IntegrityViolation` (wrapped) when the entity is missing
    /// or a constraint fails; the transaction is rolled back.
    pub fn apply_changed_delta(&mut self, delta: &ChangedDelta) -> Result<ApplyReport> {
        let now = now_rfc3339()?;
        let tx = self.write_transaction()?;
        let report = apply_changed_in(&tx, delta, &now)?;
        tx.commit().context("failed to commit changed delta")?;
        Ok(report)
    }

    /// Soft-delete an entity that disappeared from the source.
    ///
    /// Writes exactly one change-log entry (`is_active` true to false) and no
    /// activity-log entry. Returns `false` when the entity is unknown or already inactive.
    ///
    /// # Errors
    /// Returns an error when the update or audit append fails.
    pub fn apply_vanished(&mut self, entity_id: &EntityId) -> Result<bool> {
        let now = now_rfc3339()?;
        let tx = self.write_transaction()?;

        let is_active = tx
            .query_row(
                "SELECT is_active FROM entities WHERE entity_id = ?1",
                params![entity_id.as_str()],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .with_context(|| format!("failed to read is_active for {entity_id}"))?;
        if is_active != Some(true) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE entities SET is_active = 0 WHERE entity_id = ?1",
            params![entity_id.as_str()],
        )
        .with_context(|| format!("failed to deactivate entity {entity_id}"))?;
        audit::record_field_change(
            &tx,
            entity_id,
            EntityField::IsActive.as_str(),
            Some("true"),
            Some("false"),
            &now,
        )?;

        tx.commit().context("failed to commit vanished entity")?;
        tracing::info!(entity_id = %entity_id, "entity vanished from source; marked inactive");
        Ok(true)
    }

    /// One page of entities ordered by name, then `entity_id`. Pages start at 1.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_entities(&self, page: u32, per_page: u32) -> Result<EntityPage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 500);
        let total = self
            .conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get::<_, i64>(0))
            .context("failed to count entities")?;
        let offset = i64::from(page - 1) * i64::from(per_page);

        let mut stmt = self
            .conn
            .prepare(
                "SELECT entity_id, forename, name, sex_id, date_of_birth, is_active, thumbnail
                 FROM entities
                 ORDER BY name ASC, entity_id ASC
                 LIMIT ?1 OFFSET ?2",
            )
            .context("failed to prepare entity listing")?;
        let rows = stmt.query_map(params![i64::from(per_page), offset], |row| {
            Ok(EntitySummary {
                entity_id: EntityId(row.get(0)?),
                forename: row.get(1)?,
                name: row.get(2)?,
                sex_id: row.get(3)?,
                date_of_birth: row.get(4)?,
                is_active: row.get(5)?,
                thumbnail: row.get(6)?,
            })
        })?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }

        let total_pages = if total == 0 { 0 } else { (total - 1) / i64::from(per_page) + 1 };
        Ok(EntityPage { page, per_page, total, total_pages, entities })
    }

    /// Full detail for one entity, including its audit history.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn entity_detail(&self, entity_id: &EntityId) -> Result<Option<EntityDetail>> {
        let Some(stored) = load_stored_entity(&self.conn, entity_id)? else {
            return Ok(None);
        };

        let mut detail = EntityDetail {
            entity_id: stored.entity_id,
            fields: stored.fields,
            languages: Vec::new(),
            nationalities: Vec::new(),
            arrest_warrants: Vec::new(),
            pictures: Vec::new(),
            change_log: audit::change_log_for(&self.conn, entity_id)?,
            log: audit::activity_log_for(&self.conn, entity_id)?,
        };
        for row in stored.rows {
            match row {
                CollectionRow::Language(row) => detail.languages.push(row),
                CollectionRow::Nationality(row) => detail.nationalities.push(row),
                CollectionRow::ArrestWarrant(row) => detail.arrest_warrants.push(row),
                CollectionRow::Picture(row) => detail.pictures.push(row),
            }
        }

        Ok(Some(detail))
    }

    /// # Errors
    /// Returns an error when the audit tables cannot be counted.
    pub fn audit_counters(&self) -> Result<AuditCounters> {
        audit::counters(&self.conn)
    }

    /// Write a consistent copy of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn apply_changed_in(conn: &Connection, delta: &ChangedDelta, now: &str) -> Result<ApplyReport> {
    let entity_id = &delta.entity_id;
    let Some(current) = load_entity_fields(conn, entity_id)? else {
        return Err(SyncError::IntegrityViolation(format!(
            "entity {entity_id} MUST exist before a changed delta is applied"
        ))
        .into());
    };
    let mut report = ApplyReport::new(entity_id);

    for field_delta in &delta.fields {
        let stored = field_delta.field.value_of(&current);
        if stored == field_delta.new {
            continue;
        }

        let column = field_delta.field.as_str();
        conn.execute(
            &format!("UPDATE entities SET {column} = ?1 WHERE entity_id = ?2"),
            params![sql_value(&field_delta.new), entity_id.as_str()],
        )
        .map_err(|err| storage_error(err, &format!("failed to update {entity_id}.{column}")))?;
        audit::record_field_change(
            conn,
            entity_id,
            column,
            stored.render().as_deref(),
            field_delta.new.render().as_deref(),
            now,
        )?;
        report.fields_updated += 1;
        report.change_log_entries += 1;
    }

    for collection_delta in &delta.collections {
        match collection_delta.op {
            CollectionOp::Add => {
                insert_collection_row(conn, entity_id, &collection_delta.row, now)?;
                report.rows_added += 1;
                report.log_entries += 1;
            }
            CollectionOp::Delete => {
                if delete_collection_row(conn, entity_id, &collection_delta.row, now)? {
                    report.rows_deleted += 1;
                    report.log_entries += 1;
                }
            }
        }
    }

    tracing::debug!(
        entity_id = %entity_id,
        fields = report.fields_updated,
        added = report.rows_added,
        deleted = report.rows_deleted,
        "applied changed delta"
    );
    Ok(report)
}

fn insert_collection_row(
    conn: &Connection,
    entity_id: &EntityId,
    row: &CollectionRow,
    now: &str,
) -> Result<()> {
    let schema = row.schema();
    let placeholders =
        (2..=schema.fields.len() + 1).map(|index| format!("?{index}")).collect::<Vec<_>>();
    let mut values = vec![SqlValue::Text(entity_id.0.clone())];
    values.extend(row.columns().iter().map(column_sql_value));

    conn.execute(
        &format!(
            "INSERT INTO {}(entity_id, {}) VALUES (?1, {})",
            schema.table,
            schema.fields.join(", "),
            placeholders.join(", ")
        ),
        params_from_iter(values),
    )
    .map_err(|err| storage_error(err, &format!("failed to insert {} row", schema.table)))?;

    audit::record_row_event(
        conn,
        entity_id,
        schema.table,
        AuditAction::Added,
        &row.snapshot(entity_id),
        now,
    )
}

/// Delete one stored row equal to `row` under its collection's identity policy.
/// The audit snapshot is taken from the row actually deleted.
fn delete_collection_row(
    conn: &Connection,
    entity_id: &EntityId,
    row: &CollectionRow,
    now: &str,
) -> Result<bool> {
    let schema = row.schema();
    let match_columns = schema.match_columns();
    let conditions = match_columns
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{column} IS ?{}", index + 2))
        .collect::<Vec<_>>();
    let mut values = vec![SqlValue::Text(entity_id.0.clone())];
    values.extend(schema.identity_key(row).iter().map(column_sql_value));

    let found = conn
        .query_row(
            &format!(
                "SELECT {}, {} FROM {} WHERE entity_id = ?1 AND {} ORDER BY {} ASC LIMIT 1",
                schema.surrogate_key,
                schema.fields.join(", "),
                schema.table,
                conditions.join(" AND "),
                schema.surrogate_key
            ),
            params_from_iter(values),
            |sql_row| {
                let surrogate = sql_row.get::<_, i64>(0)?;
                let mut columns = Vec::with_capacity(schema.fields.len());
                for index in 0..schema.fields.len() {
                    columns.push(column_value(sql_row.get::<_, SqlValue>(index + 1)?));
                }
                Ok((surrogate, columns))
            },
        )
        .optional()
        .with_context(|| format!("failed to locate {} row for delete", schema.table))?;

    let Some((surrogate, columns)) = found else {
        tracing::debug!(entity_id = %entity_id, table = schema.table, "row already absent; skipping delete");
        return Ok(false);
    };
    let existing = CollectionRow::from_columns(schema.kind, columns)?;

    conn.execute(
        &format!("DELETE FROM {} WHERE {} = ?1", schema.table, schema.surrogate_key),
        params![surrogate],
    )
    .map_err(|err| storage_error(err, &format!("failed to delete {} row", schema.table)))?;

    audit::record_row_event(
        conn,
        entity_id,
        schema.table,
        AuditAction::Deleted,
        &existing.snapshot(entity_id),
        now,
    )?;
    Ok(true)
}

fn load_stored_entity(conn: &Connection, entity_id: &EntityId) -> Result<Option<StoredEntity>> {
    let Some(fields) = load_entity_fields(conn, entity_id)? else {
        return Ok(None);
    };

    let mut rows = Vec::new();
    for kind in CollectionKind::ALL {
        rows.extend(load_collection_rows(conn, entity_id, kind)?);
    }

    Ok(Some(StoredEntity { entity_id: entity_id.clone(), fields, rows }))
}

fn load_entity_fields(conn: &Connection, entity_id: &EntityId) -> Result<Option<EntityFields>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = ?1"),
            params![entity_id.as_str()],
            |row| {
                Ok(RawEntityRow {
                    forename: row.get(1)?,
                    name: row.get(2)?,
                    sex_id: row.get(3)?,
                    date_of_birth: row.get(4)?,
                    place_of_birth: row.get(5)?,
                    country_of_birth_id: row.get(6)?,
                    weight: row.get(7)?,
                    height: row.get(8)?,
                    distinguishing_marks: row.get(9)?,
                    eyes_colors_id: row.get(10)?,
                    hairs_id: row.get(11)?,
                    is_active: row.get(12)?,
                    thumbnail: row.get(13)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to load entity {entity_id}"))?;

    raw.map(RawEntityRow::into_fields).transpose()
}

fn load_collection_rows(
    conn: &Connection,
    entity_id: &EntityId,
    kind: CollectionKind,
) -> Result<Vec<CollectionRow>> {
    let schema = kind.schema();
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM {} WHERE entity_id = ?1 ORDER BY {} ASC",
            schema.fields.join(", "),
            schema.table,
            schema.surrogate_key
        ))
        .with_context(|| format!("failed to prepare {} query", schema.table))?;
    let mut sql_rows = stmt.query(params![entity_id.as_str()])?;

    let mut rows = Vec::new();
    while let Some(sql_row) = sql_rows.next()? {
        let mut columns = Vec::with_capacity(schema.fields.len());
        for index in 0..schema.fields.len() {
            columns.push(column_value(sql_row.get::<_, SqlValue>(index)?));
        }
        rows.push(
            CollectionRow::from_columns(kind, columns)
                .with_context(|| format!("failed to decode {} row", schema.table))?,
        );
    }
    Ok(rows)
}

struct RawEntityRow {
    forename: Option<String>,
    name: Option<String>,
    sex_id: Option<String>,
    date_of_birth: Option<String>,
    place_of_birth: Option<String>,
    country_of_birth_id: Option<String>,
    weight: Option<String>,
    height: Option<String>,
    distinguishing_marks: Option<String>,
    eyes_colors_id: Option<String>,
    hairs_id: Option<String>,
    is_active: bool,
    thumbnail: Option<String>,
}

impl RawEntityRow {
    fn into_fields(self) -> Result<EntityFields> {
        Ok(EntityFields {
            forename: self.forename,
            name: self.name,
            sex_id: self.sex_id,
            date_of_birth: self.date_of_birth.as_deref().map(parse_source_date).transpose()?,
            place_of_birth: self.place_of_birth,
            country_of_birth_id: self.country_of_birth_id,
            weight: self.weight.as_deref().map(parse_decimal).transpose()?,
            height: self.height.as_deref().map(parse_decimal).transpose()?,
            distinguishing_marks: self.distinguishing_marks,
            eyes_colors_id: self.eyes_colors_id,
            hairs_id: self.hairs_id,
            is_active: self.is_active,
            thumbnail: self.thumbnail,
        })
    }
}

fn sql_value(value: &FieldValue) -> SqlValue {
    match value {
        FieldValue::Null => SqlValue::Null,
        FieldValue::Bool(value) => SqlValue::Integer(i64::from(*value)),
        other => other.render().map_or(SqlValue::Null, SqlValue::Text),
    }
}

fn column_sql_value(value: &ColumnValue) -> SqlValue {
    match value {
        ColumnValue::Null => SqlValue::Null,
        ColumnValue::Integer(value) => SqlValue::Integer(*value),
        ColumnValue::Text(value) => SqlValue::Text(value.clone()),
    }
}

fn column_value(value: SqlValue) -> ColumnValue {
    match value {
        SqlValue::Integer(value) => ColumnValue::Integer(value),
        SqlValue::Text(value) => ColumnValue::Text(value),
        SqlValue::Real(value) => ColumnValue::Text(value.to_string()),
        SqlValue::Null | SqlValue::Blob(_) => ColumnValue::Null,
    }
}

/// Constraint failures surface as `SyncError::IntegrityViolation` so callers
/// can tell a rejected delta from a broken store.
fn storage_error(err: rusqlite::Error, what: &str) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            return SyncError::IntegrityViolation(format!("{what}: {err}")).into();
        }
    }
    anyhow::Error::new(err).context(what.to_string())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "entities")? {
        return Ok((0, false));
    }

    if table_exists(conn, "delta_queue")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
