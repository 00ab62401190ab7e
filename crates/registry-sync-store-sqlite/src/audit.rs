//! Append-only audit trail: `change_log` for scalar field changes on the
//! entity table and `activity_log` for every inserted or deleted row.

use anyhow::{anyhow, Context, Result};
use registry_sync_core::{
    AuditAction, ChangeLogEntry, EntityId, LogEntry, ENTITY_TABLE, FIELD_CHANGE_DESCRIPTION,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parse_rfc3339;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AuditCounters {
    pub added_logs: i64,
    pub deleted_logs: i64,
    pub change_logs: i64,
}

/// Change-log rows only ever describe columns of the entity table.
pub(crate) fn record_field_change(
    conn: &Connection,
    entity_id: &EntityId,
    field_name: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO change_log(
            entity_id, table_name, field_name, old_value, new_value, description, change_date
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entity_id.as_str(),
            ENTITY_TABLE,
            field_name,
            old_value,
            new_value,
            FIELD_CHANGE_DESCRIPTION,
            at
        ],
    )
    .with_context(|| format!("failed to append change_log entry for {entity_id}.{field_name}"))?;
    Ok(())
}

pub(crate) fn record_row_event(
    conn: &Connection,
    entity_id: &EntityId,
    table_name: &str,
    action: AuditAction,
    column_data: &Value,
    at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO activity_log(entity_id, table_name, action, timestamp, column_data, description)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
        params![
            entity_id.as_str(),
            table_name,
            action.as_str(),
            at,
            serde_json::to_string(column_data).context("failed to serialize column snapshot")?,
        ],
    )
    .with_context(|| {
        format!("failed to append activity_log {} entry for {table_name}", action.as_str())
    })?;
    Ok(())
}

pub(crate) fn change_log_for(conn: &Connection, entity_id: &EntityId) -> Result<Vec<ChangeLogEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT log_id, entity_id, table_name, field_name, old_value, new_value, description, change_date
             FROM change_log
             WHERE entity_id = ?1
             ORDER BY log_id ASC",
        )
        .context("failed to prepare change_log query")?;
    let mut rows = stmt.query(params![entity_id.as_str()])?;
    let mut entries = Vec::new();

    while let Some(row) = rows.next()? {
        let change_date: String = row.get(7)?;
        entries.push(ChangeLogEntry {
            log_id: row.get(0)?,
            entity_id: EntityId(row.get(1)?),
            table_name: row.get(2)?,
            field_name: row.get(3)?,
            old_value: row.get(4)?,
            new_value: row.get(5)?,
            description: row.get(6)?,
            change_date: parse_rfc3339(&change_date)?,
        });
    }

    Ok(entries)
}

pub(crate) fn activity_log_for(conn: &Connection, entity_id: &EntityId) -> Result<Vec<LogEntry>> {
    let mut stmt = conn
        .prepare(
            "SELECT log_id, entity_id, table_name, action, timestamp, column_data, description
             FROM activity_log
             WHERE entity_id = ?1
             ORDER BY log_id ASC",
        )
        .context("failed to prepare activity_log query")?;
    let mut rows = stmt.query(params![entity_id.as_str()])?;
    let mut entries = Vec::new();

    while let Some(row) = rows.next()? {
        let action_raw: String = row.get(3)?;
        let timestamp: String = row.get(4)?;
        let column_data: String = row.get(5)?;
        entries.push(LogEntry {
            log_id: row.get(0)?,
            entity_id: EntityId(row.get(1)?),
            table_name: row.get(2)?,
            action: AuditAction::parse(&action_raw)
                .ok_or_else(|| anyhow!("unknown activity_log action: {action_raw}"))?,
            timestamp: parse_rfc3339(&timestamp)?,
            column_data: serde_json::from_str(&column_data)
                .context("failed to deserialize column snapshot")?,
            description: row.get(6)?,
        });
    }

    Ok(entries)
}

pub(crate) fn counters(conn: &Connection) -> Result<AuditCounters> {
    let (added_logs, deleted_logs) = conn
        .query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN action = 'Added' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN action = 'Deleted' THEN 1 ELSE 0 END), 0)
             FROM activity_log",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .context("failed to count activity_log entries")?;
    let change_logs = conn
        .query_row("SELECT COUNT(*) FROM change_log", [], |row| row.get::<_, i64>(0))
        .context("failed to count change_log entries")?;

    Ok(AuditCounters { added_logs, deleted_logs, change_logs })
}
