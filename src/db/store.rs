//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use rusqlite::Result as SqlResult;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const CONTROLLER_COLUMNS: &str = "id, name, address, rack, slot, gateway, enabled";
const TAG_COLUMNS: &str = "id, controller_id, name, db_number, byte_offset, bit_offset, tag_type, \
     length, interval_ms, only_on_change, enabled, subsystem, description";
const DEFINITION_COLUMNS: &str = "id, controller_id, word_name, db_number, byte_offset, bit_offset, \
     site, subsystem, description, severity, enabled, created_at, updated_at";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // --- Controllers ---

    pub fn list_controllers(&self) -> Result<Vec<Controller>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM controllers ORDER BY name",
            CONTROLLER_COLUMNS
        ))?;
        let controllers = stmt
            .query_map([], controller_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(controllers)
    }

    pub fn get_controller(&self, id: i64) -> Result<Controller, DbError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM controllers WHERE id = ?1", CONTROLLER_COLUMNS),
            params![id],
            controller_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Add a new controller and return its ID.
    pub fn create_controller(&self, controller: &mut Controller) -> Result<i64, DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO controllers (name, address, rack, slot, gateway, enabled) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                controller.name,
                controller.address,
                controller.rack,
                controller.slot,
                controller.gateway,
                controller.enabled,
            ],
        )?;
        controller.id = conn.last_insert_rowid();
        Ok(controller.id)
    }

    pub fn update_controller(&self, controller: &Controller) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE controllers SET name=?1, address=?2, rack=?3, slot=?4, gateway=?5, enabled=?6 WHERE id=?7",
            params![
                controller.name,
                controller.address,
                controller.rack,
                controller.slot,
                controller.gateway,
                controller.enabled,
                controller.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Delete a controller; its tags, definitions, statuses and history cascade.
    pub fn delete_controller(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM controllers WHERE id = ?1", params![id])? == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Tags ---

    pub fn list_tags(&self, controller_id: i64) -> Result<Vec<Tag>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tags WHERE controller_id = ?1 ORDER BY name",
            TAG_COLUMNS
        ))?;
        let tags = stmt
            .query_map(params![controller_id], tag_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(tags)
    }

    pub fn get_tag(&self, id: i64) -> Result<Tag, DbError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM tags WHERE id = ?1", TAG_COLUMNS),
            params![id],
            tag_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn create_tag(&self, tag: &mut Tag) -> Result<i64, DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tags (controller_id, name, db_number, byte_offset, bit_offset, tag_type, length, \
             interval_ms, only_on_change, enabled, subsystem, description) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                tag.controller_id,
                tag.name,
                tag.db_number,
                tag.byte_offset,
                tag.bit_offset,
                tag.tag_type.as_str(),
                tag.length,
                tag.interval_ms,
                tag.only_on_change,
                tag.enabled,
                tag.subsystem,
                tag.description,
            ],
        )
        .map_err(|e| missing_parent(e, "controller", tag.controller_id))?;
        tag.id = conn.last_insert_rowid();
        Ok(tag.id)
    }

    pub fn update_tag(&self, tag: &Tag) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tags SET name=?1, db_number=?2, byte_offset=?3, bit_offset=?4, tag_type=?5, length=?6, \
             interval_ms=?7, only_on_change=?8, enabled=?9, subsystem=?10, description=?11, controller_id=?12 \
             WHERE id=?13",
            params![
                tag.name,
                tag.db_number,
                tag.byte_offset,
                tag.bit_offset,
                tag.tag_type.as_str(),
                tag.length,
                tag.interval_ms,
                tag.only_on_change,
                tag.enabled,
                tag.subsystem,
                tag.description,
                tag.controller_id,
                tag.id,
            ],
        )
        .map_err(|e| missing_parent(e, "controller", tag.controller_id))?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn delete_tag(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM tags WHERE id = ?1", params![id])? == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Fault definitions ---

    pub fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<FaultDefinition>, DbError> {
        let mut sql = format!("SELECT {} FROM fault_definitions WHERE 1=1", DEFINITION_COLUMNS);
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(site) = &filter.site {
            sql.push_str(" AND site = ?");
            args.push(SqlValue::Text(site.clone()));
        }
        if let Some(subsystem) = &filter.subsystem {
            sql.push_str(" AND subsystem = ?");
            args.push(SqlValue::Text(subsystem.clone()));
        }
        if let Some(controller_id) = filter.controller_id {
            sql.push_str(" AND controller_id = ?");
            args.push(SqlValue::Integer(controller_id));
        }
        if let Some(enabled) = filter.enabled {
            sql.push_str(" AND enabled = ?");
            args.push(SqlValue::Integer(enabled as i64));
        }
        sql.push_str(" ORDER BY site, subsystem, word_name, bit_offset");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let defs = stmt
            .query_map(params_from_iter(args.iter()), definition_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(defs)
    }

    pub fn get_definition(&self, id: i64) -> Result<FaultDefinition, DbError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM fault_definitions WHERE id = ?1", DEFINITION_COLUMNS),
            params![id],
            definition_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Add a definition, rejecting a second definition for the same bit.
    pub fn create_definition(&self, def: &mut FaultDefinition) -> Result<i64, DbError> {
        let conn = self.conn.lock();
        insert_definition(&conn, def)
    }

    /// Update a definition; moving it onto a bit another definition owns is a conflict.
    pub fn update_definition(&self, def: &mut FaultDefinition) -> Result<(), DbError> {
        let conn = self.conn.lock();
        if let Some(other) = definition_at(&conn, def)? {
            if other != def.id {
                return Err(bit_taken(def));
            }
        }

        def.updated_at = Utc::now();
        let changed = conn
            .execute(
                "UPDATE fault_definitions SET word_name=?1, db_number=?2, byte_offset=?3, bit_offset=?4, \
                 site=?5, subsystem=?6, description=?7, severity=?8, enabled=?9, updated_at=?10, \
                 controller_id=?11 WHERE id=?12",
                params![
                    def.word_name,
                    def.db_number,
                    def.byte_offset,
                    def.bit_offset,
                    def.site,
                    def.subsystem,
                    def.description,
                    def.severity.as_str(),
                    def.enabled,
                    fmt_time(&def.updated_at),
                    def.controller_id,
                    def.id,
                ],
            )
            .map_err(|e| match unique_conflict(e, def) {
                DbError::Sqlite(e) => missing_parent(e, "controller", def.controller_id),
                other => other,
            })?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn delete_definition(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM fault_definitions WHERE id = ?1", params![id])? == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Insert many definitions in one transaction, skipping rows that collide
    /// or fail and reporting why.
    pub fn import_definitions(&self, defs: &mut [FaultDefinition]) -> Result<ImportReport, DbError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let mut report = ImportReport::default();

        for def in defs.iter_mut() {
            match insert_definition(&tx, def) {
                Ok(_) => report.inserted += 1,
                Err(DbError::Conflict(msg)) => report.errors.push(msg),
                Err(DbError::NotFound) => report.errors.push(format!(
                    "controller {} does not exist ({} bit {})",
                    def.controller_id, def.word_name, def.bit_offset
                )),
                Err(e) => report.errors.push(format!("{}: {}", def.word_name, e)),
            }
        }

        tx.commit()?;
        Ok(report)
    }

    pub fn sites(&self) -> Result<Vec<String>, DbError> {
        self.distinct("site")
    }

    pub fn subsystems(&self) -> Result<Vec<String>, DbError> {
        self.distinct("subsystem")
    }

    fn distinct(&self, column: &str) -> Result<Vec<String>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT {0} FROM fault_definitions WHERE {0} <> '' ORDER BY {0}",
            column
        ))?;
        let values = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        Ok(values)
    }

    // --- Fault status and history ---

    pub fn active_statuses(&self) -> Result<Vec<FaultStatus>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT fault_id, active, started_at, acknowledged, acknowledged_by, acknowledged_by_name, acknowledged_at \
             FROM fault_status WHERE active = 1",
        )?;
        let statuses = stmt
            .query_map([], status_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(statuses)
    }

    pub fn get_status(&self, fault_id: i64) -> Result<Option<FaultStatus>, DbError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT fault_id, active, started_at, acknowledged, acknowledged_by, acknowledged_by_name, acknowledged_at \
                 FROM fault_status WHERE fault_id = ?1",
                params![fault_id],
                status_from_row,
            )
            .optional()?)
    }

    /// Apply a batch of transitions atomically.
    ///
    /// Activation clears any acknowledgement; deactivation keeps it and copies it
    /// into the history row it appends.
    pub fn commit_fault_transitions(&self, transitions: &[FaultTransition]) -> Result<(), DbError> {
        if transitions.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let now = fmt_time(&Utc::now());

        {
            let mut activate = tx.prepare(
                "INSERT INTO fault_status (fault_id, active, started_at, acknowledged) VALUES (?1, 1, ?2, 0) \
                 ON CONFLICT(fault_id) DO UPDATE SET active = 1, started_at = excluded.started_at, \
                 acknowledged = 0, acknowledged_by = NULL, acknowledged_by_name = NULL, acknowledged_at = NULL",
            )?;
            let mut archive = tx.prepare(
                "INSERT INTO fault_history (fault_id, started_at, ended_at, duration_seconds, acknowledged, \
                 acknowledged_by, acknowledged_by_name, acknowledged_at, created_at) \
                 SELECT ?1, ?2, ?3, ?4, COALESCE(s.acknowledged, 0), s.acknowledged_by, s.acknowledged_by_name, \
                 s.acknowledged_at, ?5 FROM (SELECT 1) LEFT JOIN fault_status s ON s.fault_id = ?1",
            )?;
            let mut deactivate = tx.prepare(
                "INSERT INTO fault_status (fault_id, active, started_at, acknowledged) VALUES (?1, 0, NULL, 0) \
                 ON CONFLICT(fault_id) DO UPDATE SET active = 0, started_at = NULL",
            )?;

            for t in transitions {
                match t {
                    FaultTransition::Activated { fault_id, at } => {
                        activate.execute(params![fault_id, fmt_time(at)])?;
                    }
                    FaultTransition::Deactivated {
                        fault_id,
                        started_at,
                        ended_at,
                    } => {
                        let duration = (*ended_at - *started_at).num_seconds().max(0);
                        archive.execute(params![
                            fault_id,
                            fmt_time(started_at),
                            fmt_time(ended_at),
                            duration,
                            now,
                        ])?;
                        deactivate.execute(params![fault_id])?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Record an acknowledgement; returns false when the fault is not active.
    pub fn acknowledge_fault(&self, fault_id: i64, ack: &Acknowledgement) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE fault_status SET acknowledged = 1, acknowledged_by = ?1, acknowledged_by_name = ?2, \
             acknowledged_at = ?3 WHERE fault_id = ?4 AND active = 1",
            params![ack.by, ack.by_name, fmt_time(&ack.at), fault_id],
        )?;
        Ok(changed > 0)
    }

    pub fn active_faults(&self) -> Result<Vec<ActiveFault>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT fd.id, fd.controller_id, c.name, fd.word_name, fd.db_number, fd.byte_offset, fd.bit_offset, \
             fd.site, fd.subsystem, fd.description, fd.severity, fs.started_at, \
             fs.acknowledged, fs.acknowledged_by, fs.acknowledged_by_name, fs.acknowledged_at \
             FROM fault_status fs \
             JOIN fault_definitions fd ON fs.fault_id = fd.id \
             JOIN controllers c ON fd.controller_id = c.id \
             WHERE fs.active = 1 \
             ORDER BY fs.started_at DESC",
        )?;
        let faults = stmt
            .query_map([], |row| {
                Ok(ActiveFault {
                    fault_id: row.get(0)?,
                    controller_id: row.get(1)?,
                    controller_name: row.get(2)?,
                    word_name: row.get(3)?,
                    db_number: row.get(4)?,
                    byte_offset: row.get(5)?,
                    bit_offset: row.get(6)?,
                    site: row.get(7)?,
                    subsystem: row.get(8)?,
                    description: row.get(9)?,
                    severity: text_enum(row, 10)?,
                    started_at: opt_time(row, 11)?,
                    acknowledgement: ack_from_row(row, 12)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(faults)
    }

    pub fn fault_history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, DbError> {
        let mut sql = String::from(
            "SELECT fh.id, fh.fault_id, fh.started_at, fh.ended_at, fh.duration_seconds, \
             fh.acknowledged, fh.acknowledged_by, fh.acknowledged_by_name, fh.acknowledged_at, \
             fh.notes, fh.created_at, \
             fd.controller_id, fd.word_name, fd.bit_offset, fd.site, fd.subsystem, fd.description, fd.severity \
             FROM fault_history fh JOIN fault_definitions fd ON fh.fault_id = fd.id WHERE 1=1",
        );
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(site) = &filter.site {
            sql.push_str(" AND fd.site = ?");
            args.push(SqlValue::Text(site.clone()));
        }
        if let Some(subsystem) = &filter.subsystem {
            sql.push_str(" AND fd.subsystem = ?");
            args.push(SqlValue::Text(subsystem.clone()));
        }
        if let Some(start) = &filter.start {
            sql.push_str(" AND fh.ended_at >= ?");
            args.push(SqlValue::Text(fmt_time(start)));
        }
        if let Some(end) = &filter.end {
            sql.push_str(" AND fh.started_at <= ?");
            args.push(SqlValue::Text(fmt_time(end)));
        }
        sql.push_str(" ORDER BY fh.started_at DESC, fh.id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(HistoryEntry {
                    history: FaultHistory {
                        id: row.get(0)?,
                        fault_id: row.get(1)?,
                        started_at: req_time(row, 2)?,
                        ended_at: req_time(row, 3)?,
                        duration_seconds: row.get(4)?,
                        acknowledgement: ack_from_row(row, 5)?,
                        notes: row.get(9)?,
                        created_at: req_time(row, 10)?,
                    },
                    controller_id: row.get(11)?,
                    word_name: row.get(12)?,
                    bit_offset: row.get(13)?,
                    site: row.get(14)?,
                    subsystem: row.get(15)?,
                    description: row.get(16)?,
                    severity: text_enum(row, 17)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(entries)
    }
}

fn insert_definition(conn: &Connection, def: &mut FaultDefinition) -> Result<i64, DbError> {
    if definition_at(conn, def)?.is_some() {
        return Err(bit_taken(def));
    }

    let now = Utc::now();
    def.created_at = now;
    def.updated_at = now;
    conn.execute(
        "INSERT INTO fault_definitions (controller_id, word_name, db_number, byte_offset, bit_offset, \
         site, subsystem, description, severity, enabled, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            def.controller_id,
            def.word_name,
            def.db_number,
            def.byte_offset,
            def.bit_offset,
            def.site,
            def.subsystem,
            def.description,
            def.severity.as_str(),
            def.enabled,
            fmt_time(&now),
            fmt_time(&now),
        ],
    )
    .map_err(|e| match unique_conflict(e, def) {
        DbError::Sqlite(e) => missing_parent(e, "controller", def.controller_id),
        other => other,
    })?;
    def.id = conn.last_insert_rowid();
    Ok(def.id)
}

fn definition_at(conn: &Connection, def: &FaultDefinition) -> Result<Option<i64>, DbError> {
    Ok(conn
        .query_row(
            "SELECT id FROM fault_definitions \
             WHERE controller_id = ?1 AND db_number = ?2 AND byte_offset = ?3 AND bit_offset = ?4",
            params![def.controller_id, def.db_number, def.byte_offset, def.bit_offset],
            |row| row.get(0),
        )
        .optional()?)
}

fn bit_taken(def: &FaultDefinition) -> DbError {
    DbError::Conflict(format!(
        "controller {} already has a definition for DB{} byte {} bit {}",
        def.controller_id, def.db_number, def.byte_offset, def.bit_offset
    ))
}

/// The pre-check and the UNIQUE index can disagree only under a race; both
/// surface as the same conflict.
fn unique_conflict(e: rusqlite::Error, def: &FaultDefinition) -> DbError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            bit_taken(def)
        }
        _ => DbError::Sqlite(e),
    }
}

fn missing_parent(e: rusqlite::Error, what: &str, id: i64) -> DbError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            tracing::debug!("insert references missing {} {}", what, id);
            DbError::NotFound
        }
        _ => DbError::Sqlite(e),
    }
}

// --- Row mapping ---

fn controller_from_row(row: &Row<'_>) -> SqlResult<Controller> {
    Ok(Controller {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        rack: row.get(3)?,
        slot: row.get(4)?,
        gateway: row.get(5)?,
        enabled: row.get(6)?,
    })
}

fn tag_from_row(row: &Row<'_>) -> SqlResult<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        controller_id: row.get(1)?,
        name: row.get(2)?,
        db_number: row.get(3)?,
        byte_offset: row.get(4)?,
        bit_offset: row.get(5)?,
        tag_type: text_enum(row, 6)?,
        length: row.get(7)?,
        interval_ms: row.get(8)?,
        only_on_change: row.get(9)?,
        enabled: row.get(10)?,
        subsystem: row.get(11)?,
        description: row.get(12)?,
    })
}

fn definition_from_row(row: &Row<'_>) -> SqlResult<FaultDefinition> {
    Ok(FaultDefinition {
        id: row.get(0)?,
        controller_id: row.get(1)?,
        word_name: row.get(2)?,
        db_number: row.get(3)?,
        byte_offset: row.get(4)?,
        bit_offset: row.get(5)?,
        site: row.get(6)?,
        subsystem: row.get(7)?,
        description: row.get(8)?,
        severity: text_enum(row, 9)?,
        enabled: row.get(10)?,
        created_at: req_time(row, 11)?,
        updated_at: req_time(row, 12)?,
    })
}

fn status_from_row(row: &Row<'_>) -> SqlResult<FaultStatus> {
    Ok(FaultStatus {
        fault_id: row.get(0)?,
        active: row.get(1)?,
        started_at: opt_time(row, 2)?,
        acknowledgement: ack_from_row(row, 3)?,
    })
}

/// Reads `acknowledged, by, by_name, at` starting at `idx`.
fn ack_from_row(row: &Row<'_>, idx: usize) -> SqlResult<Option<Acknowledgement>> {
    let acknowledged: bool = row.get(idx)?;
    if !acknowledged {
        return Ok(None);
    }
    Ok(Some(Acknowledgement {
        by: row.get::<_, Option<i64>>(idx + 1)?.unwrap_or_default(),
        by_name: row.get::<_, Option<String>>(idx + 2)?.unwrap_or_default(),
        at: opt_time(row, idx + 3)?.unwrap_or_else(Utc::now),
    }))
}

fn text_enum<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_time(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) => parse_db_time(&s).map(Some).ok_or_else(|| bad_time(idx, &s)),
        None => Ok(None),
    }
}

fn req_time(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| bad_time(idx, &raw))
}

fn bad_time(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unparseable timestamp {:?}", raw).into(),
    )
}

/// Format a timestamp the way every time column is stored.
pub fn fmt_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = ["%Y-%m-%d %H:%M:%S%.9f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TagType;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn controller(store: &Store) -> i64 {
        let mut c = Controller {
            name: "Lock 1".to_string(),
            address: "sim://lock-1".to_string(),
            ..Default::default()
        };
        store.create_controller(&mut c).unwrap()
    }

    fn definition(controller_id: i64, bit: u8) -> FaultDefinition {
        FaultDefinition {
            controller_id,
            word_name: "DB_FAULTS_W0".to_string(),
            db_number: 100,
            byte_offset: 0,
            bit_offset: bit,
            site: "north".to_string(),
            subsystem: "gates".to_string(),
            description: format!("bit {}", bit),
            ..Default::default()
        }
    }

    #[test]
    fn test_controller_crud() {
        let (_tmp, store) = store();

        let id = controller(&store);
        assert!(id > 0);

        let mut fetched = store.get_controller(id).unwrap();
        assert_eq!(fetched.name, "Lock 1");
        assert_eq!(fetched.slot, 1);

        fetched.gateway = Some("10.0.0.1".to_string());
        store.update_controller(&fetched).unwrap();
        assert_eq!(store.get_controller(id).unwrap().gateway.as_deref(), Some("10.0.0.1"));

        store.delete_controller(id).unwrap();
        assert!(matches!(store.get_controller(id), Err(DbError::NotFound)));
        assert!(matches!(store.delete_controller(id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_tag_crud_and_parent_check() {
        let (_tmp, store) = store();
        let cid = controller(&store);

        let mut tag = Tag {
            controller_id: cid,
            name: "level".to_string(),
            db_number: 10,
            byte_offset: 4,
            tag_type: TagType::Real,
            ..Default::default()
        };
        store.create_tag(&mut tag).unwrap();

        let fetched = store.get_tag(tag.id).unwrap();
        assert_eq!(fetched, tag);
        assert_eq!(store.list_tags(cid).unwrap().len(), 1);

        let mut orphan = Tag {
            controller_id: 9999,
            ..tag.clone()
        };
        assert!(matches!(store.create_tag(&mut orphan), Err(DbError::NotFound)));
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let (_tmp, store) = store();
        let cid = controller(&store);

        let mut first = definition(cid, 3);
        store.create_definition(&mut first).unwrap();

        let mut dup = definition(cid, 3);
        assert!(matches!(store.create_definition(&mut dup), Err(DbError::Conflict(_))));

        let mut second = definition(cid, 4);
        store.create_definition(&mut second).unwrap();

        // moving the second definition onto the first one's bit
        second.bit_offset = 3;
        assert!(matches!(store.update_definition(&mut second), Err(DbError::Conflict(_))));
        assert_eq!(store.get_definition(second.id).unwrap().bit_offset, 4);

        // updating in place is fine
        first.description = "gate open timeout".to_string();
        store.update_definition(&mut first).unwrap();
    }

    #[test]
    fn test_rows_move_between_controllers() {
        let (_tmp, store) = store();
        let a = controller(&store);
        let b = controller(&store);

        let mut tag = Tag {
            controller_id: a,
            name: "level".to_string(),
            db_number: 10,
            tag_type: TagType::Word,
            ..Default::default()
        };
        store.create_tag(&mut tag).unwrap();
        tag.controller_id = b;
        store.update_tag(&tag).unwrap();
        assert!(store.list_tags(a).unwrap().is_empty());
        assert_eq!(store.list_tags(b).unwrap(), vec![tag.clone()]);

        tag.controller_id = 9999;
        assert!(matches!(store.update_tag(&tag), Err(DbError::NotFound)));
        assert_eq!(store.get_tag(tag.id).unwrap().controller_id, b);

        let mut on_a = definition(a, 3);
        store.create_definition(&mut on_a).unwrap();
        let mut on_b = definition(b, 3);
        store.create_definition(&mut on_b).unwrap();

        // b already owns that bit
        on_a.controller_id = b;
        assert!(matches!(store.update_definition(&mut on_a), Err(DbError::Conflict(_))));
        on_a.bit_offset = 5;
        store.update_definition(&mut on_a).unwrap();
        assert_eq!(store.get_definition(on_a.id).unwrap().controller_id, b);
    }

    #[test]
    fn test_import_reports_collisions() {
        let (_tmp, store) = store();
        let cid = controller(&store);

        let mut rows = vec![definition(cid, 0), definition(cid, 1), definition(cid, 0), definition(9999, 2)];
        let report = store.import_definitions(&mut rows).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(store.list_definitions(&DefinitionFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_transitions_and_history() {
        let (_tmp, store) = store();
        let cid = controller(&store);
        let mut def = definition(cid, 0);
        store.create_definition(&mut def).unwrap();

        let start = Utc::now() - Duration::seconds(90);
        store
            .commit_fault_transitions(&[FaultTransition::Activated { fault_id: def.id, at: start }])
            .unwrap();
        assert_eq!(store.active_statuses().unwrap().len(), 1);

        let ack = Acknowledgement {
            by: 7,
            by_name: "operator".to_string(),
            at: Utc::now(),
        };
        assert!(store.acknowledge_fault(def.id, &ack).unwrap());

        let end = start + Duration::milliseconds(61_500);
        store
            .commit_fault_transitions(&[FaultTransition::Deactivated {
                fault_id: def.id,
                started_at: start,
                ended_at: end,
            }])
            .unwrap();

        let status = store.get_status(def.id).unwrap().unwrap();
        assert!(!status.active);
        assert!(status.started_at.is_none());
        // acknowledgement survives deactivation
        assert_eq!(status.acknowledgement.as_ref().map(|a| a.by), Some(7));

        let history = store.fault_history(&HistoryFilter::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].history.duration_seconds, 61);
        assert_eq!(history[0].history.acknowledgement.as_ref().map(|a| a.by_name.as_str()), Some("operator"));

        // inactive faults cannot be acknowledged
        assert!(!store.acknowledge_fault(def.id, &ack).unwrap());

        // reactivation clears the acknowledgement
        store
            .commit_fault_transitions(&[FaultTransition::Activated { fault_id: def.id, at: Utc::now() }])
            .unwrap();
        assert!(store.get_status(def.id).unwrap().unwrap().acknowledgement.is_none());
        assert_eq!(store.active_faults().unwrap()[0].controller_name, "Lock 1");
    }

    #[test]
    fn test_history_filters() {
        let (_tmp, store) = store();
        let cid = controller(&store);
        let mut north = definition(cid, 0);
        store.create_definition(&mut north).unwrap();
        let mut south = FaultDefinition {
            site: "south".to_string(),
            ..definition(cid, 1)
        };
        store.create_definition(&mut south).unwrap();

        let t0 = Utc::now() - Duration::days(3);
        for (def, offset) in [(&north, 0), (&south, 2)] {
            let started_at = t0 + Duration::days(offset);
            store
                .commit_fault_transitions(&[
                    FaultTransition::Activated { fault_id: def.id, at: started_at },
                    FaultTransition::Deactivated {
                        fault_id: def.id,
                        started_at,
                        ended_at: started_at + Duration::minutes(5),
                    },
                ])
                .unwrap();
        }

        let by_site = store
            .fault_history(&HistoryFilter {
                site: Some("south".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_site.len(), 1);
        assert_eq!(by_site[0].site, "south");

        let recent = store
            .fault_history(&HistoryFilter {
                start: Some(t0 + Duration::days(1)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 1);

        assert_eq!(store.sites().unwrap(), vec!["north", "south"]);
        assert_eq!(store.subsystems().unwrap(), vec!["gates"]);
    }

    #[test]
    fn test_delete_controller_cascades() {
        let (_tmp, store) = store();
        let cid = controller(&store);
        let mut def = definition(cid, 0);
        store.create_definition(&mut def).unwrap();
        store
            .commit_fault_transitions(&[FaultTransition::Activated { fault_id: def.id, at: Utc::now() }])
            .unwrap();

        store.delete_controller(cid).unwrap();
        assert!(store.active_statuses().unwrap().is_empty());
        assert!(matches!(store.get_definition(def.id), Err(DbError::NotFound)));
    }
}
