// 🏛️ Reconciliation Repository - the persistence boundary
//
// The repository exclusively owns persisted EmployeeRecord state.
// Natural-key uniqueness is enforced by the UNIQUE index, not by locking in
// the application: a create that loses a race surfaces as `Conflict`.

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::MutexGuard;

use crate::change_detection::{decide, ChangeDecision};
use crate::db::{self, Database, Event};
use crate::error::{FailedWrite, RepositoryError};
use crate::record::{format_timestamp, parse_timestamp, EmployeeRecord, DATE_FORMAT};
use crate::states::BrazilianState;

/// Trailing window for dirty-record sweeps
pub const DEFAULT_DIRTY_WINDOW_HOURS: i64 = 24;

// ============================================================================
// REPOSITORY CONTRACT
// ============================================================================

pub trait EmployeeRepository: Send + Sync {
    /// Stored record for a natural key; `None` is a normal outcome
    fn find_by_key(&self, key: &str) -> Result<Option<EmployeeRecord>, RepositoryError>;

    /// Insert a new record; `Conflict` when the key already exists
    fn create(&self, record: &EmployeeRecord) -> Result<EmployeeRecord, RepositoryError>;

    /// Write a batch keyed by natural key. Not all-or-nothing: rows that
    /// fail are listed in `RepositoryError::Batch`, the rest stay committed.
    /// Returns the persisted rows (ids and timestamps filled in).
    fn upsert_batch(&self, records: &[EmployeeRecord]) -> Result<Vec<EmployeeRecord>, RepositoryError>;

    /// Dirty records updated within the trailing `window`, optionally for one owner
    fn find_dirty(
        &self,
        owner_id: Option<i64>,
        window: Duration,
    ) -> Result<Vec<EmployeeRecord>, RepositoryError>;

    /// Clear `needs_notification`; idempotent, empty input is a no-op
    fn clear_notification_flag(&self, ids: &[i64]) -> Result<(), RepositoryError>;

    /// Clear `needs_notification` for records as they were when notified.
    /// A row rewritten since (its `updated_at` moved) keeps the flag.
    /// Returns the number of rows cleared.
    fn clear_delivered(&self, delivered: &[&EmployeeRecord]) -> Result<usize, RepositoryError>;

    /// Append audit events
    fn record_events(&self, events: &[Event]) -> Result<(), RepositoryError>;

    /// `find_dirty` for the administrative "nothing to notify" path, where an
    /// empty result is reported as `NotFound`. Routine sweeps use `find_dirty`.
    fn find_dirty_strict(
        &self,
        owner_id: Option<i64>,
        window: Duration,
    ) -> Result<Vec<EmployeeRecord>, RepositoryError> {
        let records = self.find_dirty(owner_id, window)?;
        if records.is_empty() {
            return Err(RepositoryError::NotFound(match owner_id {
                Some(owner) => format!("no records to notify for owner {}", owner),
                None => "no records to notify".to_string(),
            }));
        }
        Ok(records)
    }
}

// ============================================================================
// SQLITE IMPLEMENTATION
// ============================================================================

const SELECT_COLUMNS: &str = "id, natural_key, name, email, city, state_code, start_date,
    owner_id, needs_notification, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteEmployeeRepository {
    db: Database,
}

impl SqliteEmployeeRepository {
    pub fn new(db: Database) -> Self {
        SqliteEmployeeRepository { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
        db::lock(&self.db)
    }

    /// Audit events for one natural key, newest first
    pub fn events_for(&self, key: &str) -> Result<Vec<Event>, RepositoryError> {
        let conn = self.conn()?;
        db::get_events_for_entity(&conn, "employee", key)
    }

    pub fn count(&self) -> Result<i64, RepositoryError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM employees", [], |row| row.get(0))?)
    }
}

impl EmployeeRepository for SqliteEmployeeRepository {
    fn find_by_key(&self, key: &str) -> Result<Option<EmployeeRecord>, RepositoryError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM employees WHERE natural_key = ?1", SELECT_COLUMNS);
        Ok(conn.query_row(&sql, [key], row_to_record).optional()?)
    }

    fn create(&self, record: &EmployeeRecord) -> Result<EmployeeRecord, RepositoryError> {
        let conn = self.conn()?;
        insert_one(&conn, record, &format_timestamp(Utc::now()))
    }

    fn upsert_batch(&self, records: &[EmployeeRecord]) -> Result<Vec<EmployeeRecord>, RepositoryError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let now = format_timestamp(Utc::now());
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;

        let mut committed = Vec::with_capacity(records.len());
        let mut failed = Vec::new();

        for record in records {
            // One savepoint per row: a failing row rolls back alone
            let sp = tx.savepoint()?;
            let result = if record.id.is_none() {
                insert_one(&sp, record, &now)
            } else {
                upsert_one(&sp, record, &now)
            };

            match result {
                Ok(saved) => {
                    sp.commit()?;
                    committed.push(saved);
                }
                Err(e) => {
                    failed.push(FailedWrite {
                        natural_key: record.natural_key.clone(),
                        reason: e.to_string(),
                        conflict: e.is_conflict(),
                    });
                }
            }
        }

        tx.commit()?;

        if failed.is_empty() {
            Ok(committed)
        } else {
            Err(RepositoryError::Batch { failed, committed })
        }
    }

    fn find_dirty(
        &self,
        owner_id: Option<i64>,
        window: Duration,
    ) -> Result<Vec<EmployeeRecord>, RepositoryError> {
        let since = format_timestamp(Utc::now() - window);
        let conn = self.conn()?;

        let sql = format!(
            "SELECT {} FROM employees
             WHERE needs_notification = 1
               AND updated_at >= ?1
               AND (?2 IS NULL OR owner_id = ?2)
             ORDER BY owner_id, id",
            SELECT_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![since, owner_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn clear_notification_flag(&self, ids: &[i64]) -> Result<(), RepositoryError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE employees SET needs_notification = 0 WHERE id = ?1")?;
            for id in ids {
                stmt.execute([id])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    fn clear_delivered(&self, delivered: &[&EmployeeRecord]) -> Result<usize, RepositoryError> {
        if delivered.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut cleared = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE employees SET needs_notification = 0 WHERE id = ?1 AND updated_at = ?2",
            )?;
            for record in delivered {
                let (Some(id), Some(updated_at)) = (record.id, record.updated_at) else {
                    continue;
                };
                cleared += stmt.execute(params![id, format_timestamp(updated_at)])?;
            }
        }
        tx.commit()?;

        Ok(cleared)
    }

    fn record_events(&self, events: &[Event]) -> Result<(), RepositoryError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for event in events {
            db::insert_event(&tx, event)?;
        }
        tx.commit()?;

        Ok(())
    }
}

fn insert_one(
    conn: &Connection,
    record: &EmployeeRecord,
    now: &str,
) -> Result<EmployeeRecord, RepositoryError> {
    let result = conn.query_row(
        "INSERT INTO employees (
            natural_key, name, email, city, state_code, start_date,
            owner_id, needs_notification, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        RETURNING id, created_at, updated_at",
        params![
            record.natural_key,
            record.name,
            record.email,
            record.city,
            record.state.uf(),
            record.start_date.format(DATE_FORMAT).to_string(),
            record.owner_id,
            record.needs_notification,
            now,
        ],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
    );

    match result {
        Ok((id, created_at, updated_at)) => Ok(with_storage_fields(record, id, &created_at, &updated_at)),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(RepositoryError::Conflict {
                key: record.natural_key.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn upsert_one(
    conn: &Connection,
    record: &EmployeeRecord,
    now: &str,
) -> Result<EmployeeRecord, RepositoryError> {
    let (id, created_at, updated_at) = conn.query_row(
        "INSERT INTO employees (
            natural_key, name, email, city, state_code, start_date,
            owner_id, needs_notification, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        ON CONFLICT(natural_key) DO UPDATE SET
            name = excluded.name,
            email = excluded.email,
            city = excluded.city,
            state_code = excluded.state_code,
            start_date = excluded.start_date,
            owner_id = excluded.owner_id,
            needs_notification = excluded.needs_notification,
            updated_at = excluded.updated_at
        RETURNING id, created_at, updated_at",
        params![
            record.natural_key,
            record.name,
            record.email,
            record.city,
            record.state.uf(),
            record.start_date.format(DATE_FORMAT).to_string(),
            record.owner_id,
            record.needs_notification,
            now,
        ],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
    )?;

    Ok(with_storage_fields(record, id, &created_at, &updated_at))
}

fn with_storage_fields(record: &EmployeeRecord, id: i64, created_at: &str, updated_at: &str) -> EmployeeRecord {
    EmployeeRecord {
        id: Some(id),
        created_at: parse_timestamp(created_at),
        updated_at: parse_timestamp(updated_at),
        ..record.clone()
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<EmployeeRecord> {
    let state_code: String = row.get(5)?;
    let state = BrazilianState::from_uf(&state_code)
        .ok_or_else(|| conversion_error(5, format!("unknown state code {}", state_code)))?;

    let start_date: String = row.get(6)?;
    let start_date = NaiveDate::parse_from_str(&start_date, DATE_FORMAT)
        .map_err(|e| conversion_error(6, format!("bad start_date {}: {}", start_date, e)))?;

    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(EmployeeRecord {
        id: Some(row.get(0)?),
        natural_key: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        city: row.get(4)?,
        state,
        start_date,
        owner_id: row.get(7)?,
        needs_notification: row.get(8)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

// ============================================================================
// RACE-SAFE SINGLE WRITE
// ============================================================================

/// Result of `save_record`: the decision taken and the persisted row, if any
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub decision: ChangeDecision,
    pub saved: Option<EmployeeRecord>,
}

/// Create-or-update one normalized record
///
/// A create that loses the race for its key (`Conflict`) is converted into
/// an update of whatever the winner stored.
pub fn save_record(
    repo: &dyn EmployeeRepository,
    record: &EmployeeRecord,
) -> Result<SaveOutcome, RepositoryError> {
    let existing = match repo.find_by_key(&record.natural_key)? {
        Some(existing) => existing,
        None => match repo.create(&record.marked_dirty()) {
            Ok(saved) => {
                return Ok(SaveOutcome {
                    decision: ChangeDecision::Create(record.marked_dirty()),
                    saved: Some(saved),
                })
            }
            Err(RepositoryError::Conflict { key }) => {
                repo.find_by_key(&key)?.ok_or(RepositoryError::Conflict { key })?
            }
            Err(e) => return Err(e),
        },
    };

    let decision = decide(record, Some(&existing));
    let saved = match decision.record_to_write() {
        Some(to_write) => repo.upsert_batch(std::slice::from_ref(to_write))?.pop(),
        None => None,
    };

    Ok(SaveOutcome { decision, saved })
}
