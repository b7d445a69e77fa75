// 🗄️ Database setup, owner directory and audit trail (SQLite + WAL)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::RepositoryError;
use crate::record::{format_timestamp, parse_timestamp};

/// Shared connection handle used by the repository and the job store
pub type Database = Arc<Mutex<Connection>>;

/// Open (or create) the database file and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Database, RepositoryError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    setup_database(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Fresh in-memory database with the full schema (tests, dry runs)
pub fn open_in_memory() -> Result<Database, RepositoryError> {
    let conn = Connection::open_in_memory()?;
    setup_database(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn lock(db: &Database) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
    db.lock().map_err(|_| RepositoryError::LockPoisoned)
}

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Employees (natural_key is the sole de-duplication key)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS employees (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            natural_key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            city TEXT NOT NULL,
            state_code TEXT NOT NULL,
            start_date TEXT NOT NULL,
            owner_id INTEGER NOT NULL,
            needs_notification INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Owners (contact directory for notifications)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS owners (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Import jobs (status query)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_jobs (
            job_id TEXT PRIMARY KEY,
            owner_id INTEGER NOT NULL,
            source_path TEXT NOT NULL,
            source_checksum TEXT,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            processed INTEGER NOT NULL DEFAULT 0,
            created INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            unchanged INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            errors TEXT NOT NULL DEFAULT '[]',
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_employees_dirty
         ON employees(owner_id, needs_notification, updated_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_employees_dirty_window
         ON employees(needs_notification, updated_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// OWNERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: i64,
    pub name: String,
    pub email: String,
}

pub fn upsert_owner(conn: &Connection, owner: &Owner) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO owners (id, name, email) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
        params![owner.id, owner.name, owner.email],
    )?;
    Ok(())
}

pub fn get_owner(conn: &Connection, id: i64) -> rusqlite::Result<Option<Owner>> {
    conn.query_row(
        "SELECT id, name, email FROM owners WHERE id = ?1",
        [id],
        |row| {
            Ok(Owner {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
            })
        },
    )
    .optional()
}

// ============================================================================
// AUDIT EVENTS ("every change is an event")
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<(), RepositoryError> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            format_timestamp(event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>, RepositoryError> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| {
            let timestamp = parse_timestamp(&timestamp)
                .ok_or_else(|| RepositoryError::CorruptRow(format!("bad event timestamp {}", timestamp)))?;
            Ok(Event {
                event_id,
                timestamp,
                event_type,
                entity_type,
                entity_id,
                data: serde_json::from_str(&data)?,
                actor,
            })
        })
        .collect()
}
