//! SQLite-backed event log.
//!
//! One database file holds many sessions; each [`SqliteLog`] is bound to a
//! single session id and sees only that session's events.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::EventLog;
use crate::error::StreamError;
use crate::event::{Action, Event, EventId, EventPayload, Extras, Observation};

/// Current schema version.
const SCHEMA_VERSION: i32 = 1;

const EVENT_COLUMNS: &str = "id, timestamp, source, category, kind, cause, content, extras";

/// A stored session with its event count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub request: String,
    pub created_at: DateTime<Utc>,
    pub events: u64,
}

/// Event log for one session in a SQLite database.
pub struct SqliteLog {
    conn: Connection,
    session_id: String,
    next: u64,
}

impl SqliteLog {
    /// Register a new session and open its (empty) log.
    pub fn create(path: &Path, session_id: &str, request: &str) -> Result<Self, StreamError> {
        let conn = open_db(path)?;
        conn.execute(
            "INSERT INTO sessions (id, request, created_at) VALUES (?1, ?2, ?3)",
            params![session_id, request, Utc::now().to_rfc3339()],
        )?;
        Ok(SqliteLog {
            conn,
            session_id: session_id.to_string(),
            next: 0,
        })
    }

    /// Open an existing session's log.
    pub fn open(path: &Path, session_id: &str) -> Result<Self, StreamError> {
        let conn = open_db(path)?;
        let known: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(StreamError::Unavailable(format!(
                "session '{session_id}' not found"
            )));
        }
        let next = count_events(&conn, session_id)?;
        Ok(SqliteLog {
            conn,
            session_id: session_id.to_string(),
            next,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// All sessions in the database, oldest first.
    pub fn sessions(path: &Path) -> Result<Vec<SessionInfo>, StreamError> {
        let conn = open_db(path)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.request, s.created_at,
                   (SELECT COUNT(*) FROM events e WHERE e.session_id = s.id)
            FROM sessions s
            ORDER BY s.created_at, s.rowid
            "#,
        )?;
        let rows: Vec<(String, String, String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<Result<_, _>>()?;

        rows.into_iter()
            .map(|(id, request, created_at, events)| {
                Ok(SessionInfo {
                    created_at: parse_timestamp(&created_at).map_err(|reason| {
                        StreamError::Unavailable(format!("session '{id}': {reason}"))
                    })?,
                    id,
                    request,
                    events: events as u64,
                })
            })
            .collect()
    }

    /// The most recently created session, if any.
    pub fn latest_session(path: &Path) -> Result<Option<SessionInfo>, StreamError> {
        Ok(SqliteLog::sessions(path)?.pop())
    }
}

impl EventLog for SqliteLog {
    fn append(&mut self, payload: EventPayload) -> Result<Event, StreamError> {
        let id = EventId(self.next);
        let event = Event::stored(id, Utc::now(), payload);
        let (category, content, cause) = match event.payload() {
            EventPayload::Action(_) => ("action", "", None),
            EventPayload::Observation(obs) => {
                ("observation", obs.content(), obs.cause().map(|c| c.0 as i64))
            }
        };
        let extras = Value::Object(event.extras().clone()).to_string();
        let kind = match event.payload() {
            EventPayload::Action(action) => action.kind().as_str(),
            EventPayload::Observation(obs) => obs.kind().as_str(),
        };
        self.conn.execute(
            r#"
            INSERT INTO events
                (session_id, id, timestamp, source, category, kind, cause, content, extras)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                self.session_id,
                id.0 as i64,
                event.timestamp().to_rfc3339(),
                event.source().as_str(),
                category,
                kind,
                cause,
                content,
                extras,
            ],
        )?;
        self.next += 1;
        Ok(event)
    }

    fn read_from(&self, from: EventId, limit: usize) -> Result<Vec<Event>, StreamError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE session_id = ?1 AND id >= ?2 ORDER BY id LIMIT ?3"
        ))?;
        let rows: Vec<RawEvent> = stmt
            .query_map(
                params![self.session_id, from.0 as i64, limit as i64],
                RawEvent::from_row,
            )?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(RawEvent::decode).collect()
    }

    fn get(&self, id: EventId) -> Result<Option<Event>, StreamError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE session_id = ?1 AND id = ?2"),
                params![self.session_id, id.0 as i64],
                RawEvent::from_row,
            )
            .optional()?;
        raw.map(RawEvent::decode).transpose()
    }

    fn len(&self) -> Result<u64, StreamError> {
        Ok(self.next)
    }
}

/// Open or initialize the database at the given path.
fn open_db(path: &Path) -> Result<Connection, StreamError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            StreamError::Unavailable(format!(
                "failed to create directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        migrate(&conn, version, SCHEMA_VERSION)?;
    }
    Ok(conn)
}

/// Run migrations from `from_version` to `to_version`.
fn migrate(conn: &Connection, from_version: i32, to_version: i32) -> Result<(), StreamError> {
    if from_version < 1 && to_version >= 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                request TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE events (
                session_id TEXT NOT NULL REFERENCES sessions(id),
                id INTEGER NOT NULL CHECK (id >= 0),
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL
                    CHECK (source IN ('agent','user','environment')),
                category TEXT NOT NULL
                    CHECK (category IN ('action','observation')),
                kind TEXT NOT NULL,
                cause INTEGER,
                content TEXT NOT NULL DEFAULT '',
                extras TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (session_id, id)
            );

            CREATE INDEX idx_events_cause ON events(session_id, cause);
            "#,
        )?;
    }

    conn.pragma_update(None, "user_version", to_version)?;
    Ok(())
}

fn count_events(conn: &Connection, session_id: &str) -> Result<u64, StreamError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{raw}': {e}"))
}

/// One `events` row before validation.
struct RawEvent {
    id: i64,
    timestamp: String,
    source: String,
    category: String,
    kind: String,
    cause: Option<i64>,
    content: String,
    extras: String,
}

impl RawEvent {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawEvent {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            source: row.get(2)?,
            category: row.get(3)?,
            kind: row.get(4)?,
            cause: row.get(5)?,
            content: row.get(6)?,
            extras: row.get(7)?,
        })
    }

    /// Rebuild the event through the validating constructors.
    fn decode(self) -> Result<Event, StreamError> {
        let id = EventId(self.id as u64);
        let corrupt = |reason: String| StreamError::Corrupt { id, reason };

        let timestamp = parse_timestamp(&self.timestamp).map_err(corrupt)?;
        let source = self.source.parse().map_err(|e| corrupt(format!("{e}")))?;
        let extras: Extras = serde_json::from_str(&self.extras)
            .map_err(|e| corrupt(format!("bad extras: {e}")))?;

        let payload = match self.category.as_str() {
            "action" => Action::parse(&self.kind, source, extras)
                .map_err(|e| corrupt(e.to_string()))?
                .into(),
            "observation" => {
                let obs = Observation::parse(&self.kind, source, self.content, extras)
                    .map_err(|e| corrupt(e.to_string()))?;
                let obs = match self.cause {
                    Some(cause) => obs.with_cause(EventId(cause as u64)),
                    None => obs,
                };
                obs.into()
            }
            other => return Err(corrupt(format!("unknown category '{other}'"))),
        };
        Ok(Event::stored(id, timestamp, payload))
    }
}
