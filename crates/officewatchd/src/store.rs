//! SQLite-backed attendance store and identity directory.

use chrono::{DateTime, Local, NaiveDate, Utc};
use officewatch_core::{
    AttendanceSession, AttendanceStore, Identity, IdentityDirectory, IdentityId, SessionStatus,
    StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS employees (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    department  TEXT,
    created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS attendance (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_id  INTEGER NOT NULL REFERENCES employees(id),
    entry_time   TEXT NOT NULL,
    exit_time    TEXT,
    action       TEXT NOT NULL DEFAULT 'Unknown',
    date         TEXT NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('inside', 'exited'))
);

CREATE UNIQUE INDEX IF NOT EXISTS attendance_one_inside
    ON attendance(employee_id, date) WHERE status = 'inside';

CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance(date);
";

const SESSION_COLUMNS: &str = "id, employee_id, entry_time, exit_time, status, date, action";

/// One attendance row with the employee's name, as listed for today.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub name: String,
    #[serde(flatten)]
    pub session: AttendanceSession,
}

/// Attendance store over a single SQLite connection.
///
/// Every write runs in its own transaction; the partial unique index on
/// `(employee_id, date) WHERE status = 'inside'` backs the one-inside-session rule.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories and schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
            }
        }
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        let store = Self::with_connection(conn)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(StoreError::backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL).map_err(StoreError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-call leaves no open transaction behind; the connection stays usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Today's sessions, oldest entry first, with employee names.
    pub fn current_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT a.id, a.employee_id, a.entry_time, a.exit_time, a.status, a.date, a.action,
                        e.name
                 FROM attendance a JOIN employees e ON e.id = a.employee_id
                 WHERE a.date = ?1
                 ORDER BY a.entry_time, a.id",
            )
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![today()], |row| {
                Ok(AttendanceRecord {
                    session: decode_session(row)?,
                    name: row.get(7)?,
                })
            })
            .map_err(StoreError::backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::backend)
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn decode_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceSession> {
    let status: String = row.get(4)?;
    let status = SessionStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown session status {status:?}").into(),
        )
    })?;
    Ok(AttendanceSession {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        entry_time: row.get(2)?,
        exit_time: row.get(3)?,
        status,
        date: row.get(5)?,
        action: row.get(6)?,
    })
}

fn load_session(conn: &Connection, id: i64) -> rusqlite::Result<AttendanceSession> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM attendance WHERE id = ?1"),
        params![id],
        decode_session,
    )
}

/// Mark every inside session of `identity_id` exited at `at`, whatever its date.
fn close_inside(conn: &Connection, identity_id: IdentityId, at: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE attendance SET status = 'exited', exit_time = ?2
         WHERE employee_id = ?1 AND status = 'inside'",
        params![identity_id, at],
    )
}

impl AttendanceStore for SqliteStore {
    fn open_session(
        &self,
        identity_id: IdentityId,
        action: &str,
    ) -> Result<AttendanceSession, StoreError> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(StoreError::backend)?;

        let closed = close_inside(&tx, identity_id, now).map_err(StoreError::backend)?;
        if closed > 0 {
            tracing::debug!(identity_id, closed, "closed stale inside sessions before opening");
        }
        tx.execute(
            "INSERT INTO attendance (employee_id, entry_time, exit_time, action, date, status)
             VALUES (?1, ?2, NULL, ?3, ?4, 'inside')",
            params![identity_id, now, action, today()],
        )
        .map_err(StoreError::backend)?;
        let session = load_session(&tx, tx.last_insert_rowid()).map_err(StoreError::backend)?;

        tx.commit().map_err(StoreError::backend)?;
        Ok(session)
    }

    fn close_session(&self, identity_id: IdentityId) -> Result<AttendanceSession, StoreError> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(StoreError::backend)?;

        let latest: Option<i64> = tx
            .query_row(
                "SELECT id FROM attendance
                 WHERE employee_id = ?1 AND status = 'inside'
                 ORDER BY entry_time DESC, id DESC LIMIT 1",
                params![identity_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)?;
        let Some(id) = latest else {
            return Err(StoreError::NoActiveSession(identity_id));
        };

        close_inside(&tx, identity_id, now).map_err(StoreError::backend)?;
        let session = load_session(&tx, id).map_err(StoreError::backend)?;

        tx.commit().map_err(StoreError::backend)?;
        Ok(session)
    }

    fn is_inside(&self, identity_id: IdentityId) -> Result<bool, StoreError> {
        self.conn()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM attendance
                                WHERE employee_id = ?1 AND date = ?2 AND status = 'inside')",
                params![identity_id, today()],
                |row| row.get(0),
            )
            .map_err(StoreError::backend)
    }
}

impl IdentityDirectory for SqliteStore {
    fn resolve(&self, identity_id: IdentityId) -> Result<Option<Identity>, StoreError> {
        self.conn()
            .query_row(
                "SELECT id, name, department FROM employees WHERE id = ?1",
                params![identity_id],
                |row| {
                    Ok(Identity {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        department: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_employees() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn()
            .execute_batch(
                "INSERT INTO employees (id, name, department) VALUES (1, 'Alice', 'Engineering');
                 INSERT INTO employees (id, name, department) VALUES (2, 'Bob', NULL);",
            )
            .unwrap();
        store
    }

    fn inside_count(store: &SqliteStore, identity_id: IdentityId) -> i64 {
        store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM attendance WHERE employee_id = ?1 AND status = 'inside'",
                params![identity_id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_open_session_records_inside_row() {
        let store = store_with_employees();
        let session = store.open_session(1, "Unknown").unwrap();
        assert_eq!(session.identity_id, 1);
        assert_eq!(session.status, SessionStatus::Inside);
        assert_eq!(session.action, "Unknown");
        assert_eq!(session.date, today());
        assert!(session.exit_time.is_none());
        assert!(store.is_inside(1).unwrap());
        assert!(!store.is_inside(2).unwrap());
    }

    #[test]
    fn test_reopen_closes_prior_inside_session() {
        let store = store_with_employees();
        let first = store.open_session(1, "Unknown").unwrap();
        let second = store.open_session(1, "Unknown").unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(inside_count(&store, 1), 1);

        let first = load_session(&store.conn(), first.id).unwrap();
        assert_eq!(first.status, SessionStatus::Exited);
        assert!(first.exit_time.is_some());
    }

    #[test]
    fn test_close_session_returns_closed_row() {
        let store = store_with_employees();
        let opened = store.open_session(2, "Unknown").unwrap();
        let closed = store.close_session(2).unwrap();
        assert_eq!(closed.id, opened.id);
        assert_eq!(closed.status, SessionStatus::Exited);
        assert!(closed.duration().unwrap() >= chrono::TimeDelta::zero());
        assert!(!store.is_inside(2).unwrap());
    }

    #[test]
    fn test_close_without_session_is_no_active_session() {
        let store = store_with_employees();
        assert!(matches!(store.close_session(1), Err(StoreError::NoActiveSession(1))));

        store.open_session(1, "Unknown").unwrap();
        store.close_session(1).unwrap();
        assert!(matches!(store.close_session(1), Err(StoreError::NoActiveSession(1))));
    }

    #[test]
    fn test_close_session_closes_inside_rows_from_earlier_dates() {
        let store = store_with_employees();
        store
            .conn()
            .execute(
                "INSERT INTO attendance (employee_id, entry_time, action, date, status)
                 VALUES (1, ?1, 'Unknown', '2000-01-01', 'inside')",
                params![Utc::now()],
            )
            .unwrap();
        assert!(!store.is_inside(1).unwrap());

        let closed = store.close_session(1).unwrap();
        assert_eq!(closed.date, NaiveDate::from_ymd_opt(2000, 1, 1).unwrap());
        assert_eq!(inside_count(&store, 1), 0);
    }

    #[test]
    fn test_second_inside_row_rejected_by_index() {
        let store = store_with_employees();
        store.open_session(1, "Unknown").unwrap();
        let dup = store.conn().execute(
            "INSERT INTO attendance (employee_id, entry_time, action, date, status)
             VALUES (1, ?1, 'Unknown', ?2, 'inside')",
            params![Utc::now(), today()],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_open_session_for_unknown_employee_is_backend_error() {
        let store = store_with_employees();
        assert!(matches!(store.open_session(99, "Unknown"), Err(StoreError::Backend(_))));
    }

    #[test]
    fn test_resolve() {
        let store = store_with_employees();
        let alice = store.resolve(1).unwrap().unwrap();
        assert_eq!(alice.display_name, "Alice");
        assert_eq!(alice.department.as_deref(), Some("Engineering"));
        assert_eq!(store.resolve(2).unwrap().unwrap().department, None);
        assert!(store.resolve(42).unwrap().is_none());
    }

    #[test]
    fn test_current_attendance_joins_names() {
        let store = store_with_employees();
        store.open_session(1, "Unknown").unwrap();
        store.open_session(2, "Unknown").unwrap();
        store.close_session(1).unwrap();

        let records = store.current_attendance().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Alice");
        assert_eq!(records[0].session.status, SessionStatus::Exited);
        assert_eq!(records[1].name, "Bob");
        assert_eq!(records[1].session.status, SessionStatus::Inside);

        let json = serde_json::to_value(&records[1]).unwrap();
        assert_eq!(json["name"], "Bob");
        assert_eq!(json["status"], "inside");
    }

    #[test]
    fn test_open_creates_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/attendance.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.conn().execute("INSERT INTO employees (id, name) VALUES (7, 'Eve')", []).unwrap();
            store.open_session(7, "Unknown").unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.is_inside(7).unwrap());
    }
}
