use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use stepflow_core::traits::SessionArchive;
use stepflow_core::{ArchivedSession, Result, SessionStatus, StepflowError};

/// Session archive backed by SQLite. One row per session; saving again
/// replaces the row.
pub struct SqliteArchive {
    conn: Mutex<Connection>,
}

impl SqliteArchive {
    /// Open or create the archive database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepflowError::Archive(format!("Failed to create archive directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StepflowError::Archive(format!("Failed to open archive: {}", e)))?;
        Self::init(conn)
    }

    /// Archive that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StepflowError::Archive(format!("Failed to open archive: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS sessions (
                 session_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 snapshot TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_sessions_updated
                 ON sessions(updated_at DESC);",
        )
        .map_err(|e| StepflowError::Archive(format!("Failed to initialize archive schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StepflowError::Archive(e.to_string()))
    }
}

fn status_to_str(status: SessionStatus) -> String {
    status.to_string()
}

fn status_from_str(s: &str) -> SessionStatus {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .unwrap_or(SessionStatus::Failed)
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<ArchivedSession> {
    let status: String = row.get(1)?;
    let ts: String = row.get(3)?;
    Ok(ArchivedSession {
        session_id: row.get(0)?,
        status: status_from_str(&status),
        snapshot: row.get(2)?,
        updated_at: DateTime::parse_from_rfc3339(&ts)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl SessionArchive for SqliteArchive {
    fn save(&self, session: &ArchivedSession) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (session_id, status, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                 status = excluded.status,
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at",
            params![
                session.session_id,
                status_to_str(session.status),
                session.snapshot,
                session.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StepflowError::Archive(format!("Failed to save session: {}", e)))?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<ArchivedSession>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT session_id, status, snapshot, updated_at
             FROM sessions WHERE session_id = ?1",
            params![session_id],
            row_to_session,
        )
        .optional()
        .map_err(|e| StepflowError::Archive(format!("Failed to load session: {}", e)))
    }

    fn list(&self, limit: usize) -> Result<Vec<ArchivedSession>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, status, snapshot, updated_at
                 FROM sessions
                 ORDER BY updated_at DESC
                 LIMIT ?1",
            )
            .map_err(|e| StepflowError::Archive(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_session)
            .map_err(|e| StepflowError::Archive(format!("Failed to list sessions: {}", e)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StepflowError::Archive(format!("Failed to read session row: {}", e)))
    }

    fn delete(&self, session_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(|e| StepflowError::Archive(format!("Failed to delete session: {}", e)))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_archive() -> (tempfile::TempDir, SqliteArchive) {
        let dir = tempfile::tempdir().unwrap();
        let archive = SqliteArchive::open(&dir.path().join("sessions.db")).unwrap();
        (dir, archive)
    }

    fn session(id: &str, status: SessionStatus, at: DateTime<Utc>) -> ArchivedSession {
        ArchivedSession {
            session_id: id.to_string(),
            status,
            snapshot: format!("{{\"session_id\": \"{}\"}}", id),
            updated_at: at,
        }
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, archive) = temp_archive();
        archive
            .save(&session("s1", SessionStatus::Completed, Utc::now()))
            .unwrap();

        let loaded = archive.load("s1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert!(loaded.snapshot.contains("s1"));
        assert!(archive.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_row() {
        let (_dir, archive) = temp_archive();
        archive
            .save(&session("s1", SessionStatus::Running, Utc::now()))
            .unwrap();
        archive
            .save(&session("s1", SessionStatus::TimedOut, Utc::now()))
            .unwrap();

        assert_eq!(archive.list(10).unwrap().len(), 1);
        assert_eq!(
            archive.load("s1").unwrap().unwrap().status,
            SessionStatus::TimedOut
        );
    }

    #[test]
    fn test_list_most_recent_first() {
        let archive = SqliteArchive::in_memory().unwrap();
        let now = Utc::now();
        archive
            .save(&session("old", SessionStatus::Failed, now - Duration::minutes(5)))
            .unwrap();
        archive
            .save(&session("new", SessionStatus::Deadlocked, now))
            .unwrap();

        let ids: Vec<String> = archive
            .list(10)
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(archive.list(1).unwrap().len(), 1);
    }

    #[test]
    fn test_delete() {
        let (_dir, archive) = temp_archive();
        archive
            .save(&session("s1", SessionStatus::Completed, Utc::now()))
            .unwrap();
        assert!(archive.delete("s1").unwrap());
        assert!(!archive.delete("s1").unwrap());
        assert!(archive.load("s1").unwrap().is_none());
    }

    #[test]
    fn test_status_text_roundtrip() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::TimedOut,
            SessionStatus::Deadlocked,
        ] {
            assert_eq!(status_from_str(&status_to_str(status)), status);
        }
    }
}
