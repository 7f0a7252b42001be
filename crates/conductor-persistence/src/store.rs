use std::path::Path;

use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::ids::{ProjectId, SessionId};
use conductor_protocol::session::{SessionDate, SessionSnapshot};
use rusqlite::{Connection, params};

use crate::codec::{
    command_to_json, str_to_command, str_to_date, str_to_state, str_to_timestamp,
    timestamp_sort_key, timestamp_to_str, truncate_scrollback,
};

pub const DEFAULT_MAX_SNAPSHOT_SCROLLBACK_BYTES: usize = 256 * 1024;
const SCHEMA_VERSION: u32 = 1;

/// Durable, date-partitioned storage for session snapshots.
pub trait SnapshotStore: Send {
    /// Inserts or replaces the snapshot keyed by `(date, session_id)`.
    fn save(&mut self, snapshot: &SessionSnapshot) -> ConductorResult<()>;
    /// Dates holding snapshots for `project_id`, most recent first.
    fn list_dates(&self, project_id: &ProjectId) -> ConductorResult<Vec<SessionDate>>;
    /// Snapshots of one partition in creation order.
    fn list_by_date(
        &self,
        project_id: &ProjectId,
        date: SessionDate,
    ) -> ConductorResult<Vec<SessionSnapshot>>;
    /// Deletes every snapshot of `project_id`; returns how many were removed.
    fn clear(&mut self, project_id: &ProjectId) -> ConductorResult<usize>;
}

pub struct SqliteSnapshotStore {
    conn: Connection,
    max_scrollback_bytes: usize,
}

impl SqliteSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                ConductorError::Persistence(format!(
                    "failed to create database directory '{}': {err}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path).map_err(|err| ConductorError::Persistence(err.to_string()))?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> ConductorResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|err| ConductorError::Persistence(err.to_string()))?;
        Self::bootstrap(conn)
    }

    pub fn with_max_scrollback_bytes(mut self, max_scrollback_bytes: usize) -> Self {
        self.max_scrollback_bytes = max_scrollback_bytes.max(1);
        self
    }

    pub fn schema_version(&self) -> ConductorResult<u32> {
        self.conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|err| ConductorError::Persistence(err.to_string()))
    }

    fn bootstrap(conn: Connection) -> ConductorResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS session_snapshots (
                session_date TEXT NOT NULL,
                session_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_order INTEGER NOT NULL,
                title TEXT NULL,
                command TEXT NOT NULL,
                profile_id TEXT NULL,
                state TEXT NOT NULL,
                exit_code INTEGER NULL,
                retried_from TEXT NULL,
                scrollback BLOB NOT NULL,
                PRIMARY KEY (session_date, session_id)
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_project_date
                ON session_snapshots(project_id, session_date, created_order);
            ",
        )
        .map_err(|err| ConductorError::Persistence(err.to_string()))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|err| ConductorError::Persistence(err.to_string()))?;
        Ok(Self {
            conn,
            max_scrollback_bytes: DEFAULT_MAX_SNAPSHOT_SCROLLBACK_BYTES,
        })
    }

    fn map_row(row: &rusqlite::Row<'_>) -> Result<SessionSnapshot, rusqlite::Error> {
        Ok(SessionSnapshot {
            date: str_to_date(&row.get::<_, String>(0)?)?,
            session_id: SessionId::from(row.get::<_, String>(1)?),
            project_id: ProjectId::from(row.get::<_, String>(2)?),
            created_at: str_to_timestamp(&row.get::<_, String>(3)?)?,
            title: row.get(4)?,
            command: str_to_command(&row.get::<_, String>(5)?)?,
            profile_id: row.get::<_, Option<String>>(6)?.map(Into::into),
            state: str_to_state(&row.get::<_, String>(7)?)?,
            exit_code: row.get(8)?,
            retried_from: row.get::<_, Option<String>>(9)?.map(Into::into),
            scrollback: row.get(10)?,
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&mut self, snapshot: &SessionSnapshot) -> ConductorResult<()> {
        let command = command_to_json(&snapshot.command)?;
        let created_at = timestamp_to_str(snapshot.created_at)?;
        let scrollback = truncate_scrollback(&snapshot.scrollback, self.max_scrollback_bytes);
        self.conn
            .execute(
                "
                INSERT INTO session_snapshots (
                    session_date, session_id, project_id, created_at, created_order, title,
                    command, profile_id, state, exit_code, retried_from, scrollback
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(session_date, session_id) DO UPDATE SET
                    project_id = excluded.project_id,
                    created_at = excluded.created_at,
                    created_order = excluded.created_order,
                    title = excluded.title,
                    command = excluded.command,
                    profile_id = excluded.profile_id,
                    state = excluded.state,
                    exit_code = excluded.exit_code,
                    retried_from = excluded.retried_from,
                    scrollback = excluded.scrollback
                ",
                params![
                    snapshot.date.to_string(),
                    snapshot.session_id.as_str(),
                    snapshot.project_id.as_str(),
                    created_at,
                    timestamp_sort_key(snapshot.created_at),
                    snapshot.title,
                    command,
                    snapshot.profile_id.as_ref().map(|id| id.as_str()),
                    snapshot.state.as_str(),
                    snapshot.exit_code,
                    snapshot.retried_from.as_ref().map(|id| id.as_str()),
                    scrollback,
                ],
            )
            .map_err(|err| ConductorError::PersistenceWrite(err.to_string()))?;
        Ok(())
    }

    fn list_dates(&self, project_id: &ProjectId) -> ConductorResult<Vec<SessionDate>> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT DISTINCT session_date
                FROM session_snapshots
                WHERE project_id = ?1
                ORDER BY session_date DESC
                ",
            )
            .map_err(|err| ConductorError::Persistence(err.to_string()))?;
        let rows = stmt
            .query_map(params![project_id.as_str()], |row| {
                str_to_date(&row.get::<_, String>(0)?)
            })
            .map_err(|err| ConductorError::Persistence(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| ConductorError::Persistence(err.to_string()))
    }

    fn list_by_date(
        &self,
        project_id: &ProjectId,
        date: SessionDate,
    ) -> ConductorResult<Vec<SessionSnapshot>> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT session_date, session_id, project_id, created_at, title, command,
                       profile_id, state, exit_code, retried_from, scrollback
                FROM session_snapshots
                WHERE project_id = ?1 AND session_date = ?2
                ORDER BY created_order ASC, session_id ASC
                ",
            )
            .map_err(|err| ConductorError::Persistence(err.to_string()))?;
        let rows = stmt
            .query_map(params![project_id.as_str(), date.to_string()], Self::map_row)
            .map_err(|err| ConductorError::Persistence(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| ConductorError::Persistence(err.to_string()))
    }

    fn clear(&mut self, project_id: &ProjectId) -> ConductorResult<usize> {
        self.conn
            .execute(
                "DELETE FROM session_snapshots WHERE project_id = ?1",
                params![project_id.as_str()],
            )
            .map_err(|err| ConductorError::PersistenceWrite(err.to_string()))
    }
}
