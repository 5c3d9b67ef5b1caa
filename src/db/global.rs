// db/global.rs
// Site-wide singleton: the currently open session

use rusqlite::{Connection, OptionalExtension, params};

use super::Database;
use super::session::get_session_sync;
use super::types::Session;
use crate::error::Result;

/// Point the singleton at a session (or clear it with None).
pub fn set_open_session_sync(conn: &Connection, session_id: Option<i64>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO global_data (id, open_session_id) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET open_session_id = ?1",
        params![session_id],
    )?;
    Ok(())
}

/// The currently open session, if any.
pub fn open_session_sync(conn: &Connection) -> rusqlite::Result<Option<Session>> {
    let session_id: Option<i64> = conn
        .query_row(
            "SELECT open_session_id FROM global_data WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    match session_id {
        Some(id) => get_session_sync(conn, id),
        None => Ok(None),
    }
}

// ============================================================================
// Database impl methods
// ============================================================================

impl Database {
    pub fn set_open_session(&self, session_id: Option<i64>) -> Result<()> {
        set_open_session_sync(&self.conn(), session_id).map_err(Into::into)
    }

    pub fn open_session(&self) -> Result<Option<Session>> {
        open_session_sync(&self.conn()).map_err(Into::into)
    }
}
