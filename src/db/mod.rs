// db/mod.rs
// SQLite persistence layer for sessions, subsessions, and actors

mod experimenter;
mod global;
mod participant;
mod schema;
mod session;
mod subsession;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use participant::parse_participant_row;
pub use session::parse_session_row;
pub use types::*;

use crate::config::EnvConfig;
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// Database wrapper for the experiment data model
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<String>,
}

impl Database {
    /// Open database at path, creating if needed
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string_lossy().into_owned()),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Open the database at the path named by the environment (LABLINK_DB)
    pub fn open_default() -> Result<Self> {
        let config = EnvConfig::from_env();
        Self::open(&config.database_path)
    }

    /// Open in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Get a lock on the connection
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("Database mutex poisoned")
    }

    /// Filesystem location of this database, if file-backed
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Initialize schema (idempotent)
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        schema::run_all_migrations(&conn)?;
        Ok(())
    }
}

/// How many times code-generating inserts retry on a UNIQUE collision.
pub(crate) const CODE_ALLOC_ATTEMPTS: usize = 5;

/// Check if a rusqlite error is a UNIQUE/constraint violation.
///
/// Generated codes carry a UNIQUE constraint; inserts retry on collision.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::ConstraintViolation,
                ..
            },
            _,
        )
    )
}
