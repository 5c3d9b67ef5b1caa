// db/experimenter.rs
// Session experimenter operations and experimenter-record chaining

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::session::{SESSION_COLUMNS, get_session_sync, parse_session_row, subsession_chain_sync};
use super::subsession::{subsession_experimenter_sync, user_chain_sync};
use super::types::{Session, SessionExperimenter, SubsessionUser};
use super::{CODE_ALLOC_ATTEMPTS, Database, is_constraint_violation};
use crate::error::{LabLinkError, Result};
use crate::utils::{CODE_LENGTH, random_code};

fn parse_experimenter_row(row: &Row) -> rusqlite::Result<SessionExperimenter> {
    let vars_text: String = row.get(7)?;
    Ok(SessionExperimenter {
        id: row.get(0)?,
        code: row.get(1)?,
        visited: row.get::<_, i32>(2)? != 0,
        last_request_succeeded: row.get::<_, Option<i32>>(3)?.map(|v| v != 0),
        ip_address: row.get(4)?,
        is_on_wait_page: row.get::<_, i32>(5)? != 0,
        current_page: row.get(6)?,
        vars: serde_json::from_str(&vars_text).unwrap_or_else(|_| serde_json::json!({})),
        index_in_subsessions: row.get(8)?,
        me_in_first_id: row.get(9)?,
    })
}

const EXPERIMENTER_COLUMNS: &str = "id, code, visited, last_request_succeeded, ip_address, \
     is_on_wait_page, current_page, vars, index_in_subsessions, me_in_first_id";

/// Insert an experimenter with a freshly generated code.
pub fn create_experimenter_sync(conn: &Connection) -> Result<i64> {
    for _ in 0..CODE_ALLOC_ATTEMPTS {
        let code = random_code(CODE_LENGTH);
        let inserted = conn.execute(
            "INSERT INTO session_experimenters (code) VALUES (?1)",
            params![code],
        );
        match inserted {
            Ok(_) => return Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(LabLinkError::Other(
        "could not allocate a unique experimenter code".to_string(),
    ))
}

pub fn get_experimenter_sync(
    conn: &Connection,
    id: i64,
) -> rusqlite::Result<Option<SessionExperimenter>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM session_experimenters WHERE id = ?1",
            EXPERIMENTER_COLUMNS
        ),
        [id],
        parse_experimenter_row,
    )
    .optional()
}

pub fn get_experimenter_by_code_sync(
    conn: &Connection,
    code: &str,
) -> rusqlite::Result<Option<SessionExperimenter>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM session_experimenters WHERE code = ?1",
            EXPERIMENTER_COLUMNS
        ),
        [code],
        parse_experimenter_row,
    )
    .optional()
}

/// Point a session at its experimenter (one-to-one).
pub fn attach_experimenter_sync(
    conn: &Connection,
    session_id: i64,
    experimenter_id: i64,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE sessions SET experimenter_id = ?1 WHERE id = ?2",
        params![experimenter_id, session_id],
    )?;
    if updated == 0 {
        return Err(LabLinkError::InvalidInput(format!(
            "session {} not found",
            session_id
        )));
    }
    Ok(())
}

/// Reverse side of the one-to-one: the session an experimenter runs.
pub fn session_for_experimenter_sync(
    conn: &Connection,
    experimenter_id: i64,
) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sessions WHERE experimenter_id = ?1",
            SESSION_COLUMNS
        ),
        [experimenter_id],
        parse_session_row,
    )
    .optional()
}

/// Wire the session experimenter's chain across the per-subsession
/// experimenter records: chain head, pairwise next/previous links, and
/// owner ref on every record.
pub fn chain_experimenters_sync(conn: &Connection, session_id: i64) -> Result<()> {
    let session = get_session_sync(conn, session_id)?.ok_or_else(|| {
        LabLinkError::InvalidInput(format!("session {} not found", session_id))
    })?;
    let experimenter_id = session.experimenter_id.ok_or_else(|| {
        LabLinkError::InvalidInput(format!("session {} has no experimenter", session_id))
    })?;

    let subsessions = subsession_chain_sync(conn, session_id)?;
    if subsessions.is_empty() {
        return Err(LabLinkError::InvalidInput(format!(
            "session {} has no chained subsessions",
            session_id
        )));
    }

    let mut records = Vec::with_capacity(subsessions.len());
    for subsession in &subsessions {
        let record = subsession_experimenter_sync(conn, subsession.id)?.ok_or_else(|| {
            LabLinkError::InvalidInput(format!(
                "subsession {} has no experimenter record",
                subsession.id
            ))
        })?;
        records.push(record);
    }

    conn.execute(
        "UPDATE session_experimenters SET me_in_first_id = ?1 WHERE id = ?2",
        params![records[0].id, experimenter_id],
    )?;

    for window in records.windows(2) {
        conn.execute(
            "UPDATE subsession_users SET me_in_next_id = ?1 WHERE id = ?2",
            params![window[1].id, window[0].id],
        )?;
        conn.execute(
            "UPDATE subsession_users SET me_in_previous_id = ?1 WHERE id = ?2",
            params![window[0].id, window[1].id],
        )?;
    }

    for record in &records {
        conn.execute(
            "UPDATE subsession_users SET session_experimenter_id = ?1 WHERE id = ?2",
            params![experimenter_id, record.id],
        )?;
    }

    debug!(session_id, subsessions = subsessions.len(), "chained experimenters");
    Ok(())
}

/// The experimenter's per-subsession records in chain order.
pub fn experimenter_users_sync(
    conn: &Connection,
    experimenter_id: i64,
) -> Result<Vec<SubsessionUser>> {
    let experimenter = get_experimenter_sync(conn, experimenter_id)?.ok_or_else(|| {
        LabLinkError::InvalidInput(format!("experimenter {} not found", experimenter_id))
    })?;
    user_chain_sync(conn, experimenter.me_in_first_id).map_err(Into::into)
}

/// Mark the experimenter's start URL opened.
pub fn record_visit_sync(conn: &Connection, experimenter_id: i64, ip: Option<&str>) -> Result<()> {
    let updated = conn.execute(
        "UPDATE session_experimenters
         SET visited = 1, ip_address = COALESCE(?1, ip_address)
         WHERE id = ?2",
        params![ip, experimenter_id],
    )?;
    if updated == 0 {
        return Err(LabLinkError::InvalidInput(format!(
            "experimenter {} not found",
            experimenter_id
        )));
    }
    Ok(())
}

/// Replace the experimenter's variable bag.
pub fn update_vars_sync(
    conn: &Connection,
    experimenter_id: i64,
    vars: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "UPDATE session_experimenters SET vars = ?1 WHERE id = ?2",
        params![serde_json::to_string(vars)?, experimenter_id],
    )?;
    Ok(())
}

// ============================================================================
// Database impl methods
// ============================================================================

impl Database {
    pub fn create_experimenter(&self) -> Result<i64> {
        create_experimenter_sync(&self.conn())
    }

    pub fn get_experimenter(&self, id: i64) -> Result<Option<SessionExperimenter>> {
        get_experimenter_sync(&self.conn(), id).map_err(Into::into)
    }

    pub fn get_experimenter_by_code(&self, code: &str) -> Result<Option<SessionExperimenter>> {
        get_experimenter_by_code_sync(&self.conn(), code).map_err(Into::into)
    }

    pub fn attach_experimenter(&self, session_id: i64, experimenter_id: i64) -> Result<()> {
        attach_experimenter_sync(&self.conn(), session_id, experimenter_id)
    }

    pub fn session_for_experimenter(&self, experimenter_id: i64) -> Result<Option<Session>> {
        session_for_experimenter_sync(&self.conn(), experimenter_id).map_err(Into::into)
    }

    pub fn chain_experimenters(&self, session_id: i64) -> Result<()> {
        chain_experimenters_sync(&self.conn(), session_id)
    }

    /// The experimenter's per-subsession records in chain order
    pub fn experimenter_users(&self, experimenter_id: i64) -> Result<Vec<SubsessionUser>> {
        experimenter_users_sync(&self.conn(), experimenter_id)
    }

    pub fn record_experimenter_visit(&self, experimenter_id: i64, ip: Option<&str>) -> Result<()> {
        record_visit_sync(&self.conn(), experimenter_id, ip)
    }

    pub fn update_experimenter_vars(
        &self,
        experimenter_id: i64,
        vars: &serde_json::Value,
    ) -> Result<()> {
        update_vars_sync(&self.conn(), experimenter_id, vars)
    }
}
