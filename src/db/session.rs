// db/session.rs
// Session lifecycle, subsession chaining, and chain traversal

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use super::types::{NewSession, Session, Subsession};
use super::{CODE_ALLOC_ATTEMPTS, Database, is_constraint_violation};
use crate::error::{LabLinkError, Result};
use crate::utils::{CODE_LENGTH, app_name_format, random_code};

/// Parse one sessions row (column order per SESSION_COLUMNS)
pub fn parse_session_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        session_type: row.get(1)?,
        label: row.get(2)?,
        code: row.get(3)?,
        experimenter_id: row.get(4)?,
        time_started: row.get(5)?,
        first_subsession_id: row.get(6)?,
        is_for_mturk: row.get::<_, i32>(7)? != 0,
        mturk_payment_was_sent: row.get::<_, i32>(8)? != 0,
        hidden: row.get::<_, i32>(9)? != 0,
        git_commit_timestamp: row.get(10)?,
        base_pay: row.get(11)?,
        comment: row.get(12)?,
        participants_assigned: row.get::<_, i32>(13)? != 0,
        special_category: row.get(14)?,
        demo_already_used: row.get::<_, i32>(15)? != 0,
        ready: row.get::<_, i32>(16)? != 0,
        created_at: row.get(17)?,
    })
}

pub(crate) const SESSION_COLUMNS: &str = "id, session_type, label, code, experimenter_id, \
     time_started, first_subsession_id, is_for_mturk, mturk_payment_was_sent, hidden, \
     git_commit_timestamp, base_pay, comment, participants_assigned, special_category, \
     demo_already_used, ready, created_at";

/// Insert a session with a freshly generated code, retrying on the
/// unlikely code collision.
pub fn create_session_sync(conn: &Connection, new: &NewSession) -> Result<i64> {
    for _ in 0..CODE_ALLOC_ATTEMPTS {
        let code = random_code(CODE_LENGTH);
        let inserted = conn.execute(
            "INSERT INTO sessions (session_type, label, code, is_for_mturk, base_pay,
                                   special_category, git_commit_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.session_type,
                new.label,
                code,
                new.is_for_mturk as i32,
                new.base_pay,
                new.special_category,
                new.git_commit_timestamp,
            ],
        );
        match inserted {
            Ok(_) => return Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(LabLinkError::Other(
        "could not allocate a unique session code".to_string(),
    ))
}

pub fn get_session_sync(conn: &Connection, id: i64) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
        [id],
        parse_session_row,
    )
    .optional()
}

pub fn get_session_by_code_sync(conn: &Connection, code: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {} FROM sessions WHERE code = ?1", SESSION_COLUMNS),
        [code],
        parse_session_row,
    )
    .optional()
}

/// All sessions in creation order, optionally with hidden ones
pub fn list_sessions_sync(conn: &Connection, include_hidden: bool) -> rusqlite::Result<Vec<Session>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sessions WHERE hidden = 0 OR ?1 ORDER BY id",
        SESSION_COLUMNS
    ))?;
    let rows = stmt.query_map([include_hidden as i32], parse_session_row)?;
    rows.collect()
}

/// Link an ordered sequence of subsessions into the session's singly
/// linked chain: next/previous pointers, 0-based position indices, and
/// the session's head pointer.
pub fn chain_subsessions_sync(
    conn: &Connection,
    session_id: i64,
    subsession_ids: &[i64],
) -> Result<()> {
    let Some(&first) = subsession_ids.first() else {
        return Err(LabLinkError::InvalidInput(
            "cannot chain an empty subsession sequence".to_string(),
        ));
    };

    for pair in subsession_ids.windows(2) {
        conn.execute(
            "UPDATE subsessions SET next_subsession_id = ?1 WHERE id = ?2",
            params![pair[1], pair[0]],
        )?;
        conn.execute(
            "UPDATE subsessions SET previous_subsession_id = ?1 WHERE id = ?2",
            params![pair[0], pair[1]],
        )?;
    }

    for (index, &subsession_id) in subsession_ids.iter().enumerate() {
        let updated = conn.execute(
            "UPDATE subsessions SET index_in_subsessions = ?1 WHERE id = ?2",
            params![index as i64, subsession_id],
        )?;
        if updated == 0 {
            return Err(LabLinkError::InvalidInput(format!(
                "subsession {} not found",
                subsession_id
            )));
        }
    }

    let updated = conn.execute(
        "UPDATE sessions SET first_subsession_id = ?1 WHERE id = ?2",
        params![first, session_id],
    )?;
    if updated == 0 {
        return Err(LabLinkError::InvalidInput(format!(
            "session {} not found",
            session_id
        )));
    }

    debug!(session_id, count = subsession_ids.len(), "chained subsessions");
    Ok(())
}

/// Assign session ownership to a subsession and all its treatments.
pub fn add_subsession_sync(conn: &Connection, session_id: i64, subsession_id: i64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE subsessions SET session_id = ?1 WHERE id = ?2",
        params![session_id, subsession_id],
    )?;
    if updated == 0 {
        return Err(LabLinkError::InvalidInput(format!(
            "subsession {} not found",
            subsession_id
        )));
    }
    conn.execute(
        "UPDATE treatments SET session_id = ?1 WHERE subsession_id = ?2",
        params![session_id, subsession_id],
    )?;
    debug!(session_id, subsession_id, "added subsession to session");
    Ok(())
}

/// Walk the subsession chain from the session's head pointer until the
/// null terminator. No cycle detection; chains are assumed well-formed
/// by chain_subsessions.
pub fn subsession_chain_sync(conn: &Connection, session_id: i64) -> rusqlite::Result<Vec<Subsession>> {
    let head: Option<i64> = conn
        .query_row(
            "SELECT first_subsession_id FROM sessions WHERE id = ?1",
            [session_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let mut chain = Vec::new();
    let mut cursor = head;
    while let Some(id) = cursor {
        match super::subsession::get_subsession_sync(conn, id)? {
            Some(subsession) => {
                cursor = subsession.next_subsession_id;
                chain.push(subsession);
            }
            None => break,
        }
    }
    Ok(chain)
}

/// Comma-joined display names of the chained subsessions, e.g.
/// "Prisoner Dilemma #1, Trust #2", or "[empty sequence]".
pub fn subsession_names_sync(conn: &Connection, session_id: i64) -> rusqlite::Result<String> {
    let chain = subsession_chain_sync(conn, session_id)?;
    if chain.is_empty() {
        return Ok("[empty sequence]".to_string());
    }
    Ok(chain
        .iter()
        .map(|s| format!("{} {}", app_name_format(&s.app_label), s.name()))
        .collect::<Vec<_>>()
        .join(", "))
}

/// Delete a session and every subsession in its chain. Dependent rows
/// (participants, treatments, per-subsession records) are cleared by the
/// schema's cascade rules.
pub fn delete_session_sync(conn: &Connection, session_id: i64) -> Result<()> {
    let chain = subsession_chain_sync(conn, session_id)?;
    for subsession in &chain {
        conn.execute("DELETE FROM subsessions WHERE id = ?1", [subsession.id])?;
    }
    let removed = conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
    if removed == 0 {
        return Err(LabLinkError::InvalidInput(format!(
            "session {} not found",
            session_id
        )));
    }
    info!(session_id, subsessions = chain.len(), "deleted session and its chain");
    Ok(())
}

/// True once every participant's payoff chain is fully computed.
pub fn payments_ready_sync(conn: &Connection, session_id: i64) -> Result<bool> {
    let mut stmt =
        conn.prepare("SELECT id FROM session_participants WHERE session_id = ?1 ORDER BY id")?;
    let participant_ids: Vec<i64> = stmt
        .query_map([session_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    for participant_id in participant_ids {
        if !super::participant::payoff_from_subsessions_is_complete_sync(conn, participant_id)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Stamp the session's start time (set when the experimenter opens it).
pub fn start_session_sync(conn: &Connection, session_id: i64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE sessions SET time_started = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), session_id],
    )?;
    if updated == 0 {
        return Err(LabLinkError::InvalidInput(format!(
            "session {} not found",
            session_id
        )));
    }
    Ok(())
}

/// Record that treatment/match assignment has run for this session.
pub fn mark_participants_assigned_sync(conn: &Connection, session_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sessions SET participants_assigned = 1 WHERE id = ?1",
        [session_id],
    )?;
    Ok(())
}

/// Record that the whole session hierarchy has been created.
pub fn mark_ready_sync(conn: &Connection, session_id: i64) -> rusqlite::Result<()> {
    conn.execute("UPDATE sessions SET ready = 1 WHERE id = ?1", [session_id])?;
    Ok(())
}

// ============================================================================
// Database impl methods
// ============================================================================

impl Database {
    pub fn create_session(&self, new: &NewSession) -> Result<i64> {
        create_session_sync(&self.conn(), new)
    }

    pub fn get_session(&self, id: i64) -> Result<Option<Session>> {
        get_session_sync(&self.conn(), id).map_err(Into::into)
    }

    pub fn get_session_by_code(&self, code: &str) -> Result<Option<Session>> {
        get_session_by_code_sync(&self.conn(), code).map_err(Into::into)
    }

    pub fn list_sessions(&self, include_hidden: bool) -> Result<Vec<Session>> {
        list_sessions_sync(&self.conn(), include_hidden).map_err(Into::into)
    }

    pub fn chain_subsessions(&self, session_id: i64, subsession_ids: &[i64]) -> Result<()> {
        chain_subsessions_sync(&self.conn(), session_id, subsession_ids)
    }

    pub fn add_subsession(&self, session_id: i64, subsession_id: i64) -> Result<()> {
        add_subsession_sync(&self.conn(), session_id, subsession_id)
    }

    /// The session's subsessions in chain order
    pub fn subsessions(&self, session_id: i64) -> Result<Vec<Subsession>> {
        subsession_chain_sync(&self.conn(), session_id).map_err(Into::into)
    }

    pub fn subsession_names(&self, session_id: i64) -> Result<String> {
        subsession_names_sync(&self.conn(), session_id).map_err(Into::into)
    }

    pub fn delete_session(&self, session_id: i64) -> Result<()> {
        delete_session_sync(&self.conn(), session_id)
    }

    pub fn payments_ready(&self, session_id: i64) -> Result<bool> {
        payments_ready_sync(&self.conn(), session_id)
    }

    pub fn start_session(&self, session_id: i64) -> Result<()> {
        start_session_sync(&self.conn(), session_id)
    }

    pub fn mark_participants_assigned(&self, session_id: i64) -> Result<()> {
        mark_participants_assigned_sync(&self.conn(), session_id).map_err(Into::into)
    }

    pub fn mark_ready(&self, session_id: i64) -> Result<()> {
        mark_ready_sync(&self.conn(), session_id).map_err(Into::into)
    }
}
