// db/subsession.rs
// Subsession, treatment, and per-subsession actor record operations

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Database;
use super::types::{Subsession, SubsessionUser, Treatment, UserRole};

pub(crate) fn parse_subsession_row(row: &Row) -> rusqlite::Result<Subsession> {
    Ok(Subsession {
        id: row.get(0)?,
        session_id: row.get(1)?,
        app_label: row.get(2)?,
        label: row.get(3)?,
        index_in_subsessions: row.get(4)?,
        next_subsession_id: row.get(5)?,
        previous_subsession_id: row.get(6)?,
    })
}

pub(crate) fn parse_subsession_user_row(row: &Row) -> rusqlite::Result<SubsessionUser> {
    let role_text: String = row.get(2)?;
    let role = role_text.parse::<UserRole>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(SubsessionUser {
        id: row.get(0)?,
        subsession_id: row.get(1)?,
        role,
        payoff: row.get(3)?,
        session_participant_id: row.get(4)?,
        session_experimenter_id: row.get(5)?,
        me_in_next_id: row.get(6)?,
        me_in_previous_id: row.get(7)?,
    })
}

const SUBSESSION_COLUMNS: &str = "id, session_id, app_label, label, index_in_subsessions, \
     next_subsession_id, previous_subsession_id";

const SUBSESSION_USER_COLUMNS: &str = "id, subsession_id, role, payoff, \
     session_participant_id, session_experimenter_id, me_in_next_id, me_in_previous_id";

/// Create a subsession row for an experiment app. Ownership (session
/// foreign key) is assigned later by add_subsession.
pub fn create_subsession_sync(
    conn: &Connection,
    app_label: &str,
    label: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO subsessions (app_label, label) VALUES (?1, ?2)",
        params![app_label, label],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_subsession_sync(conn: &Connection, id: i64) -> rusqlite::Result<Option<Subsession>> {
    conn.query_row(
        &format!("SELECT {} FROM subsessions WHERE id = ?1", SUBSESSION_COLUMNS),
        [id],
        parse_subsession_row,
    )
    .optional()
}

pub fn create_treatment_sync(
    conn: &Connection,
    subsession_id: i64,
    label: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO treatments (subsession_id, label) VALUES (?1, ?2)",
        params![subsession_id, label],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn treatments_sync(conn: &Connection, subsession_id: i64) -> rusqlite::Result<Vec<Treatment>> {
    let mut stmt = conn.prepare(
        "SELECT id, subsession_id, session_id, label FROM treatments
         WHERE subsession_id = ?1
         ORDER BY id",
    )?;
    let rows = stmt.query_map([subsession_id], |row| {
        Ok(Treatment {
            id: row.get(0)?,
            subsession_id: row.get(1)?,
            session_id: row.get(2)?,
            label: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// Create the per-subsession record for one participant.
pub fn create_participant_record_sync(
    conn: &Connection,
    subsession_id: i64,
    session_participant_id: Option<i64>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO subsession_users (subsession_id, role, session_participant_id)
         VALUES (?1, 'participant', ?2)",
        params![subsession_id, session_participant_id],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Create the per-subsession experimenter record. The owning session
/// experimenter is wired in by chain_experimenters.
pub fn create_experimenter_record_sync(
    conn: &Connection,
    subsession_id: i64,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO subsession_users (subsession_id, role) VALUES (?1, 'experimenter')",
        params![subsession_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_subsession_user_sync(
    conn: &Connection,
    id: i64,
) -> rusqlite::Result<Option<SubsessionUser>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM subsession_users WHERE id = ?1",
            SUBSESSION_USER_COLUMNS
        ),
        [id],
        parse_subsession_user_row,
    )
    .optional()
}

/// Participant records of one subsession, in creation order. Creation
/// order matches the session's participant order, which the lockstep
/// chaining relies on.
pub fn subsession_participants_sync(
    conn: &Connection,
    subsession_id: i64,
) -> rusqlite::Result<Vec<SubsessionUser>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM subsession_users
         WHERE subsession_id = ?1 AND role = 'participant'
         ORDER BY id",
        SUBSESSION_USER_COLUMNS
    ))?;
    let rows = stmt.query_map([subsession_id], parse_subsession_user_row)?;
    rows.collect()
}

pub fn subsession_experimenter_sync(
    conn: &Connection,
    subsession_id: i64,
) -> rusqlite::Result<Option<SubsessionUser>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM subsession_users
             WHERE subsession_id = ?1 AND role = 'experimenter'
             ORDER BY id LIMIT 1",
            SUBSESSION_USER_COLUMNS
        ),
        [subsession_id],
        parse_subsession_user_row,
    )
    .optional()
}

/// Record a stage payoff (cents) for one per-subsession record.
pub fn set_payoff_sync(
    conn: &Connection,
    record_id: i64,
    payoff: Option<i64>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE subsession_users SET payoff = ?1 WHERE id = ?2",
        params![payoff, record_id],
    )?;
    Ok(())
}

/// Walk a per-actor record chain from its head until the null terminator.
/// No cycle detection; chains are assumed well-formed by the chaining
/// operations.
pub fn user_chain_sync(
    conn: &Connection,
    head: Option<i64>,
) -> rusqlite::Result<Vec<SubsessionUser>> {
    let mut chain = Vec::new();
    let mut cursor = head;
    while let Some(id) = cursor {
        match get_subsession_user_sync(conn, id)? {
            Some(record) => {
                cursor = record.me_in_next_id;
                chain.push(record);
            }
            None => break,
        }
    }
    Ok(chain)
}

// ============================================================================
// Database impl methods
// ============================================================================

impl Database {
    pub fn create_subsession(&self, app_label: &str, label: Option<&str>) -> crate::Result<i64> {
        create_subsession_sync(&self.conn(), app_label, label).map_err(Into::into)
    }

    pub fn get_subsession(&self, id: i64) -> crate::Result<Option<Subsession>> {
        get_subsession_sync(&self.conn(), id).map_err(Into::into)
    }

    pub fn create_treatment(&self, subsession_id: i64, label: Option<&str>) -> crate::Result<i64> {
        create_treatment_sync(&self.conn(), subsession_id, label).map_err(Into::into)
    }

    pub fn treatments(&self, subsession_id: i64) -> crate::Result<Vec<Treatment>> {
        treatments_sync(&self.conn(), subsession_id).map_err(Into::into)
    }

    pub fn create_participant_record(
        &self,
        subsession_id: i64,
        session_participant_id: Option<i64>,
    ) -> crate::Result<i64> {
        create_participant_record_sync(&self.conn(), subsession_id, session_participant_id)
            .map_err(Into::into)
    }

    pub fn create_experimenter_record(&self, subsession_id: i64) -> crate::Result<i64> {
        create_experimenter_record_sync(&self.conn(), subsession_id).map_err(Into::into)
    }

    pub fn subsession_participants(&self, subsession_id: i64) -> crate::Result<Vec<SubsessionUser>> {
        subsession_participants_sync(&self.conn(), subsession_id).map_err(Into::into)
    }

    pub fn subsession_experimenter(
        &self,
        subsession_id: i64,
    ) -> crate::Result<Option<SubsessionUser>> {
        subsession_experimenter_sync(&self.conn(), subsession_id).map_err(Into::into)
    }

    pub fn set_payoff(&self, record_id: i64, payoff: Option<i64>) -> crate::Result<()> {
        set_payoff_sync(&self.conn(), record_id, payoff).map_err(Into::into)
    }
}
