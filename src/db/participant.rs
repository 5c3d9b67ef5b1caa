// db/participant.rs
// Session participant operations: lockstep chaining, payoff aggregation,
// progress and display helpers

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::session::subsession_chain_sync;
use super::subsession::{subsession_participants_sync, user_chain_sync};
use super::types::{SessionParticipant, SubsessionUser};
use super::{CODE_ALLOC_ATTEMPTS, Database, is_constraint_violation};
use crate::error::{LabLinkError, Result};
use crate::utils::{CODE_LENGTH, app_name_format, currency, random_code};

/// Parse one session_participants row (column order per PARTICIPANT_COLUMNS)
pub fn parse_participant_row(row: &Row) -> rusqlite::Result<SessionParticipant> {
    let vars_text: String = row.get(8)?;
    Ok(SessionParticipant {
        id: row.get(0)?,
        session_id: row.get(1)?,
        code: row.get(2)?,
        visited: row.get::<_, i32>(3)? != 0,
        last_request_succeeded: row.get::<_, Option<i32>>(4)?.map(|v| v != 0),
        ip_address: row.get(5)?,
        is_on_wait_page: row.get::<_, i32>(6)? != 0,
        current_page: row.get(7)?,
        vars: serde_json::from_str(&vars_text).unwrap_or_else(|_| serde_json::json!({})),
        index_in_subsessions: row.get(9)?,
        me_in_first_id: row.get(10)?,
        exclude_from_data_analysis: row.get::<_, i32>(11)? != 0,
        time_started: row.get(12)?,
        mturk_assignment_id: row.get(13)?,
        mturk_worker_id: row.get(14)?,
        label: row.get(15)?,
    })
}

const PARTICIPANT_COLUMNS: &str = "id, session_id, code, visited, last_request_succeeded, \
     ip_address, is_on_wait_page, current_page, vars, index_in_subsessions, me_in_first_id, \
     exclude_from_data_analysis, time_started, mturk_assignment_id, mturk_worker_id, label";

/// Insert a participant for a session, generating a fresh code.
pub fn create_participant_sync(
    conn: &Connection,
    session_id: i64,
    label: Option<&str>,
) -> Result<i64> {
    for _ in 0..CODE_ALLOC_ATTEMPTS {
        let code = random_code(CODE_LENGTH);
        let inserted = conn.execute(
            "INSERT INTO session_participants (session_id, code, label) VALUES (?1, ?2, ?3)",
            params![session_id, code, label],
        );
        match inserted {
            Ok(_) => return Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(LabLinkError::Other(
        "could not allocate a unique participant code".to_string(),
    ))
}

pub fn get_participant_sync(
    conn: &Connection,
    id: i64,
) -> rusqlite::Result<Option<SessionParticipant>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM session_participants WHERE id = ?1",
            PARTICIPANT_COLUMNS
        ),
        [id],
        parse_participant_row,
    )
    .optional()
}

pub fn get_participant_by_code_sync(
    conn: &Connection,
    code: &str,
) -> rusqlite::Result<Option<SessionParticipant>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM session_participants WHERE code = ?1",
            PARTICIPANT_COLUMNS
        ),
        [code],
        parse_participant_row,
    )
    .optional()
}

/// A session's participants in creation order
pub fn session_participants_sync(
    conn: &Connection,
    session_id: i64,
) -> rusqlite::Result<Vec<SessionParticipant>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM session_participants WHERE session_id = ?1 ORDER BY id",
        PARTICIPANT_COLUMNS
    ))?;
    let rows = stmt.query_map([session_id], parse_participant_row)?;
    rows.collect()
}

/// Wire the parallel per-participant chains across the session's
/// subsessions. Must run after chain_subsessions: points each
/// participant's chain head at the matching record of the first
/// subsession, then links the k-th records of adjacent subsessions
/// pairwise.
pub fn chain_participants_sync(conn: &Connection, session_id: i64) -> Result<()> {
    let participants = session_participants_sync(conn, session_id)?;
    let subsessions = subsession_chain_sync(conn, session_id)?;
    if subsessions.is_empty() {
        return Err(LabLinkError::InvalidInput(format!(
            "session {} has no chained subsessions",
            session_id
        )));
    }

    let mut records_per_subsession = Vec::with_capacity(subsessions.len());
    for subsession in &subsessions {
        let records = subsession_participants_sync(conn, subsession.id)?;
        if records.len() != participants.len() {
            return Err(LabLinkError::InvalidInput(format!(
                "subsession {} has {} participant records, session {} has {} participants",
                subsession.id,
                records.len(),
                session_id,
                participants.len()
            )));
        }
        records_per_subsession.push(records);
    }

    for (k, participant) in participants.iter().enumerate() {
        conn.execute(
            "UPDATE session_participants SET me_in_first_id = ?1 WHERE id = ?2",
            params![records_per_subsession[0][k].id, participant.id],
        )?;
    }

    for window in records_per_subsession.windows(2) {
        for k in 0..participants.len() {
            let left = window[0][k].id;
            let right = window[1][k].id;
            conn.execute(
                "UPDATE subsession_users SET me_in_next_id = ?1 WHERE id = ?2",
                params![right, left],
            )?;
            conn.execute(
                "UPDATE subsession_users SET me_in_previous_id = ?1 WHERE id = ?2",
                params![left, right],
            )?;
        }
    }

    debug!(
        session_id,
        participants = participants.len(),
        subsessions = subsessions.len(),
        "chained participants"
    );
    Ok(())
}

/// The participant's per-subsession records in chain order. Used to
/// calculate payoffs.
pub fn participant_users_sync(
    conn: &Connection,
    participant_id: i64,
) -> Result<Vec<SubsessionUser>> {
    let participant = require_participant(conn, participant_id)?;
    user_chain_sync(conn, participant.me_in_first_id).map_err(Into::into)
}

/// Sum of stage payoffs across the chain; a missing payoff counts as zero.
pub fn payoff_from_subsessions_sync(conn: &Connection, participant_id: i64) -> Result<i64> {
    let records = participant_users_sync(conn, participant_id)?;
    Ok(records.iter().map(|r| r.payoff.unwrap_or(0)).sum())
}

/// Whether every stage in the chain has a computed payoff.
pub fn payoff_from_subsessions_is_complete_sync(
    conn: &Connection,
    participant_id: i64,
) -> Result<bool> {
    let records = participant_users_sync(conn, participant_id)?;
    Ok(records.iter().all(|r| r.payoff.is_some()))
}

/// Base pay plus the participant's payoff sum, in cents.
pub fn total_pay_sync(conn: &Connection, participant_id: i64) -> Result<i64> {
    let participant = require_participant(conn, participant_id)?;
    let base_pay: i64 = conn.query_row(
        "SELECT base_pay FROM sessions WHERE id = ?1",
        [participant.session_id],
        |row| row.get(0),
    )?;
    Ok(base_pay + payoff_from_subsessions_sync(conn, participant_id)?)
}

/// Currency string for the payoff sum, suffixed while incomplete.
pub fn payoff_from_subsessions_display_sync(
    conn: &Connection,
    participant_id: i64,
) -> Result<String> {
    let payoff = currency(payoff_from_subsessions_sync(conn, participant_id)?);
    if payoff_from_subsessions_is_complete_sync(conn, participant_id)? {
        Ok(payoff)
    } else {
        Ok(format!("{} (incomplete)", payoff))
    }
}

/// Currency string for total pay. Failures in the computation are
/// swallowed into a display sentinel rather than propagated.
pub fn total_pay_display_sync(conn: &Connection, participant_id: i64) -> String {
    let (total, complete) = match (
        total_pay_sync(conn, participant_id),
        payoff_from_subsessions_is_complete_sync(conn, participant_id),
    ) {
        (Ok(total), Ok(complete)) => (total, complete),
        _ => return "Error in payoff calculation".to_string(),
    };
    if complete {
        currency(total)
    } else {
        format!("{} (incomplete)", currency(total))
    }
}

/// Progress string "i/N subsessions"; None until the start URL was opened.
pub fn subsessions_completed_sync(
    conn: &Connection,
    participant_id: i64,
) -> Result<Option<String>> {
    let participant = require_participant(conn, participant_id)?;
    if !participant.visited {
        return Ok(None);
    }
    let total = subsession_chain_sync(conn, participant.session_id)?.len();
    Ok(Some(format!(
        "{}/{} subsessions",
        participant.index_in_subsessions, total
    )))
}

/// Display name of the subsession the participant is currently on;
/// None until the start URL was opened.
pub fn current_subsession_sync(conn: &Connection, participant_id: i64) -> Result<Option<String>> {
    let participant = require_participant(conn, participant_id)?;
    if !participant.visited {
        return Ok(None);
    }
    let chain = subsession_chain_sync(conn, participant.session_id)?;
    Ok(chain
        .get(participant.index_in_subsessions as usize)
        .map(|subsession| app_name_format(&subsession.app_label)))
}

/// Mark the start URL opened: set visited, record the caller's address,
/// and stamp time_started on the first visit.
pub fn record_visit_sync(conn: &Connection, participant_id: i64, ip: Option<&str>) -> Result<()> {
    let updated = conn.execute(
        "UPDATE session_participants
         SET visited = 1,
             ip_address = COALESCE(?1, ip_address),
             time_started = COALESCE(time_started, ?2)
         WHERE id = ?3",
        params![ip, Utc::now().to_rfc3339(), participant_id],
    )?;
    if updated == 0 {
        return Err(LabLinkError::InvalidInput(format!(
            "participant {} not found",
            participant_id
        )));
    }
    Ok(())
}

/// Track the page the participant is on and whether it is a wait page.
pub fn record_page_sync(
    conn: &Connection,
    participant_id: i64,
    page: &str,
    on_wait_page: bool,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE session_participants SET current_page = ?1, is_on_wait_page = ?2 WHERE id = ?3",
        params![page, on_wait_page as i32, participant_id],
    )?;
    Ok(())
}

/// Health of the last server request made for this participant.
pub fn record_request_health_sync(
    conn: &Connection,
    participant_id: i64,
    succeeded: bool,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE session_participants SET last_request_succeeded = ?1 WHERE id = ?2",
        params![succeeded as i32, participant_id],
    )?;
    Ok(())
}

/// Replace the participant's variable bag.
pub fn update_vars_sync(
    conn: &Connection,
    participant_id: i64,
    vars: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "UPDATE session_participants SET vars = ?1 WHERE id = ?2",
        params![serde_json::to_string(vars)?, participant_id],
    )?;
    Ok(())
}

/// Advance the participant to a stage index (driven by page flow).
pub fn set_subsession_index_sync(
    conn: &Connection,
    participant_id: i64,
    index: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE session_participants SET index_in_subsessions = ?1 WHERE id = ?2",
        params![index, participant_id],
    )?;
    Ok(())
}

/// Flag data points to drop from analysis (e.g. a problem during the run).
pub fn set_exclude_from_analysis_sync(
    conn: &Connection,
    participant_id: i64,
    exclude: bool,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE session_participants SET exclude_from_data_analysis = ?1 WHERE id = ?2",
        params![exclude as i32, participant_id],
    )?;
    Ok(())
}

fn require_participant(conn: &Connection, participant_id: i64) -> Result<SessionParticipant> {
    get_participant_sync(conn, participant_id)?.ok_or_else(|| {
        LabLinkError::InvalidInput(format!("participant {} not found", participant_id))
    })
}

// ============================================================================
// Database impl methods
// ============================================================================

impl Database {
    pub fn create_participant(&self, session_id: i64, label: Option<&str>) -> Result<i64> {
        create_participant_sync(&self.conn(), session_id, label)
    }

    pub fn get_participant(&self, id: i64) -> Result<Option<SessionParticipant>> {
        get_participant_sync(&self.conn(), id).map_err(Into::into)
    }

    pub fn get_participant_by_code(&self, code: &str) -> Result<Option<SessionParticipant>> {
        get_participant_by_code_sync(&self.conn(), code).map_err(Into::into)
    }

    pub fn session_participants(&self, session_id: i64) -> Result<Vec<SessionParticipant>> {
        session_participants_sync(&self.conn(), session_id).map_err(Into::into)
    }

    pub fn chain_participants(&self, session_id: i64) -> Result<()> {
        chain_participants_sync(&self.conn(), session_id)
    }

    /// The participant's per-subsession records in chain order
    pub fn participant_users(&self, participant_id: i64) -> Result<Vec<SubsessionUser>> {
        participant_users_sync(&self.conn(), participant_id)
    }

    pub fn payoff_from_subsessions(&self, participant_id: i64) -> Result<i64> {
        payoff_from_subsessions_sync(&self.conn(), participant_id)
    }

    pub fn payoff_from_subsessions_is_complete(&self, participant_id: i64) -> Result<bool> {
        payoff_from_subsessions_is_complete_sync(&self.conn(), participant_id)
    }

    pub fn total_pay(&self, participant_id: i64) -> Result<i64> {
        total_pay_sync(&self.conn(), participant_id)
    }

    pub fn payoff_from_subsessions_display(&self, participant_id: i64) -> Result<String> {
        payoff_from_subsessions_display_sync(&self.conn(), participant_id)
    }

    pub fn total_pay_display(&self, participant_id: i64) -> String {
        total_pay_display_sync(&self.conn(), participant_id)
    }

    pub fn subsessions_completed(&self, participant_id: i64) -> Result<Option<String>> {
        subsessions_completed_sync(&self.conn(), participant_id)
    }

    pub fn current_subsession(&self, participant_id: i64) -> Result<Option<String>> {
        current_subsession_sync(&self.conn(), participant_id)
    }

    pub fn record_participant_visit(&self, participant_id: i64, ip: Option<&str>) -> Result<()> {
        record_visit_sync(&self.conn(), participant_id, ip)
    }

    pub fn record_participant_page(
        &self,
        participant_id: i64,
        page: &str,
        on_wait_page: bool,
    ) -> Result<()> {
        record_page_sync(&self.conn(), participant_id, page, on_wait_page).map_err(Into::into)
    }

    pub fn record_participant_request_health(
        &self,
        participant_id: i64,
        succeeded: bool,
    ) -> Result<()> {
        record_request_health_sync(&self.conn(), participant_id, succeeded).map_err(Into::into)
    }

    pub fn update_participant_vars(
        &self,
        participant_id: i64,
        vars: &serde_json::Value,
    ) -> Result<()> {
        update_vars_sync(&self.conn(), participant_id, vars)
    }

    pub fn set_participant_subsession_index(&self, participant_id: i64, index: i64) -> Result<()> {
        set_subsession_index_sync(&self.conn(), participant_id, index).map_err(Into::into)
    }

    pub fn set_exclude_from_analysis(&self, participant_id: i64, exclude: bool) -> Result<()> {
        set_exclude_from_analysis_sync(&self.conn(), participant_id, exclude).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::session::create_session_sync;
    use crate::db::subsession::{create_participant_record_sync, set_payoff_sync};
    use crate::db::test_support::{setup_chained_session, setup_test_connection};
    use crate::db::types::NewSession;

    /// Chained session with `participants` participants and their
    /// per-subsession records wired in lockstep.
    fn setup_populated_session(
        conn: &Connection,
        apps: &[&str],
        participants: usize,
        base_pay: i64,
    ) -> (i64, Vec<i64>, Vec<i64>) {
        let (session_id, subsession_ids) = setup_chained_session(conn, apps);
        conn.execute(
            "UPDATE sessions SET base_pay = ?1 WHERE id = ?2",
            params![base_pay, session_id],
        )
        .unwrap();

        let participant_ids: Vec<i64> = (0..participants)
            .map(|_| create_participant_sync(conn, session_id, None).unwrap())
            .collect();
        for &subsession_id in &subsession_ids {
            for &participant_id in &participant_ids {
                create_participant_record_sync(conn, subsession_id, Some(participant_id)).unwrap();
            }
        }
        chain_participants_sync(conn, session_id).unwrap();
        (session_id, subsession_ids, participant_ids)
    }

    #[test]
    fn test_create_participant_generates_code() {
        let conn = setup_test_connection();
        let session_id = create_session_sync(&conn, &NewSession::default()).unwrap();
        let id = create_participant_sync(&conn, session_id, Some("P1")).unwrap();

        let participant = get_participant_sync(&conn, id).unwrap().unwrap();
        assert_eq!(participant.code.len(), CODE_LENGTH);
        assert_eq!(participant.label.as_deref(), Some("P1"));
        assert!(!participant.visited);
        assert_eq!(participant.vars, serde_json::json!({}));

        let by_code = get_participant_by_code_sync(&conn, &participant.code)
            .unwrap()
            .unwrap();
        assert_eq!(by_code.id, id);
    }

    #[test]
    fn test_chain_participants_lockstep() {
        let conn = setup_test_connection();
        let (_, subsession_ids, participant_ids) =
            setup_populated_session(&conn, &["dictator", "trust", "public_goods"], 2, 0);

        // Participant k traverses exactly the k-th record of every subsession
        for (k, &participant_id) in participant_ids.iter().enumerate() {
            let chain = participant_users_sync(&conn, participant_id).unwrap();
            assert_eq!(chain.len(), subsession_ids.len());
            for (record, &subsession_id) in chain.iter().zip(&subsession_ids) {
                assert_eq!(record.subsession_id, subsession_id);
                assert_eq!(record.session_participant_id, Some(participant_id));
            }
            let expected: Vec<i64> = subsession_ids
                .iter()
                .map(|&sid| subsession_participants_sync(&conn, sid).unwrap()[k].id)
                .collect();
            assert_eq!(chain.iter().map(|r| r.id).collect::<Vec<_>>(), expected);
        }

        // previous pointers mirror next pointers
        let chain = participant_users_sync(&conn, participant_ids[0]).unwrap();
        assert_eq!(chain[1].me_in_previous_id, Some(chain[0].id));
        assert!(chain[0].me_in_previous_id.is_none());
        assert!(chain[2].me_in_next_id.is_none());
    }

    #[test]
    fn test_chain_participants_requires_chained_subsessions() {
        let conn = setup_test_connection();
        let session_id = create_session_sync(&conn, &NewSession::default()).unwrap();
        create_participant_sync(&conn, session_id, None).unwrap();

        let err = chain_participants_sync(&conn, session_id).unwrap_err();
        assert!(matches!(err, LabLinkError::InvalidInput(_)));
    }

    #[test]
    fn test_chain_participants_rejects_count_mismatch() {
        let conn = setup_test_connection();
        let (session_id, subsession_ids) = setup_chained_session(&conn, &["trust"]);
        create_participant_sync(&conn, session_id, None).unwrap();
        create_participant_sync(&conn, session_id, None).unwrap();
        // Only one record in the subsession for two participants
        create_participant_record_sync(&conn, subsession_ids[0], None).unwrap();

        let err = chain_participants_sync(&conn, session_id).unwrap_err();
        assert!(matches!(err, LabLinkError::InvalidInput(_)));
    }

    #[test]
    fn test_payoff_partial_sum_and_completeness() {
        let conn = setup_test_connection();
        let (_, _, participant_ids) =
            setup_populated_session(&conn, &["a", "b", "c"], 1, 0);
        let participant_id = participant_ids[0];

        let records = participant_users_sync(&conn, participant_id).unwrap();
        set_payoff_sync(&conn, records[0].id, Some(5)).unwrap();
        set_payoff_sync(&conn, records[2].id, Some(3)).unwrap();

        assert_eq!(payoff_from_subsessions_sync(&conn, participant_id).unwrap(), 8);
        assert!(!payoff_from_subsessions_is_complete_sync(&conn, participant_id).unwrap());
        assert_eq!(
            payoff_from_subsessions_display_sync(&conn, participant_id).unwrap(),
            "$0.08 (incomplete)"
        );
    }

    #[test]
    fn test_total_pay_complete() {
        let conn = setup_test_connection();
        let (_, _, participant_ids) = setup_populated_session(&conn, &["a", "b"], 1, 100);
        let participant_id = participant_ids[0];

        let records = participant_users_sync(&conn, participant_id).unwrap();
        set_payoff_sync(&conn, records[0].id, Some(5)).unwrap();
        set_payoff_sync(&conn, records[1].id, Some(3)).unwrap();

        assert_eq!(total_pay_sync(&conn, participant_id).unwrap(), 108);
        assert_eq!(total_pay_display_sync(&conn, participant_id), "$1.08");
    }

    #[test]
    fn test_total_pay_display_incomplete_and_error() {
        let conn = setup_test_connection();
        let (_, _, participant_ids) = setup_populated_session(&conn, &["a", "b"], 1, 100);
        let participant_id = participant_ids[0];

        let records = participant_users_sync(&conn, participant_id).unwrap();
        set_payoff_sync(&conn, records[0].id, Some(8)).unwrap();
        assert_eq!(
            total_pay_display_sync(&conn, participant_id),
            "$1.08 (incomplete)"
        );

        // Unknown participant collapses to the sentinel
        assert_eq!(total_pay_display_sync(&conn, 9999), "Error in payoff calculation");
    }

    #[test]
    fn test_empty_chain_is_vacuously_complete() {
        let conn = setup_test_connection();
        let session_id = create_session_sync(&conn, &NewSession::default()).unwrap();
        let participant_id = create_participant_sync(&conn, session_id, None).unwrap();

        assert_eq!(payoff_from_subsessions_sync(&conn, participant_id).unwrap(), 0);
        assert!(payoff_from_subsessions_is_complete_sync(&conn, participant_id).unwrap());
    }

    #[test]
    fn test_progress_helpers_require_visit() {
        let conn = setup_test_connection();
        let (_, _, participant_ids) =
            setup_populated_session(&conn, &["dictator", "trust"], 1, 0);
        let participant_id = participant_ids[0];

        assert!(subsessions_completed_sync(&conn, participant_id).unwrap().is_none());
        assert!(current_subsession_sync(&conn, participant_id).unwrap().is_none());

        record_visit_sync(&conn, participant_id, Some("10.0.0.7")).unwrap();
        set_subsession_index_sync(&conn, participant_id, 1).unwrap();

        assert_eq!(
            subsessions_completed_sync(&conn, participant_id).unwrap().as_deref(),
            Some("1/2 subsessions")
        );
        assert_eq!(
            current_subsession_sync(&conn, participant_id).unwrap().as_deref(),
            Some("Trust")
        );

        let participant = get_participant_sync(&conn, participant_id).unwrap().unwrap();
        assert_eq!(participant.ip_address.as_deref(), Some("10.0.0.7"));
        assert!(participant.time_started.is_some());
    }

    #[test]
    fn test_state_setters() {
        let conn = setup_test_connection();
        let session_id = create_session_sync(&conn, &NewSession::default()).unwrap();
        let participant_id = create_participant_sync(&conn, session_id, None).unwrap();

        record_page_sync(&conn, participant_id, "Contribute", true).unwrap();
        record_request_health_sync(&conn, participant_id, true).unwrap();
        set_exclude_from_analysis_sync(&conn, participant_id, true).unwrap();
        update_vars_sync(&conn, participant_id, &serde_json::json!({"round": 2})).unwrap();

        let participant = get_participant_sync(&conn, participant_id).unwrap().unwrap();
        assert_eq!(participant.current_page.as_deref(), Some("Contribute"));
        assert!(participant.is_on_wait_page);
        assert_eq!(participant.status(), "Waiting");
        assert_eq!(participant.last_request_succeeded, Some(true));
        assert!(participant.exclude_from_data_analysis);
        assert_eq!(participant.vars["round"], 2);
    }
}
