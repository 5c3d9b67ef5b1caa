// db/test_support.rs
// Shared test helpers for database tests

use rusqlite::Connection;

use super::session::{add_subsession_sync, chain_subsessions_sync, create_session_sync};
use super::subsession::create_subsession_sync;
use super::types::NewSession;

/// In-memory connection with the full schema applied
pub fn setup_test_connection() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .expect("enable foreign keys");
    super::schema::run_all_migrations(&conn).expect("run migrations");
    conn
}

/// Session with one subsession per app label, added and chained.
/// Returns the session id and the subsession ids in chain order.
pub fn setup_chained_session(conn: &Connection, apps: &[&str]) -> (i64, Vec<i64>) {
    let session_id = create_session_sync(conn, &NewSession::default()).expect("create session");
    let subsession_ids: Vec<i64> = apps
        .iter()
        .map(|app| create_subsession_sync(conn, app, None).expect("create subsession"))
        .collect();
    for &subsession_id in &subsession_ids {
        add_subsession_sync(conn, session_id, subsession_id).expect("add subsession");
    }
    chain_subsessions_sync(conn, session_id, &subsession_ids).expect("chain subsessions");
    (session_id, subsession_ids)
}
